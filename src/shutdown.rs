//! Cooperative cancellation shared by the spooler and the dispatcher.
//!
//! The signal is a zero-capacity channel whose only sender is dropped on
//! cancel. Waiters see a disconnect, which lets them `select!` on shutdown
//! next to a row send or receive instead of polling a flag. Async code waits
//! on a `watch` channel flipped at the same moment.

use crate::error::{IngexError, Result};
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, select};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Cloneable handle to one process-wide cancellation signal.
#[derive(Clone)]
pub struct Shutdown {
    trigger: Arc<Mutex<Option<Sender<()>>>>,
    signal: Receiver<()>,
    notify: Arc<watch::Sender<bool>>,
}

impl Shutdown {
    #[must_use]
    pub fn new() -> Self {
        let (tx, rx) = crossbeam_channel::bounded(0);
        let (notify, _) = watch::channel(false);
        Self {
            trigger: Arc::new(Mutex::new(Some(tx))),
            signal: rx,
            notify: Arc::new(notify),
        }
    }

    /// Request shutdown. Idempotent.
    pub fn cancel(&self) {
        if self.trigger.lock().take().is_some() {
            self.notify.send_replace(true);
            tracing::info!("Shutdown requested");
        }
    }

    /// Resolves once shutdown is requested. For `tokio::select!`.
    pub async fn cancelled(&self) {
        let mut rx = self.notify.subscribe();
        // The sender lives as long as `self`, so this only returns on cancel.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// Run blocking `work` on a helper thread named `name` and wait for it
    /// unless shutdown is requested.
    ///
    /// Once cancelled, the work gets `grace` to finish; after that it is
    /// abandoned and left to end on its own thread. Work started after
    /// cancellation gets the same `grace`, which bounds best-effort flushes
    /// during drain.
    ///
    /// # Errors
    ///
    /// Returns [`IngexError::Cancelled`] if the work did not finish within
    /// `grace` of cancellation, or an error if the helper thread could not
    /// start or died without a result.
    pub fn run_interruptible<T, F>(&self, name: &str, grace: Duration, work: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                // The waiter may have given up already.
                let _ = tx.send(work());
            })
            .map_err(|e| IngexError::with_context(format!("Failed to spawn {name} thread"), e))?;

        let lost = || IngexError::Other(anyhow::anyhow!("{name} thread exited without a result"));
        select! {
            recv(rx) -> done => done.map_err(|_| lost()),
            recv(self.signal) -> _ => match rx.recv_timeout(grace) {
                Ok(value) => Ok(value),
                Err(RecvTimeoutError::Timeout) => {
                    tracing::warn!(operation = name, grace_ms = grace.as_millis(), "Abandoning call after shutdown");
                    Err(IngexError::Cancelled)
                }
                Err(RecvTimeoutError::Disconnected) => Err(lost()),
            },
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.trigger.lock().is_none()
    }

    /// Receiver that becomes disconnected once shutdown is requested. Use it
    /// as an arm of `crossbeam_channel::select!`.
    #[must_use]
    pub const fn signal(&self) -> &Receiver<()> {
        &self.signal
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` when the
    /// wait ended because of cancellation.
    #[must_use]
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        match self.signal.recv_timeout(timeout) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => true,
        }
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Shutdown {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shutdown")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn starts_uncancelled() {
        let shutdown = Shutdown::new();
        assert!(!shutdown.is_cancelled());
        assert!(!shutdown.wait_timeout(Duration::from_millis(5)));
    }

    #[test]
    fn cancel_is_seen_by_clones() {
        let shutdown = Shutdown::new();
        let clone = shutdown.clone();
        shutdown.cancel();
        shutdown.cancel();
        assert!(clone.is_cancelled());
        assert!(clone.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn cancel_wakes_a_sleeping_waiter() {
        let shutdown = Shutdown::new();
        let waiter = shutdown.clone();
        let start = Instant::now();
        let handle = std::thread::spawn(move || waiter.wait_timeout(Duration::from_secs(30)));
        std::thread::sleep(Duration::from_millis(20));
        shutdown.cancel();
        assert!(handle.join().unwrap());
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn interruptible_work_returns_its_value() {
        let shutdown = Shutdown::new();
        let value = shutdown
            .run_interruptible("test-work", Duration::from_millis(10), || 42)
            .unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn stuck_work_is_abandoned_after_cancel() {
        let shutdown = Shutdown::new();
        let canceller = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(50));
            canceller.cancel();
        });

        let start = Instant::now();
        let result = shutdown.run_interruptible("test-stuck", Duration::from_millis(50), || {
            std::thread::sleep(Duration::from_secs(30));
        });
        assert!(matches!(result, Err(IngexError::Cancelled)));
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn work_started_after_cancel_gets_the_grace_period() {
        let shutdown = Shutdown::new();
        shutdown.cancel();
        let value = shutdown
            .run_interruptible("test-drain", Duration::from_secs(5), || {
                std::thread::sleep(Duration::from_millis(20));
                "flushed"
            })
            .unwrap();
        assert_eq!(value, "flushed");
    }

    #[test]
    fn cancelled_future_resolves_on_cancel() {
        let shutdown = Shutdown::new();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let canceller = shutdown.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            canceller.cancel();
        });
        let finished = runtime.block_on(async {
            tokio::time::timeout(Duration::from_secs(10), shutdown.cancelled())
                .await
                .is_ok()
        });
        assert!(finished);
    }
}
