//! Archives in an S3 bucket.
//!
//! The AWS SDK is async; the source owns a current-thread runtime and blocks
//! on it from the spooler thread. Every call races the shutdown signal, so a
//! stalled connection never outlives cancellation. Objects are requested as
//! requester-pays and are never deleted.

use super::{ArchiveSource, Candidate};
use crate::error::{IngexError, Result};
use crate::shutdown::Shutdown;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::types::RequestPayer;
use std::future::Future;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::runtime::Runtime;
use tracing::{debug, info};

pub struct S3Source {
    bucket: String,
    prefix: String,
    client: Client,
    runtime: Runtime,
    shutdown: Shutdown,
}

fn build_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| IngexError::with_context("Failed to create object store runtime", e))
}

impl S3Source {
    /// Build a client from the default AWS credential chain for `region`.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created, or `Cancelled` if
    /// shutdown arrives while credentials are being resolved.
    pub fn connect(
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        region: impl Into<String>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        let region = region.into();
        let runtime = build_runtime()?;

        let config = runtime.block_on(async {
            tokio::select! {
                config = aws_config::defaults(aws_config::BehaviorVersion::latest())
                    .region(Region::new(region.clone()))
                    .load() => Ok(config),
                () = shutdown.cancelled() => Err(IngexError::Cancelled),
            }
        })?;

        let source = Self::from_parts(Client::new(&config), bucket.into(), prefix.into(), runtime, shutdown);
        info!(bucket = %source.bucket, prefix = %source.prefix, region = %region, "Initialized S3 client");
        Ok(source)
    }

    /// Use an already configured client, such as one with a custom endpoint.
    ///
    /// # Errors
    ///
    /// Returns an error if the runtime cannot be created.
    pub fn with_client(
        client: Client,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        shutdown: Shutdown,
    ) -> Result<Self> {
        Ok(Self::from_parts(client, bucket.into(), prefix.into(), build_runtime()?, shutdown))
    }

    const fn from_parts(client: Client, bucket: String, prefix: String, runtime: Runtime, shutdown: Shutdown) -> Self {
        Self {
            bucket,
            prefix,
            client,
            runtime,
            shutdown,
        }
    }

    /// Drive `work` to completion unless shutdown is requested first.
    fn block_on<T>(&self, work: impl Future<Output = Result<T>>) -> Result<T> {
        self.runtime.block_on(async {
            tokio::select! {
                result = work => result,
                () = self.shutdown.cancelled() => Err(IngexError::Cancelled),
            }
        })
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }

    async fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation_token: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&self.prefix)
                .request_payer(RequestPayer::Requester);

            if let Some(token) = continuation_token {
                request = request.continuation_token(token);
            }

            let response = request
                .send()
                .await
                .map_err(|e| IngexError::object_store(self.location(&self.prefix), DisplayErrorContext(&e)))?;

            keys.extend(response.contents().iter().filter_map(|obj| obj.key().map(str::to_string)));

            if response.is_truncated().unwrap_or(false) {
                continuation_token = response.next_continuation_token().map(str::to_string);
                if continuation_token.is_none() {
                    break;
                }
            } else {
                break;
            }
        }

        Ok(keys)
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .request_payer(RequestPayer::Requester)
            .send()
            .await
            .map_err(|e| IngexError::object_store(self.location(key), DisplayErrorContext(&e)))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|e| IngexError::path_error("create", dest, e))?;

        let mut stream = response.body;
        let mut written = 0u64;
        while let Some(bytes) = stream
            .try_next()
            .await
            .map_err(|e| IngexError::object_store(self.location(key), e))?
        {
            file.write_all(&bytes)
                .await
                .map_err(|e| IngexError::path_error("write", dest, e))?;
            written += bytes.len() as u64;
        }
        file.flush()
            .await
            .map_err(|e| IngexError::path_error("write", dest, e))?;

        Ok(written)
    }
}

/// Last path segment of an object key.
fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

impl ArchiveSource for S3Source {
    fn describe(&self) -> String {
        self.location(&self.prefix)
    }

    fn list(&self) -> Result<Vec<Candidate>> {
        let keys = self.block_on(self.list_keys())?;
        debug!(objects = keys.len(), "Listed object store");
        Ok(keys
            .into_iter()
            .filter(|key| !key.ends_with('/'))
            .map(|key| {
                let filename = base_name(&key).to_string();
                Candidate::new(key, filename)
            })
            .collect())
    }

    fn fetch(&self, candidate: &Candidate, scratch: &Path) -> Result<PathBuf> {
        let dest = scratch.join(&candidate.filename);
        let bytes = self.block_on(self.download(&candidate.key, &dest))?;
        info!(
            file = %candidate.filename,
            bytes,
            location = %self.location(&candidate.key),
            "Downloaded archive"
        );
        Ok(dest)
    }

    fn finish(&self, candidate: &Candidate) -> Result<()> {
        debug!(file = %candidate.filename, "Object store archives are kept in place");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spooler::test_support::write_archive;
    use crate::spooler::{Spooler, SpoolerOptions};
    use crate::state::StateStore;
    use aws_sdk_s3::config::{BehaviorVersion, Credentials};
    use std::collections::HashMap;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Arc;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    const BUCKET: &str = "exports";

    fn client_for(endpoint: &str) -> Client {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(Credentials::new("AKIDTEST", "secret", None, None, "test"))
            .force_path_style(true)
            .build();
        Client::from_conf(config)
    }

    fn read_request_line(stream: &mut TcpStream) -> String {
        let mut request = Vec::new();
        let mut buf = [0u8; 1024];
        while !request.windows(4).any(|w| w == b"\r\n\r\n") {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => request.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8_lossy(&request)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    }

    fn respond(stream: &mut TcpStream, status: &str, content_type: &str, body: &[u8]) {
        let head = format!(
            "HTTP/1.1 {status}\r\ncontent-type: {content_type}\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        );
        let _ = stream.write_all(head.as_bytes());
        let _ = stream.write_all(body);
    }

    fn list_page(keys: &[&str], next: Option<&str>) -> String {
        let contents: String = keys
            .iter()
            .map(|k| format!("<Contents><Key>{k}</Key><Size>1</Size></Contents>"))
            .collect();
        let truncation = next.map_or_else(
            || "<IsTruncated>false</IsTruncated>".to_string(),
            |token| format!("<IsTruncated>true</IsTruncated><NextContinuationToken>{token}</NextContinuationToken>"),
        );
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?><ListBucketResult xmlns="http://s3.amazonaws.com/doc/2006-03-01/"><Name>{BUCKET}</Name><Prefix>daily/</Prefix><KeyCount>{}</KeyCount><MaxKeys>1000</MaxKeys>{truncation}{contents}</ListBucketResult>"#,
            keys.len()
        )
    }

    /// Minimal path-style S3 endpoint: two list pages, then object bodies.
    fn fake_s3(objects: HashMap<String, Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            for mut stream in listener.incoming().flatten() {
                let line = read_request_line(&mut stream);
                let target = line.split_whitespace().nth(1).unwrap_or_default().to_string();
                if target.contains("list-type=2") {
                    let page = if target.contains("continuation-token=page-2") {
                        list_page(&["daily/b.db.zip"], None)
                    } else {
                        list_page(&["daily/a.db.zip", "daily/nested/"], Some("page-2"))
                    };
                    respond(&mut stream, "200 OK", "application/xml", page.as_bytes());
                } else {
                    let path = target.split('?').next().unwrap_or_default();
                    let key = path.trim_start_matches(&format!("/{BUCKET}/")).to_string();
                    match objects.get(&key) {
                        Some(body) => respond(&mut stream, "200 OK", "application/octet-stream", body),
                        None => respond(
                            &mut stream,
                            "404 Not Found",
                            "application/xml",
                            b"<Error><Code>NoSuchKey</Code><Message>missing</Message></Error>",
                        ),
                    }
                }
            }
        });
        url
    }

    fn silent_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        std::thread::spawn(move || {
            let mut held = Vec::new();
            for stream in listener.incoming().flatten() {
                held.push(stream);
            }
        });
        url
    }

    fn archive_bytes(name: &str, uri: &str) -> Vec<u8> {
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), name, &[(uri, "did:plc:a", "{}", "{}")]);
        std::fs::read(dir.path().join(name)).unwrap()
    }

    #[test]
    fn base_name_strips_prefixes() {
        assert_eq!(base_name("exports/2025/09/a.db.zip"), "a.db.zip");
        assert_eq!(base_name("a.db.zip"), "a.db.zip");
        assert_eq!(base_name("dir/"), "");
    }

    #[test]
    fn list_follows_pages_and_skips_directory_markers() {
        let url = fake_s3(HashMap::new());
        let source = S3Source::with_client(client_for(&url), BUCKET, "daily/", Shutdown::new()).unwrap();

        let candidates = source.list().unwrap();
        assert_eq!(
            candidates,
            vec![
                Candidate::new("daily/a.db.zip", "a.db.zip"),
                Candidate::new("daily/b.db.zip", "b.db.zip"),
            ]
        );
    }

    #[test]
    fn fetch_downloads_into_scratch_and_finish_keeps_the_object() {
        let body = b"zip bytes".to_vec();
        let url = fake_s3(HashMap::from([("daily/a.db.zip".to_string(), body.clone())]));
        let source = S3Source::with_client(client_for(&url), BUCKET, "daily/", Shutdown::new()).unwrap();
        let scratch = TempDir::new().unwrap();
        let candidate = Candidate::new("daily/a.db.zip", "a.db.zip");

        let path = source.fetch(&candidate, scratch.path()).unwrap();
        assert_eq!(path, scratch.path().join("a.db.zip"));
        assert_eq!(std::fs::read(&path).unwrap(), body);

        source.finish(&candidate).unwrap();
        assert_eq!(source.list().unwrap().len(), 2);
    }

    #[test]
    fn fetch_of_a_missing_object_is_an_object_store_error() {
        let url = fake_s3(HashMap::new());
        let source = S3Source::with_client(client_for(&url), BUCKET, "daily/", Shutdown::new()).unwrap();
        let scratch = TempDir::new().unwrap();

        let err = source
            .fetch(&Candidate::new("daily/gone.db.zip", "gone.db.zip"), scratch.path())
            .unwrap_err();
        assert!(matches!(err, IngexError::ObjectStore { .. }));
    }

    #[test]
    fn spooler_streams_rows_from_the_bucket() {
        let url = fake_s3(HashMap::from([
            ("daily/a.db.zip".to_string(), archive_bytes("a.db.zip", "at://a")),
            ("daily/b.db.zip".to_string(), archive_bytes("b.db.zip", "at://b")),
        ]));
        let shutdown = Shutdown::new();
        let source = S3Source::with_client(client_for(&url), BUCKET, "daily/", shutdown.clone()).unwrap();
        let state_dir = TempDir::new().unwrap();
        let state = Arc::new(StateStore::open(state_dir.path().join("state.json")).unwrap());

        let mut handle = Spooler::new(Box::new(source), Arc::clone(&state), SpoolerOptions::default(), shutdown)
            .start()
            .unwrap();
        let uris: Vec<String> = handle.rows().iter().map(|row| row.at_uri).collect();
        let stats = handle.join().unwrap();

        assert_eq!(uris, vec!["at://a", "at://b"]);
        assert_eq!(stats.files_processed, 2);
        assert!(state.is_processed("a.db.zip"));
        assert!(state.is_processed("b.db.zip"));
    }

    #[test]
    fn stalled_listing_returns_once_shutdown_is_requested() {
        let shutdown = Shutdown::new();
        let source =
            S3Source::with_client(client_for(&silent_server()), BUCKET, "daily/", shutdown.clone()).unwrap();

        let (tx, rx) = crossbeam_channel::bounded(1);
        std::thread::spawn(move || {
            let _ = tx.send(source.list());
        });
        std::thread::sleep(Duration::from_millis(200));
        assert!(rx.try_recv().is_err(), "listing should still be waiting on the endpoint");

        let cancelled_at = Instant::now();
        shutdown.cancel();
        let result = rx
            .recv_timeout(Duration::from_secs(5))
            .expect("listing should return after shutdown");
        assert!(matches!(result, Err(IngexError::Cancelled)));
        assert!(cancelled_at.elapsed() < Duration::from_secs(5));
    }
}
