//! Per-record partial updates against the remote companion store.
//!
//! Each mapping entry becomes one PATCH addressed by record id. Entries are
//! independent: a failed update is recorded and the batch moves on, so
//! partial completion is an expected outcome, not an error state.

use std::fmt;
use std::time::Duration;

use anyhow::Context;
use csr_core::MappingEntry;
use reqwest::StatusCode;
use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "csr-remote";

/// Endpoint and credentials for the remote store, injected at startup.
/// The key is carried in two headers (`apikey` and the bearer token) and is
/// never logged; `Debug` redacts it.
#[derive(Clone)]
pub struct RemoteConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout: Duration,
}

impl fmt::Debug for RemoteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &"<redacted>")
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// One failed update, identified well enough to remediate by hand.
/// `retryable` marks failures worth re-running from the persisted mapping
/// artifact (server errors, throttling, transport problems).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateFailure {
    pub id: String,
    pub new_specialty: String,
    pub error: String,
    pub retryable: bool,
}

/// Batch result: successes vs. total attempted plus the per-record failures.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RemoteBatchSummary {
    pub attempted: usize,
    pub succeeded: usize,
    pub failures: Vec<UpdateFailure>,
}

pub struct RemotePatcher {
    client: reqwest::Client,
    config: RemoteConfig,
}

impl RemotePatcher {
    pub fn new(config: RemoteConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self { client, config })
    }

    /// Row filter addressing, `{base}?id=eq.{id}`.
    pub fn update_url(&self, id: &str) -> String {
        format!("{}?id=eq.{}", self.config.base_url, id)
    }

    /// Issues one partial update carrying only the new specialty value.
    pub async fn update_specialty(&self, entry: &MappingEntry) -> Result<(), UpdateError> {
        let url = self.update_url(&entry.id);
        let response = self
            .client
            .patch(&url)
            .header("apikey", &self.config.api_key)
            .bearer_auth(&self.config.api_key)
            .header("Prefer", "return=minimal")
            .json(&json!({ "specialty": entry.new_specialty }))
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(UpdateError::HttpStatus {
                status: status.as_u16(),
                url,
            })
        }
    }

    /// Applies every entry in order, one blocking round-trip at a time.
    /// Failures are collected, never propagated, so the whole batch always
    /// runs to completion.
    pub async fn apply_all(&self, entries: &[MappingEntry]) -> RemoteBatchSummary {
        let mut summary = RemoteBatchSummary::default();
        for entry in entries {
            summary.attempted += 1;
            match self.update_specialty(entry).await {
                Ok(()) => {
                    info!(id = %entry.id, new_specialty = %entry.new_specialty, "remote update applied");
                    summary.succeeded += 1;
                }
                Err(err) => {
                    let retryable =
                        classify_update_error(&err) == RetryDisposition::Retryable;
                    warn!(id = %entry.id, error = %err, retryable, "remote update failed");
                    summary.failures.push(UpdateFailure {
                        id: entry.id.clone(),
                        new_specialty: entry.new_specialty.clone(),
                        error: err.to_string(),
                        retryable,
                    });
                }
            }
        }
        summary
    }
}

/// Retryability split recorded on every [`UpdateFailure`], so a later
/// `apply-remote` re-run over the same artifact can filter out entries that
/// failed for good (authorization, bad request).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_update_error(err: &UpdateError) -> RetryDisposition {
    match err {
        UpdateError::Request(err) => {
            if err.is_timeout() || err.is_connect() || err.is_request() {
                RetryDisposition::Retryable
            } else {
                RetryDisposition::NonRetryable
            }
        }
        UpdateError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
            .map(classify_status)
            .unwrap_or(RetryDisposition::NonRetryable),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn entry(id: &str, name: &str, old: &str, new: &str) -> MappingEntry {
        MappingEntry {
            id: id.to_string(),
            name: name.to_string(),
            old_specialty: old.to_string(),
            new_specialty: new.to_string(),
        }
    }

    /// Accepts one connection, consumes the full request, answers with the
    /// given status line and an empty body, then closes the connection.
    async fn respond_once(listener: &TcpListener, status_line: &str) {
        let (mut socket, _) = listener.accept().await.expect("accept");
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        loop {
            let n = socket.read(&mut chunk).await.expect("read request");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(header_end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let headers = String::from_utf8_lossy(&buf[..header_end]);
                let content_length = headers
                    .lines()
                    .find_map(|line| {
                        let (name, value) = line.split_once(':')?;
                        name.eq_ignore_ascii_case("content-length")
                            .then(|| value.trim().parse::<usize>().ok())?
                    })
                    .unwrap_or(0);
                if buf.len() >= header_end + 4 + content_length {
                    break;
                }
            }
            if n == 0 {
                break;
            }
        }
        let response = format!(
            "HTTP/1.1 {status_line}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n"
        );
        socket
            .write_all(response.as_bytes())
            .await
            .expect("write response");
        let _ = socket.shutdown().await;
    }

    fn config() -> RemoteConfig {
        RemoteConfig {
            base_url: "https://example.test/rest/v1/companions".to_string(),
            api_key: "secret-key".to_string(),
            timeout: Duration::from_secs(5),
        }
    }

    #[test]
    fn update_url_addresses_one_row_by_id() {
        let patcher = RemotePatcher::new(config()).expect("client");
        assert_eq!(
            patcher.update_url("c36"),
            "https://example.test/rest/v1/companions?id=eq.c36"
        );
    }

    #[test]
    fn debug_output_never_carries_the_key() {
        let rendered = format!("{:?}", config());
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("secret-key"));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNAUTHORIZED),
            RetryDisposition::NonRetryable
        );
    }

    #[tokio::test]
    async fn unreachable_host_is_a_recorded_failure_not_an_abort() {
        let patcher = RemotePatcher::new(RemoteConfig {
            // reserved TEST-NET-1 address, nothing listens there
            base_url: "http://192.0.2.1:9/rest/v1/companions".to_string(),
            api_key: "secret-key".to_string(),
            timeout: Duration::from_millis(200),
        })
        .expect("client");

        let entries = vec![
            entry("c1", "Ruby", "Grief", "Trauma"),
            entry("c2", "Kai", "Anxiety", "Burnout"),
        ];

        let summary = patcher.apply_all(&entries).await;
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures.len(), 2);
        assert_eq!(summary.failures[0].id, "c1");
        assert_eq!(summary.failures[1].id, "c2");
        assert!(summary.failures[0].retryable);
    }

    #[tokio::test]
    async fn non_2xx_response_is_recorded_and_the_batch_continues() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            respond_once(&listener, "500 Internal Server Error").await;
            respond_once(&listener, "204 No Content").await;
        });

        let patcher = RemotePatcher::new(RemoteConfig {
            base_url: format!("http://{addr}/rest/v1/companions"),
            api_key: "secret-key".to_string(),
            timeout: Duration::from_secs(5),
        })
        .expect("client");

        let entries = vec![
            entry("c1", "Ruby", "Grief", "Trauma"),
            entry("c2", "Kai", "Anxiety", "Burnout"),
        ];

        let summary = patcher.apply_all(&entries).await;
        server.await.expect("server task");

        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.failures.len(), 1);
        assert_eq!(summary.failures[0].id, "c1");
        assert!(summary.failures[0].error.contains("500"));
        assert!(summary.failures[0].retryable);
    }

    #[tokio::test]
    async fn rejected_update_is_not_marked_retryable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = tokio::spawn(async move {
            respond_once(&listener, "401 Unauthorized").await;
        });

        let patcher = RemotePatcher::new(RemoteConfig {
            base_url: format!("http://{addr}/rest/v1/companions"),
            api_key: "secret-key".to_string(),
            timeout: Duration::from_secs(5),
        })
        .expect("client");

        let summary = patcher
            .apply_all(&[entry("c1", "Ruby", "Grief", "Trauma")])
            .await;
        server.await.expect("server task");

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures.len(), 1);
        assert!(!summary.failures[0].retryable);
    }
}
