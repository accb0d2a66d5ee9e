//! Transfer client: HTTP(S) fetch with bounded retry and byte-stream output.
//!
//! The ingestion engines treat this as an opaque byte source. Retrying is
//! the transfer client's job; the engines never retry parsing.

use std::time::Duration;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tracing::{debug, warn};

use crate::config::TransferConfig;
use crate::errors::TransferError;

/// An open fetch: content length (when the server reports one) plus the
/// chunk stream.
pub struct FetchStream {
    pub content_length: Option<u64>,
    stream: BoxStream<'static, Result<Bytes, TransferError>>,
}

impl FetchStream {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, TransferError>> {
        self.stream.next().await
    }
}

#[derive(Clone)]
pub struct TransferClient {
    client: reqwest::Client,
    config: TransferConfig,
}

impl TransferClient {
    pub fn new(config: TransferConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client, config }
    }

    /// Open a byte stream for `url`. Connect/status failures are retried
    /// with exponential backoff and jitter up to the configured bound;
    /// failures mid-stream are surfaced to the consumer as stream items.
    pub async fn fetch(&self, url: &str) -> Result<FetchStream, TransferError> {
        let response = self.get_with_retry(url).await?;
        let content_length = response.content_length();
        debug!(
            "Connected to {}, content length: {:?} bytes",
            url, content_length
        );

        let stream = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(TransferError::Http))
            .boxed();

        Ok(FetchStream {
            content_length,
            stream,
        })
    }

    /// Fetch a complete body. Used for small payloads such as provider API
    /// responses.
    pub async fn fetch_bytes(&self, url: &str) -> Result<Vec<u8>, TransferError> {
        let response = self.get_with_retry(url).await?;
        Ok(response.bytes().await?.to_vec())
    }

    async fn get_with_retry(&self, url: &str) -> Result<reqwest::Response, TransferError> {
        let mut last_error = String::new();
        let attempts = self.config.max_retries + 1;

        for attempt in 0..attempts {
            if attempt > 0 {
                // Exponential backoff with jitter to avoid hammering a
                // struggling provider in lockstep.
                let base = self.config.initial_backoff_ms * (1 << (attempt - 1).min(6));
                let jitter = fastrand::u64(0..=base / 2);
                let delay = Duration::from_millis(base + jitter);
                warn!(
                    "Retrying fetch of {} (attempt {}/{}) after {:?}: {}",
                    url,
                    attempt + 1,
                    attempts,
                    delay,
                    last_error
                );
                tokio::time::sleep(delay).await;
            }

            match self.client.get(url).send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return Ok(response);
                    }
                    last_error = format!("HTTP {status}");
                    // Client errors are not transient; do not burn retries.
                    if status.is_client_error() {
                        return Err(TransferError::Status {
                            status: status.as_u16(),
                            url: url.to_string(),
                        });
                    }
                }
                Err(e) => {
                    last_error = e.to_string();
                }
            }
        }

        Err(TransferError::RetriesExhausted {
            attempts,
            url: url.to_string(),
            last_error,
        })
    }
}

impl Default for TransferClient {
    fn default() -> Self {
        Self::new(TransferConfig::default())
    }
}
