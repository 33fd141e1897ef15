//! HTTP transport: timeouts, exponential backoff with jitter on `5xx`/
//! connection errors.

use crate::error::{BuildError, Result};
use rand::Rng;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RegistryClientConfig {
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub overall_timeout: Duration,
    pub upload_overall_timeout: Duration,
    pub max_retries: u32,
    pub allow_insecure_registries: bool,
}

impl Default for RegistryClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            read_timeout: Duration::from_secs(20),
            overall_timeout: Duration::from_secs(60),
            upload_overall_timeout: Duration::from_secs(15 * 60),
            max_retries: 5,
            allow_insecure_registries: false,
        }
    }
}

pub struct Transport {
    http: Client,
    config: RegistryClientConfig,
}

impl Transport {
    pub fn new(config: RegistryClientConfig) -> Result<Self> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.overall_timeout);
        if config.allow_insecure_registries {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        let http = builder.build().map_err(BuildError::from)?;
        Ok(Self { http, config })
    }

    /// A client whose overall timeout is long enough for a full layer
    /// upload; used for the PATCH/PUT phases of a blob push.
    pub fn upload_client(&self) -> Result<Client> {
        let mut builder = Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.upload_overall_timeout);
        if self.config.allow_insecure_registries {
            builder = builder
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true);
        }
        builder.build().map_err(BuildError::from)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn config(&self) -> &RegistryClientConfig {
        &self.config
    }

    /// Sends a request built fresh on each attempt (so a retried request
    /// isn't a reused, already-consumed builder), retrying `5xx`/`429`
    /// responses and connection errors with exponential backoff and
    /// jitter, bounded by `max_retries`.
    pub async fn send_with_retry<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            let result = build().send().await;
            match result {
                Ok(response) if is_retryable_status(response.status()) => {
                    if attempt >= self.config.max_retries {
                        let status = response.status();
                        let body = response.text().await.unwrap_or_default();
                        return Err(crate::error::handlers::registry_error(operation, status, &body));
                    }
                }
                Ok(response) => return Ok(response),
                Err(err) if is_retryable_reqwest_error(&err) => {
                    if attempt >= self.config.max_retries {
                        return Err(BuildError::from(err));
                    }
                }
                Err(err) => return Err(BuildError::from(err)),
            }

            backoff_sleep(attempt).await;
            attempt += 1;
        }
    }
}

pub(crate) fn is_retryable_status(status: StatusCode) -> bool {
    status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS
}

pub(crate) fn is_retryable_reqwest_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect()
}

pub(crate) async fn backoff_sleep(attempt: u32) {
    let base_ms = 200u64.saturating_mul(1u64 << attempt.min(6));
    let jitter_ms = rand::thread_rng().gen_range(0..=base_ms / 2 + 1);
    tokio::time::sleep(Duration::from_millis(base_ms + jitter_ms)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_status_covers_server_errors_and_429() {
        assert!(is_retryable_status(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(is_retryable_status(StatusCode::BAD_GATEWAY));
        assert!(is_retryable_status(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_retryable_status(StatusCode::NOT_FOUND));
        assert!(!is_retryable_status(StatusCode::OK));
    }
}
