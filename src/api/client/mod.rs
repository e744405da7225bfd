//! HTTP client for streaming model calls.
//!
//! - body building and dispatch live in `transport`.
//! - retry policy logic lives in `retry`.

mod retry;
mod transport;

use super::{ByteStream, ModelClient};
use crate::config::ApiConfig;
use crate::error::ApiError;
use crate::types::ModelRequest;
use async_trait::async_trait;
use retry::RetryPolicy;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Client for the provider's streaming messages endpoint.
pub struct HttpModelClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    retry_policy: RetryPolicy,
}

impl HttpModelClient {
    /// Build a client from resolved API configuration.
    pub fn new(config: &ApiConfig) -> Self {
        Self {
            http: transport::build_http_client(Duration::from_secs(config.timeout_secs)),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.trim().to_string(),
            retry_policy: RetryPolicy::default(),
        }
    }
}

#[async_trait]
impl ModelClient for HttpModelClient {
    async fn stream(&self, request: &ModelRequest) -> Result<ByteStream, ApiError> {
        let body = transport::build_request_body(request);
        let mut attempt: u32 = 0;
        loop {
            match transport::open_stream(&self.http, &self.base_url, &self.api_key, &body).await {
                Ok(stream) => {
                    debug!(attempt, model = %request.model, "model stream opened");
                    return Ok(stream);
                }
                Err(err) => {
                    if !self.retry_policy.should_retry(&err, attempt) {
                        return Err(err);
                    }
                    let delay = self.retry_policy.delay_for(attempt, &err);
                    warn!(attempt, error = %err, delay_ms = delay.as_millis() as u64, "retrying model request");
                    sleep(delay).await;
                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }
}
