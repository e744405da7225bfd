//! Model provider transport.
//!
//! The runtime only needs one thing from a provider: a byte stream of framed
//! `data:` records for a [`ModelRequest`]. Decoding those bytes is the job of
//! [`crate::stream`]; this module is concerned with getting them.
//!
//! - `client`: HTTP client, request body building and connection retries.

use crate::error::ApiError;
use crate::types::ModelRequest;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;

mod client;

pub use client::HttpModelClient;

/// Raw provider response body, chunked as it arrives from the network.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, ApiError>> + Send>>;

/// Minimal model API interface used by the session runtime.
///
/// This trait lets tests provide deterministic scripted streams without
/// network calls while the production path uses [`HttpModelClient`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Open one streaming model call. Errors here happen before any bytes
    /// were received; errors inside the stream are mid-call transport
    /// failures.
    async fn stream(&self, request: &ModelRequest) -> Result<ByteStream, ApiError>;
}

/// Parse a `Retry-After` header given either as delta-seconds or as an
/// HTTP date.
pub(crate) fn parse_retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let raw = headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim();
    if let Ok(secs) = raw.parse::<u64>() {
        return Some(secs);
    }
    let when = httpdate::parse_http_date(raw).ok()?;
    Some(
        when.duration_since(std::time::SystemTime::now())
            .map(|delta| delta.as_secs())
            .unwrap_or(0),
    )
}
