//! Feed transport.
//!
//! [`HttpClient`] is the seam every request goes through; wrappers such as
//! [`auth::ApiKey`] decorate it. [`FeedFetcher`] sits one level higher and is
//! what the polling pipeline depends on, so tests can substitute canned bytes.

mod basic;
mod client;
mod error;
pub mod auth;

pub use basic::BasicClient;
pub use client::HttpClient;
pub use error::FetchError;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use tracing::debug;

/// Fetches `url` through `client`, failing on timeouts and non-2xx statuses.
#[tracing::instrument(skip(client, url), fields(url = %url))]
pub async fn fetch_bytes<C: HttpClient + ?Sized>(
    client: &C,
    url: &str,
    timeout: Duration,
) -> Result<Bytes, FetchError> {
    let parsed = reqwest::Url::parse(url).map_err(|e| FetchError::InvalidUrl {
        url: url.to_string(),
        message: e.to_string(),
    })?;
    let mut req = reqwest::Request::new(reqwest::Method::GET, parsed);
    *req.timeout_mut() = Some(timeout);

    let resp = client.execute(req).await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Http(e)
        }
    })?;

    let status = resp.status();
    if !status.is_success() {
        return Err(FetchError::Status {
            url: url.to_string(),
            status: status.as_u16(),
        });
    }

    let bytes = resp.bytes().await.map_err(|e| {
        if e.is_timeout() {
            FetchError::Timeout {
                url: url.to_string(),
            }
        } else {
            FetchError::Http(e)
        }
    })?;
    debug!(bytes = bytes.len(), "Feed bytes received");
    Ok(bytes)
}

/// Source of raw feed bytes, addressed by URL.
#[async_trait]
pub trait FeedFetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError>;
}

/// Fetches `http(s)://` locations over HTTP and anything else from disk.
pub struct UrlFetcher<C> {
    client: C,
}

impl<C: HttpClient> UrlFetcher<C> {
    pub fn new(client: C) -> Self {
        Self { client }
    }
}

#[async_trait]
impl<C: HttpClient> FeedFetcher for UrlFetcher<C> {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<Bytes, FetchError> {
        if url.starts_with("http") {
            return fetch_bytes(&self.client, url, timeout).await;
        }

        let contents = tokio::fs::read(url).await.map_err(|source| FetchError::Io {
            path: url.to_string(),
            source,
        })?;
        Ok(Bytes::from(contents))
    }
}
