use crate::fetch::client::HttpClient;
use crate::fetch::error::FetchError;
use async_trait::async_trait;
use reqwest::header::{HeaderName, HeaderValue};

/// Header used for the `api_key` setting. The spelling matches what the
/// feed providers expect.
pub const AUTHORISATION_HEADER: &str = "Authorisation";

/// Header used for the `x_api_key` setting.
pub const X_API_KEY_HEADER: &str = "x-api-key";

/// An [`HttpClient`] wrapper that injects an API key as an HTTP header.
///
/// The header name and value are validated once at construction, so a bad
/// key surfaces as a configuration error instead of a failed poll.
pub struct ApiKey<C> {
    inner: C,
    header_name: HeaderName,
    key: HeaderValue,
}

impl<C> ApiKey<C> {
    pub fn new(inner: C, header_name: &str, key: &str) -> Result<Self, FetchError> {
        let name = HeaderName::from_bytes(header_name.as_bytes()).map_err(|_| {
            FetchError::InvalidHeader {
                name: header_name.to_string(),
            }
        })?;
        let mut key = HeaderValue::from_str(key).map_err(|_| FetchError::InvalidHeader {
            name: header_name.to_string(),
        })?;
        key.set_sensitive(true);

        Ok(Self {
            inner,
            header_name: name,
            key,
        })
    }

    /// `Authorisation: <key>`
    pub fn authorisation(inner: C, key: &str) -> Result<Self, FetchError> {
        Self::new(inner, AUTHORISATION_HEADER, key)
    }

    /// `x-api-key: <key>`
    pub fn x_api_key(inner: C, key: &str) -> Result<Self, FetchError> {
        Self::new(inner, X_API_KEY_HEADER, key)
    }

    pub fn header_name(&self) -> &HeaderName {
        &self.header_name
    }
}

#[async_trait]
impl<C: HttpClient> HttpClient for ApiKey<C> {
    async fn execute(&self, mut req: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        req.headers_mut()
            .insert(self.header_name.clone(), self.key.clone());
        self.inner.execute(req).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::BasicClient;

    #[test]
    fn test_builds_authorisation_header() {
        let client = ApiKey::authorisation(BasicClient::new(), "secret").unwrap();
        assert_eq!(client.header_name().as_str(), "authorisation");
    }

    #[test]
    fn test_builds_x_api_key_header() {
        let client = ApiKey::x_api_key(BasicClient::new(), "secret").unwrap();
        assert_eq!(client.header_name().as_str(), "x-api-key");
    }

    #[test]
    fn test_rejects_invalid_header_value() {
        let result = ApiKey::x_api_key(BasicClient::new(), "line\nbreak");
        assert!(matches!(result, Err(FetchError::InvalidHeader { .. })));
    }
}
