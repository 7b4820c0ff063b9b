//! Feed transport error types.

/// Errors raised while retrieving raw feed bytes.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The configured URL could not be parsed
    #[error("invalid URL {url:?}: {message}")]
    InvalidUrl { url: String, message: String },

    /// An auth header name or value is not valid HTTP
    #[error("invalid header {name:?}")]
    InvalidHeader { name: String },

    /// The request exceeded its timeout
    #[error("request to {url} timed out")]
    Timeout { url: String },

    /// HTTP request failed (connect, TLS, body read)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The server answered with a non-2xx status
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    /// Reading a local feed file failed
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}
