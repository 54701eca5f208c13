use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid parameter: {0}")]
    InvalidParam(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out")]
    Timeout,

    #[error("request cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("too many redirects")]
    TooManyRedirects,

    #[error("https is not supported by this client")]
    TlsUnsupported,

    #[error("JSON error: {0}")]
    Json(String),
}

pub type FetchResult<T> = Result<T, FetchError>;
