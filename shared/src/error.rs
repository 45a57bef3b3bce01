//! Error types for backstream.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The tunnel's outbound queue is gone or the channel has been torn
    /// down. Retry-eligible at the router.
    #[error("connection closed")]
    ConnectionClosed,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("codec error: {0}")]
    Codec(String),

    #[error("request timed out")]
    Elapsed,

    #[error("invalid request timeout '{0}'")]
    InvalidTimeout(String),

    #[error("invalid header: {0}")]
    Header(String),

    #[error("invalid http event: {0}")]
    InvalidEvent(String),

    #[error("no connection for client id '{0}'")]
    NoRoute(String),

    #[error("{0} is not supported")]
    Unsupported(&'static str),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Wraps any transport-level failure.
    pub fn transport(err: impl std::fmt::Display) -> Self {
        Error::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Codec(err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Elapsed
    }
}
