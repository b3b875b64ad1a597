//! Error handling
//!
//! This module defines:
//! - [`Error`]: the main error type for ICAP operations.
//! - [`IcapResult<T>`]: a convenient alias for `Result<T, Error>`.
//!
//! Everything except [`Error::Startup`] is scoped to a single connection:
//! the server records the failure on its event stream and keeps accepting.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Transport read/write failure or deadline expiration.
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),

    /// The ICAP header phases exceeded the configured byte ceiling.
    /// A chunked body hitting the ceiling truncates instead.
    #[error("ICAP message exceeds max size of {0} bytes")]
    MessageTooLarge(usize),

    /// Failed to parse an ICAP message.
    #[error("ICAP parsing error: {0}")]
    Parse(String),

    /// Failed to parse an embedded HTTP fragment.
    #[error("HTTP parsing error: {0}")]
    HttpParse(String),

    /// Failed to serialize a log record.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Listener bind or log-file open failure at boot.
    #[error("startup error: {0}")]
    Startup(String),
}

impl Error {
    /// Create a parsing error.
    pub fn parse(message: impl Into<String>) -> Self {
        Self::Parse(message.into())
    }

    /// Create an HTTP parsing error.
    pub fn http_parse(message: impl Into<String>) -> Self {
        Self::HttpParse(message.into())
    }

    /// Create a startup error.
    pub fn startup(message: impl Into<String>) -> Self {
        Self::Startup(message.into())
    }
}

/// Convenient alias for results in this crate.
pub type IcapResult<T> = Result<T, Error>;
