//! Store error types

use std::fmt;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Error from a persistence backend.
#[derive(Debug)]
pub enum StoreError {
    /// Underlying engine or filesystem error
    Backend(String),
    /// Value could not be encoded
    Encode(String),
    /// Value could not be decoded (corrupt or incompatible record)
    Decode(String),
    /// Operation exceeded its configured deadline
    Timeout,
    /// Store marked unhealthy after repeated failures
    Unhealthy,
}

impl StoreError {
    /// Transient errors are worth the bounded retry; decode failures and
    /// an unhealthy store are not.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Backend(_) | StoreError::Timeout)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(msg) => write!(f, "backend error: {msg}"),
            StoreError::Encode(msg) => write!(f, "encode error: {msg}"),
            StoreError::Decode(msg) => write!(f, "decode error: {msg}"),
            StoreError::Timeout => write!(f, "store operation timed out"),
            StoreError::Unhealthy => write!(f, "store is unhealthy"),
        }
    }
}

impl std::error::Error for StoreError {}

impl From<fjall::Error> for StoreError {
    fn from(e: fjall::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<bincode::error::EncodeError> for StoreError {
    fn from(e: bincode::error::EncodeError) -> Self {
        StoreError::Encode(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for StoreError {
    fn from(e: bincode::error::DecodeError) -> Self {
        StoreError::Decode(e.to_string())
    }
}
