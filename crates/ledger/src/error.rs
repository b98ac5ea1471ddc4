//! Substrate error taxonomy.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by the key/value substrate.
///
/// Callers treat every variant as fail-closed for financial decisions: a
/// counter that cannot be read is a counter that denies.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("key/value substrate unreachable: {0}")]
    Unavailable(String),
    #[error("substrate call exceeded {0:?}")]
    Timeout(Duration),
    #[error("malformed substrate payload: {0}")]
    Corrupt(String),
}

impl From<redis::RedisError> for LedgerError {
    fn from(err: redis::RedisError) -> Self {
        Self::Unavailable(err.to_string())
    }
}

impl From<serde_json::Error> for LedgerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Corrupt(err.to_string())
    }
}
