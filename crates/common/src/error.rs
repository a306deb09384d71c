//! Key parsing errors

use thiserror::Error;

/// Errors produced while parsing or manipulating key paths
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KeyError {
    #[error("Key path must start with '/': {0}")]
    NotAbsolute(String),

    #[error("Empty segment in key path: {0}")]
    EmptySegment(String),

    #[error("Invalid transaction ID: {0}")]
    InvalidTransactionId(String),
}
