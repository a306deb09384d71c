//! Error types for the member engine

use crate::transaction::{MatchId, XactEvent, XactState};
use databus_common::{KeyPath, QueryId, TransactionId};
use databus_protocol::ErrorCause;
use thiserror::Error;

/// Result type for member operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while driving member transactions
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Error {
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionId),

    #[error("Stale transaction handle: {0}")]
    StaleHandle(TransactionId),

    #[error("Query {query} not found in transaction {xact}")]
    QueryNotFound { xact: TransactionId, query: QueryId },

    #[error("Match not found: {0}")]
    MatchNotFound(MatchId),

    #[error("No registration overlaps {0}")]
    NotFound(KeyPath),

    #[error("Invalid transition: {event:?} in state {state:?}")]
    InvalidTransition { state: XactState, event: XactEvent },

    #[error("Match {0} already sent a terminal response")]
    AlreadyResponded(MatchId),

    #[error("Key {local} does not fit query key {query}")]
    KeyMismatch { local: KeyPath, query: KeyPath },

    #[error("Key duplication failed: {0}")]
    KeyDup(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Key conversion failed: {0}")]
    KeyConversion(String),

    #[error("Lease expired for {0}")]
    LeaseExpired(KeyPath),

    #[error("Key already exists: {0}")]
    AlreadyExists(KeyPath),

    #[error("Member mailbox closed")]
    ChannelClosed,

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl Error {
    /// Cause code reported to the router for errors that reach it
    pub fn cause(&self) -> ErrorCause {
        match self {
            Error::KeyMismatch { .. } => ErrorCause::KeyMismatch,
            Error::KeyDup(_) | Error::KeyConversion(_) | Error::AlreadyExists(_) => {
                ErrorCause::KeyDup
            }
            Error::ProtocolViolation(_) | Error::InvalidTransition { .. } => {
                ErrorCause::ProtocolViolation
            }
            _ => ErrorCause::CallbackFailed,
        }
    }
}
