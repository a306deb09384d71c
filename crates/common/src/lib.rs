//! Common types for the data bus member
//!
//! This crate defines:
//! - Transaction IDs (UUIDv7-based) and router-assigned query IDs
//! - Hierarchical key paths used to address data and registrations
//! - The payload tree carried by queries and results

mod error;
mod keyspec;
mod query_id;
mod transaction_id;

pub use error::KeyError;
pub use keyspec::{KeyPath, Segment};
pub use query_id::QueryId;
pub use transaction_id::TransactionId;

/// Payload tree addressed by a [`KeyPath`]
///
/// Object fields are the child segments of the key the payload is rooted at.
pub type Payload = serde_json::Value;
