//! Router-assigned query identifier

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies one query inside a transaction
///
/// Assigned by the router; unique only within the owning transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct QueryId(pub u64);

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "q{}", self.0)
    }
}

impl From<u64> for QueryId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}
