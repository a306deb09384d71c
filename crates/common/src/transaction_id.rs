//! Transaction identifier using UUIDv7
//!
//! The router mints one per distributed transaction; members only parse,
//! compare and hash them.

use crate::KeyError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Distributed transaction identifier
///
/// Time-ordered, so logs and tombstone tables sort in arrival order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    pub fn parse(s: &str) -> Result<Self, KeyError> {
        s.parse()
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl FromStr for TransactionId {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s)
            .map(Self)
            .map_err(|e| KeyError::InvalidTransactionId(format!("{s}: {e}")))
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_parses_back() {
        let id = TransactionId::new();
        assert_eq!(id.to_string().parse::<TransactionId>().unwrap(), id);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        let err = TransactionId::parse("not-a-uuid").unwrap_err();
        assert!(matches!(err, KeyError::InvalidTransactionId(_)));
    }

    #[test]
    fn test_ids_are_distinct() {
        assert_ne!(TransactionId::new(), TransactionId::new());
    }

    #[test]
    fn test_orders_by_uuid() {
        let low: TransactionId = "00000000-0000-7000-8000-000000000000".parse().unwrap();
        let high: TransactionId = "ffffffff-ffff-7fff-bfff-ffffffffffff".parse().unwrap();
        assert!(low < high);
    }
}
