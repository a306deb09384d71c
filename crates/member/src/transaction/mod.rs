//! Transaction management module
//!
//! This module contains all transaction-related state management:
//! - Transaction lifecycle (init, prepare, precommit, commit/abort, end)
//! - Query registry and per-query match lists
//! - Commit ledger
//! - Per-transaction group state

pub mod group;
pub mod ledger;
pub mod manager;
pub mod query;
pub mod state;
pub mod xact;

pub use group::{Group, GroupHooks, GroupId, GroupPhase, GroupTransaction, Scratch};
pub use ledger::{CommitEntry, Ledger, RegCommitRecord};
pub use manager::{Opened, Tombstone, TransactionManager, XactHandle};
pub use query::{Added, Match, MatchId, MatchIds, Query, find_matches};
pub use state::{XactEvent, XactState};
pub use xact::{Transaction, XactStats};
