//! Member-side engine of a transactional data bus
//!
//! A member owns registrations over parts of a hierarchical key space. The
//! router sends it queries inside distributed transactions; the member
//! matches each query against its registrations, runs their callbacks,
//! collects votes and result rows, and then follows the router through
//! precommit, commit or abort.
//!
//! ## Architecture
//!
//! The member handles:
//! - The per-transaction state machine (prepare, precommit, commit, abort, end)
//! - Query matching and the per-registration commit ledger
//! - Result aggregation, credit-based splitting and key re-rooting
//! - Watchdogs over prepare callbacks
//! - Once-per-transaction group hooks
//!
//! Applications provide:
//! - `RegistrationHandler` callbacks, or an `AppData` store for caching
//!   registrations
//! - Optional `GroupHooks` for registrations that share transaction state

pub mod appdata;
pub mod config;
pub mod error;
pub mod event;
pub mod kernel;
pub mod registration;
pub mod response;
pub mod runtime;
pub mod stats;
pub mod transaction;
pub mod watchdog;

pub use appdata::{AppData, Cache, KeyShape, MiniKey, PathEntry, QueuedStore, SafeStore, UnsafeStore};
pub use config::MemberConfig;
pub use error::{Error, Result};
pub use event::{Mailbox, MatchRef, MemberEvent, Responder};
pub use kernel::MemberKernel;
pub use registration::{
    CallbackStatus, PhaseContext, PrepareContext, RegFlags, RegId, Registration,
    RegistrationHandler, Registry, Role,
};
pub use runtime::{Member, MemberHandle};
pub use stats::{Counter, MemberStats, StatsSnapshot};
pub use transaction::{CommitEntry, GroupHooks, GroupId, Scratch, XactHandle, XactState};
pub use watchdog::{ManualTimers, TimerHandle, TimerService, TokioTimers};
