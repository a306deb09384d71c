//! Application-data stores
//!
//! One adapter interface, `AppData<K>`, implemented once per consistency
//! flavour and generic over the key shape used to address rows:
//!
//! - `SafeStore`: rows are moved out as leases with a bounded hold time
//! - `UnsafeStore`: rows are borrowed in place
//! - `QueuedStore`: reads are copies, writes are queued until `merge`
//!
//! Registrations that cache their data locally hand one of these to the
//! kernel as a `Cache`, which then serves reads from it and applies
//! committed ledger entries to it.

pub mod keys;
pub mod queued;
pub mod safe;
mod table;
pub mod unchecked;

pub use keys::{KeyShape, MiniKey, PathEntry};
pub use queued::{Delta, QueuedStore};
pub use safe::{Lease, SafeStore};
pub use unchecked::UnsafeStore;

use crate::error::Result;
use crate::transaction::CommitEntry;
use databus_common::{KeyPath, Payload};
use databus_protocol::ResultRow;

/// Storage operations shared by every flavour
pub trait AppData<K: KeyShape> {
    fn get(&self, key: &K) -> Result<Option<Payload>>;

    fn put(&self, key: &K, value: Payload) -> Result<()>;

    /// Insert a row that must not exist yet
    fn create(&self, key: &K, value: Payload) -> Result<()>;

    fn delete(&self, key: &K) -> Result<Option<Payload>>;

    /// Next row in key order after `after` (first row when `None`)
    fn get_next(&self, after: Option<&K>) -> Result<Option<(K, Payload)>>;
}

/// What the kernel needs from a caching registration's store
pub trait Cache: Send + Sync {
    /// Rows overlapping `pattern`, skipping those up to `after`
    fn scan(&self, pattern: &KeyPath, after: Option<&KeyPath>) -> Vec<ResultRow>;

    /// Apply one committed ledger entry
    fn apply(&self, entry: &CommitEntry) -> Result<()>;

    /// Make applied entries visible
    fn flush(&self) {}
}
