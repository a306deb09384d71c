//! Store handing out direct references
//!
//! Readers borrow rows in place under a read lock. Callers must not write
//! the same row while they hold a reference.

use super::keys::KeyShape;
use super::table::Table;
use super::{AppData, Cache};
use crate::error::Result;
use crate::transaction::CommitEntry;
use databus_common::{KeyPath, Payload};
use databus_protocol::ResultRow;

pub struct UnsafeStore {
    table: Table,
}

impl UnsafeStore {
    pub fn new(base: KeyPath) -> Self {
        Self {
            table: Table::new(base),
        }
    }

    pub fn base(&self) -> &KeyPath {
        self.table.base()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run `f` against the stored row without copying it
    pub fn with_ref<K: KeyShape, R>(&self, key: &K, f: impl FnOnce(Option<&Payload>) -> R) -> Result<R> {
        let path = self.table.path(key)?;
        Ok(self.table.with_ref(&path, f))
    }
}

impl<K: KeyShape> AppData<K> for UnsafeStore {
    fn get(&self, key: &K) -> Result<Option<Payload>> {
        Ok(self.table.get(&self.table.path(key)?))
    }

    fn put(&self, key: &K, value: Payload) -> Result<()> {
        self.table.put(self.table.path(key)?, value);
        Ok(())
    }

    fn create(&self, key: &K, value: Payload) -> Result<()> {
        self.table.create(self.table.path(key)?, value)
    }

    fn delete(&self, key: &K) -> Result<Option<Payload>> {
        Ok(self.table.remove(&self.table.path(key)?))
    }

    fn get_next(&self, after: Option<&K>) -> Result<Option<(K, Payload)>> {
        self.table.next_after(after)
    }
}

impl Cache for UnsafeStore {
    fn scan(&self, pattern: &KeyPath, after: Option<&KeyPath>) -> Vec<ResultRow> {
        self.table.scan(pattern, after)
    }

    fn apply(&self, entry: &CommitEntry) -> Result<()> {
        self.table.apply(entry)
    }
}
