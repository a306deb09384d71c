//! Store with copy-on-read and queued writes
//!
//! Reads always see the last merged state. Writes are queued as deltas and
//! become visible on `merge`.

use super::keys::KeyShape;
use super::table::{Table, entry_payload};
use super::{AppData, Cache};
use crate::error::{Error, Result};
use crate::transaction::CommitEntry;
use databus_common::{KeyPath, Payload};
use databus_protocol::{Action, ResultRow};
use parking_lot::Mutex;

/// One queued change
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    Put(KeyPath, Payload),
    Delete(KeyPath),
    /// Remove a row and everything below it
    DeleteUnder(KeyPath),
}

pub struct QueuedStore {
    table: Table,
    deltas: Mutex<Vec<Delta>>,
}

impl QueuedStore {
    pub fn new(base: KeyPath) -> Self {
        Self {
            table: Table::new(base),
            deltas: Mutex::new(Vec::new()),
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

    /// Deltas waiting for `merge`
    pub fn queued(&self) -> usize {
        self.deltas.lock().len()
    }

    fn queue(&self, delta: Delta) {
        self.deltas.lock().push(delta);
    }

    fn queued_put(&self, path: &KeyPath) -> bool {
        self.deltas
            .lock()
            .iter()
            .any(|d| matches!(d, Delta::Put(p, _) if p == path))
    }

    /// Apply queued deltas in order, returning how many were applied
    pub fn merge(&self) -> usize {
        let deltas = std::mem::take(&mut *self.deltas.lock());
        let applied = deltas.len();
        for delta in deltas {
            match delta {
                Delta::Put(path, value) => self.table.put(path, value),
                Delta::Delete(path) => {
                    self.table.remove(&path);
                }
                Delta::DeleteUnder(pattern) => {
                    self.table.remove_under(&pattern);
                }
            }
        }
        applied
    }
}

impl<K: KeyShape> AppData<K> for QueuedStore {
    fn get(&self, key: &K) -> Result<Option<Payload>> {
        Ok(self.table.get(&self.table.path(key)?))
    }

    fn put(&self, key: &K, value: Payload) -> Result<()> {
        self.queue(Delta::Put(self.table.path(key)?, value));
        Ok(())
    }

    fn create(&self, key: &K, value: Payload) -> Result<()> {
        let path = self.table.path(key)?;
        if self.table.contains(&path) || self.queued_put(&path) {
            return Err(Error::AlreadyExists(path));
        }
        self.queue(Delta::Put(path, value));
        Ok(())
    }

    fn delete(&self, key: &K) -> Result<Option<Payload>> {
        let path = self.table.path(key)?;
        let current = self.table.get(&path);
        self.queue(Delta::Delete(path));
        Ok(current)
    }

    fn get_next(&self, after: Option<&K>) -> Result<Option<(K, Payload)>> {
        self.table.next_after(after)
    }
}

impl Cache for QueuedStore {
    fn scan(&self, pattern: &KeyPath, after: Option<&KeyPath>) -> Vec<ResultRow> {
        self.table.scan(pattern, after)
    }

    fn apply(&self, entry: &CommitEntry) -> Result<()> {
        let path = self.table.entry_path(entry)?;
        match entry.action {
            Action::Create => {
                if self.table.contains(&path) || self.queued_put(&path) {
                    return Err(Error::AlreadyExists(path));
                }
                self.queue(Delta::Put(path, entry_payload(entry)?));
            }
            Action::Update => self.queue(Delta::Put(path, entry_payload(entry)?)),
            Action::Delete => self.queue(Delta::DeleteUnder(path)),
            Action::Read | Action::Rpc => {}
        }
        Ok(())
    }

    fn flush(&self) {
        self.merge();
    }
}
