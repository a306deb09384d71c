//! Shared row table behind every store flavour

use super::keys::KeyShape;
use crate::error::{Error, Result};
use crate::transaction::CommitEntry;
use databus_common::{KeyPath, Payload};
use databus_protocol::{Action, ResultRow};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::ops::Bound;

pub(crate) struct Table {
    base: KeyPath,
    rows: RwLock<BTreeMap<KeyPath, Payload>>,
}

impl Table {
    pub(crate) fn new(base: KeyPath) -> Self {
        Self {
            base,
            rows: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn base(&self) -> &KeyPath {
        &self.base
    }

    pub(crate) fn path<K: KeyShape>(&self, key: &K) -> Result<KeyPath> {
        key.to_path(&self.base)
    }

    pub(crate) fn len(&self) -> usize {
        self.rows.read().len()
    }

    pub(crate) fn contains(&self, path: &KeyPath) -> bool {
        self.rows.read().contains_key(path)
    }

    pub(crate) fn get(&self, path: &KeyPath) -> Option<Payload> {
        self.rows.read().get(path).cloned()
    }

    pub(crate) fn with_ref<R>(&self, path: &KeyPath, f: impl FnOnce(Option<&Payload>) -> R) -> R {
        let rows = self.rows.read();
        f(rows.get(path))
    }

    pub(crate) fn put(&self, path: KeyPath, value: Payload) {
        self.rows.write().insert(path, value);
    }

    pub(crate) fn create(&self, path: KeyPath, value: Payload) -> Result<()> {
        let mut rows = self.rows.write();
        if rows.contains_key(&path) {
            return Err(Error::AlreadyExists(path));
        }
        rows.insert(path, value);
        Ok(())
    }

    pub(crate) fn remove(&self, path: &KeyPath) -> Option<Payload> {
        self.rows.write().remove(path)
    }

    /// Remove every row at or below `pattern`
    pub(crate) fn remove_under(&self, pattern: &KeyPath) -> usize {
        let mut rows = self.rows.write();
        let before = rows.len();
        rows.retain(|path, _| !path.has_prefix(pattern));
        before - rows.len()
    }

    /// First row after `after` that `K` can address
    pub(crate) fn next_after<K: KeyShape>(&self, after: Option<&K>) -> Result<Option<(K, Payload)>> {
        let start = match after {
            Some(key) => Bound::Excluded(self.path(key)?),
            None => Bound::Unbounded,
        };
        let rows = self.rows.read();
        for (path, value) in rows.range((start, Bound::Unbounded)) {
            if let Ok(key) = K::from_path(path, &self.base) {
                return Ok(Some((key, value.clone())));
            }
        }
        Ok(None)
    }

    /// Rows whose key overlaps `pattern`, in key order, after `after`
    pub(crate) fn scan(&self, pattern: &KeyPath, after: Option<&KeyPath>) -> Vec<ResultRow> {
        self.rows
            .read()
            .iter()
            .filter(|(path, _)| path.overlaps(pattern))
            .filter(|(path, _)| after.is_none_or(|cursor| *path > cursor))
            .map(|(path, value)| ResultRow::new(path.clone(), value.clone()))
            .collect()
    }

    /// Check that a ledger entry lands inside this table
    pub(crate) fn entry_path(&self, entry: &CommitEntry) -> Result<KeyPath> {
        if !entry.key.starts_with(&self.base) {
            return Err(Error::KeyConversion(format!(
                "{} is outside {}",
                entry.key, self.base
            )));
        }
        Ok(entry.key.clone())
    }

    /// Apply one committed ledger entry directly
    pub(crate) fn apply(&self, entry: &CommitEntry) -> Result<()> {
        let path = self.entry_path(entry)?;
        match entry.action {
            Action::Create => self.create(path, entry_payload(entry)?),
            Action::Update => {
                self.put(path, entry_payload(entry)?);
                Ok(())
            }
            Action::Delete => {
                self.remove_under(&path);
                Ok(())
            }
            Action::Read | Action::Rpc => Ok(()),
        }
    }
}

pub(crate) fn entry_payload(entry: &CommitEntry) -> Result<Payload> {
    entry
        .payload
        .clone()
        .ok_or_else(|| Error::InvalidState(format!("{} of {} without payload", entry.action, entry.key)))
}
