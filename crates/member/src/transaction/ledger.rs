//! Commit ledger
//!
//! Every mutating match a registration accepts leaves one `CommitEntry`
//! under that registration's record. Entries are appended when the match
//! answers ACK (or INTERNAL) and only read afterwards by the precommit,
//! commit and abort callbacks.

use crate::error::{Error, Result};
use crate::registration::RegId;
use databus_common::{KeyPath, Payload};
use databus_protocol::Action;
use std::collections::BTreeMap;

/// One change a registration agreed to during prepare
#[derive(Debug, Clone, PartialEq)]
pub struct CommitEntry {
    /// Resolved key in the registration's key space
    pub key: KeyPath,
    pub payload: Option<Payload>,
    pub action: Action,
    /// Key of the query that produced this entry
    pub query_key: KeyPath,
    /// Serial number of that query
    pub serial: u64,
}

/// Ledger header for one (transaction, registration) pair
#[derive(Debug)]
pub struct RegCommitRecord {
    reg: RegId,
    entries: Vec<CommitEntry>,
    chunk: usize,
}

impl RegCommitRecord {
    fn new(reg: RegId, chunk: usize) -> Self {
        Self {
            reg,
            entries: Vec::with_capacity(chunk),
            chunk,
        }
    }

    pub fn reg(&self) -> RegId {
        self.reg
    }

    pub fn entries(&self) -> &[CommitEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.entries.capacity()
    }

    fn push(&mut self, entry: CommitEntry) {
        if self.entries.len() == self.entries.capacity() {
            self.entries.reserve_exact(self.chunk);
        }
        self.entries.push(entry);
    }

    /// Drop entries newest first
    fn release(mut self) -> usize {
        let mut released = 0;
        while self.entries.pop().is_some() {
            released += 1;
        }
        released
    }
}

/// Per-transaction ledger, sorted by registration
#[derive(Debug)]
pub struct Ledger {
    records: BTreeMap<RegId, RegCommitRecord>,
    chunk: usize,
}

impl Ledger {
    pub fn new(chunk: usize) -> Self {
        Self {
            records: BTreeMap::new(),
            chunk: chunk.max(1),
        }
    }

    /// Whether an entry for `action` on `key` could be stored
    ///
    /// Create and update entries must name a concrete key; a wildcard cannot
    /// be materialised into a stored change.
    pub fn check_entry(action: Action, key: &KeyPath) -> Result<()> {
        if matches!(action, Action::Create | Action::Update) && !key.is_concrete() {
            return Err(Error::KeyDup(format!("cannot {action} wildcard key {key}")));
        }
        Ok(())
    }

    /// Append an entry to `reg`'s record, creating the record on first use
    pub fn add_commit_record(
        &mut self,
        reg: RegId,
        key: KeyPath,
        payload: Option<Payload>,
        action: Action,
        query_key: KeyPath,
        serial: u64,
    ) -> Result<()> {
        Self::check_entry(action, &key)?;

        let chunk = self.chunk;
        self.records
            .entry(reg)
            .or_insert_with(|| RegCommitRecord::new(reg, chunk))
            .push(CommitEntry {
                key,
                payload,
                action,
                query_key,
                serial,
            });
        Ok(())
    }

    pub fn record(&self, reg: RegId) -> Option<&RegCommitRecord> {
        self.records.get(&reg)
    }

    /// Records in ascending registration order
    pub fn records(&self) -> impl Iterator<Item = &RegCommitRecord> {
        self.records.values()
    }

    pub fn entry_count(&self) -> usize {
        self.records.values().map(RegCommitRecord::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Remove and drop every record, returning the number of entries freed
    pub fn release(&mut self) -> usize {
        let records = std::mem::take(&mut self.records);
        records.into_values().map(RegCommitRecord::release).sum()
    }
}
