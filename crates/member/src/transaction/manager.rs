//! Transaction manager - owns every transaction this member knows about
//!
//! Transactions live in an arena keyed by id. Anything that refers to a
//! transaction across a mailbox hop carries an `XactHandle`, whose
//! generation is checked on every lookup, so a continuation that outlived
//! its transaction finds `StaleHandle` instead of someone else's state.

use super::state::{XactEvent, XactState};
use super::xact::Transaction;
use crate::error::{Error, Result};
use databus_common::TransactionId;
use databus_protocol::XactOrigin;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Generation-checked reference to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct XactHandle {
    pub id: TransactionId,
    pub generation: u64,
}

impl XactHandle {
    pub fn new(id: TransactionId, generation: u64) -> Self {
        Self { id, generation }
    }
}

/// What `open` did to find the transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opened {
    Created,
    Existing,
    /// A finished transaction was started over for a router retry
    Reentered,
}

/// What remains of a released transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub state: XactState,
    pub expires_at: Instant,
}

struct Slot {
    generation: u64,
    xact: Transaction,
}

/// Arena of live transactions plus tombstones of released ones
pub struct TransactionManager {
    slots: HashMap<TransactionId, Slot>,

    /// Recently released (for late retries, GC'd by expiry)
    tombstones: HashMap<TransactionId, Tombstone>,

    next_generation: u64,
    ledger_chunk: usize,
    retention: Duration,
}

impl TransactionManager {
    pub fn new(ledger_chunk: usize, retention: Duration) -> Self {
        Self {
            slots: HashMap::new(),
            tombstones: HashMap::new(),
            next_generation: 0,
            ledger_chunk,
            retention,
        }
    }

    // === LIFECYCLE METHODS ===

    /// Find or create the transaction a router event addresses
    ///
    /// PREPARE, PRECOMMIT and ABORT create unseen transactions. PREPARE and
    /// PRECOMMIT for a finished transaction start it over under a new
    /// generation. Every other event needs a live transaction.
    pub fn open(
        &mut self,
        id: TransactionId,
        origin: &XactOrigin,
        event: XactEvent,
    ) -> Result<(XactHandle, Opened)> {
        let restarts = matches!(event, XactEvent::Prepare | XactEvent::Precommit);

        if let Some(slot) = self.slots.get(&id) {
            if slot.xact.state == XactState::End && restarts {
                return Ok((self.install(id, origin), Opened::Reentered));
            }
            return Ok((XactHandle::new(id, slot.generation), Opened::Existing));
        }

        if let Some(tombstone) = self.tombstones.get(&id) {
            if !restarts {
                return Err(Error::InvalidTransition {
                    state: tombstone.state,
                    event,
                });
            }
            self.tombstones.remove(&id);
            return Ok((self.install(id, origin), Opened::Reentered));
        }

        match event {
            XactEvent::Prepare | XactEvent::Precommit | XactEvent::Abort => {
                Ok((self.install(id, origin), Opened::Created))
            }
            _ => Err(Error::TransactionNotFound(id)),
        }
    }

    fn install(&mut self, id: TransactionId, origin: &XactOrigin) -> XactHandle {
        self.next_generation += 1;
        let generation = self.next_generation;
        self.slots.insert(
            id,
            Slot {
                generation,
                xact: Transaction::new(id, origin.clone(), self.ledger_chunk),
            },
        );
        XactHandle::new(id, generation)
    }

    /// Drop a finished transaction and leave a tombstone behind
    pub fn release(&mut self, handle: XactHandle) -> Result<Transaction> {
        self.get(handle)?;
        let slot = self
            .slots
            .remove(&handle.id)
            .ok_or(Error::TransactionNotFound(handle.id))?;

        self.tombstones.insert(
            handle.id,
            Tombstone {
                state: slot.xact.state,
                expires_at: Instant::now() + self.retention,
            },
        );
        Ok(slot.xact)
    }

    // === QUERY METHODS ===

    pub fn get(&self, handle: XactHandle) -> Result<&Transaction> {
        match self.slots.get(&handle.id) {
            Some(slot) if slot.generation == handle.generation => Ok(&slot.xact),
            _ => Err(Error::StaleHandle(handle.id)),
        }
    }

    pub fn get_mut(&mut self, handle: XactHandle) -> Result<&mut Transaction> {
        match self.slots.get_mut(&handle.id) {
            Some(slot) if slot.generation == handle.generation => Ok(&mut slot.xact),
            _ => Err(Error::StaleHandle(handle.id)),
        }
    }

    /// Handle for the live transaction with this id
    pub fn lookup(&self, id: TransactionId) -> Option<XactHandle> {
        self.slots
            .get(&id)
            .map(|slot| XactHandle::new(id, slot.generation))
    }

    pub fn find(&self, id: TransactionId) -> Option<&Transaction> {
        self.slots.get(&id).map(|slot| &slot.xact)
    }

    pub fn tombstone(&self, id: TransactionId) -> Option<&Tombstone> {
        self.tombstones.get(&id)
    }

    pub fn active_count(&self) -> usize {
        self.slots.len()
    }

    pub fn tombstone_count(&self) -> usize {
        self.tombstones.len()
    }

    // === GARBAGE COLLECTION ===

    /// Forget tombstones past their expiry
    pub fn gc_tombstones(&mut self, now: Instant) -> Vec<TransactionId> {
        let expired: Vec<TransactionId> = self
            .tombstones
            .iter()
            .filter(|(_, t)| t.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            self.tombstones.remove(id);
        }
        expired
    }
}
