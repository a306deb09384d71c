//! Registration groups
//!
//! Registrations that share state across a transaction belong to a group.
//! The group's hooks see each transaction once per phase, no matter how many
//! of its registrations took part.

use crate::registration::CallbackStatus;
use databus_common::TransactionId;
use serde::{Deserialize, Serialize};
use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Per-transaction scratch value owned by a group
pub type Scratch = Box<dyn Any + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupId(pub u32);

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "group{}", self.0)
    }
}

/// Shared hooks for every registration in a group
pub trait GroupHooks: Send + Sync {
    /// Called on first touch within a transaction
    fn init(&self, xact: TransactionId) -> Scratch;

    fn precommit(&self, _xact: TransactionId, _scratch: &mut Scratch) -> CallbackStatus {
        CallbackStatus::Ok
    }

    fn commit(&self, _xact: TransactionId, _scratch: &mut Scratch) -> CallbackStatus {
        CallbackStatus::Ok
    }

    fn abort(&self, _xact: TransactionId, _scratch: &mut Scratch) -> CallbackStatus {
        CallbackStatus::Ok
    }

    fn deinit(&self, _xact: TransactionId, _scratch: Scratch) {}
}

/// A named group known to the registry
#[derive(Clone)]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub hooks: Arc<dyn GroupHooks>,
}

impl fmt::Debug for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Group")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Group phases guarded by once-only flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupPhase {
    Precommit,
    Commit,
    Abort,
}

/// One group's state inside one transaction
pub struct GroupTransaction {
    group: GroupId,
    scratch: Option<Scratch>,
    precommitted: bool,
    committed: bool,
    aborted: bool,
}

impl GroupTransaction {
    /// Run the group's `init` hook and cache its scratch
    pub fn init(group: &Group, xact: TransactionId) -> Self {
        Self {
            group: group.id,
            scratch: Some(group.hooks.init(xact)),
            precommitted: false,
            committed: false,
            aborted: false,
        }
    }

    pub fn group(&self) -> GroupId {
        self.group
    }

    pub fn scratch_mut(&mut self) -> Option<&mut Scratch> {
        self.scratch.as_mut()
    }

    pub fn is_deinitialized(&self) -> bool {
        self.scratch.is_none()
    }

    /// Run a phase hook unless it already ran for this transaction
    pub fn run_once(
        &mut self,
        phase: GroupPhase,
        hooks: &dyn GroupHooks,
        xact: TransactionId,
    ) -> Option<CallbackStatus> {
        let flag = match phase {
            GroupPhase::Precommit => &mut self.precommitted,
            GroupPhase::Commit => &mut self.committed,
            GroupPhase::Abort => &mut self.aborted,
        };
        if *flag {
            return None;
        }
        *flag = true;

        let scratch = self.scratch.as_mut()?;
        Some(match phase {
            GroupPhase::Precommit => hooks.precommit(xact, scratch),
            GroupPhase::Commit => hooks.commit(xact, scratch),
            GroupPhase::Abort => hooks.abort(xact, scratch),
        })
    }

    /// Hand the scratch back to `deinit`; later calls do nothing
    pub fn deinit(&mut self, hooks: &dyn GroupHooks, xact: TransactionId) -> bool {
        match self.scratch.take() {
            Some(scratch) => {
                hooks.deinit(xact, scratch);
                true
            }
            None => false,
        }
    }
}

impl fmt::Debug for GroupTransaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupTransaction")
            .field("group", &self.group)
            .field("has_scratch", &self.scratch.is_some())
            .field("precommitted", &self.precommitted)
            .field("committed", &self.committed)
            .field("aborted", &self.aborted)
            .finish()
    }
}
