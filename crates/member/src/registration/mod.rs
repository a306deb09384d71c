//! Registrations and the registry
//!
//! A registration is the member's declared interest in a subtree of the key
//! space. The kernel matches incoming queries against every registration
//! and drives the callbacks of the ones that fit.

pub mod context;

pub use context::{PhaseContext, PrepareContext};

use crate::appdata::Cache;
use crate::error::{Error, Result};
use crate::response::reroot::child_of;
use crate::transaction::{CommitEntry, Group, GroupHooks, GroupId};
use databus_common::{KeyPath, Payload};
use databus_protocol::{Action, ResponseCode, WireQuery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RegId(pub u32);

impl fmt::Display for RegId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "reg{}", self.0)
    }
}

/// Which side of the data flow a registration serves
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    /// Owns data: answers reads and rpcs
    Publisher,
    /// Receives writes (and cached reads via `sub_read`)
    Subscriber,
}

impl Role {
    /// Role that serves `query`
    pub fn for_query(query: &WireQuery) -> Role {
        match query.action {
            Action::Read | Action::Rpc if query.flags.sub_read => Role::Subscriber,
            Action::Read | Action::Rpc => Role::Publisher,
            Action::Create | Action::Update | Action::Delete => Role::Subscriber,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegFlags {
    /// Router-internal registration, allowed to answer INTERNAL
    pub internal: bool,
}

/// Status a registration callback returns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallbackStatus {
    Ok,
    NotOk,
    Na,
    /// The answer will follow through the context's responder
    Async,
    Internal,
}

impl CallbackStatus {
    pub fn code(self) -> ResponseCode {
        match self {
            CallbackStatus::Ok => ResponseCode::Ack,
            CallbackStatus::NotOk => ResponseCode::Nack,
            CallbackStatus::Na => ResponseCode::Na,
            CallbackStatus::Async => ResponseCode::Async,
            CallbackStatus::Internal => ResponseCode::Internal,
        }
    }
}

/// Application callbacks for one registration
///
/// `prepare` is the only callback that may return `Async`. Commit-phase
/// callbacks receive the entries the registration collected during prepare.
pub trait RegistrationHandler: Send + Sync {
    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        action: Action,
        key: &KeyPath,
        payload: Option<&Payload>,
        credits: u32,
        cursor: Option<&KeyPath>,
    ) -> CallbackStatus;

    fn precommit(&self, _ctx: &PhaseContext<'_>, _entries: &[CommitEntry]) -> CallbackStatus {
        CallbackStatus::Ok
    }

    fn commit(&self, _ctx: &PhaseContext<'_>, _entries: &[CommitEntry]) -> CallbackStatus {
        CallbackStatus::Ok
    }

    fn abort(&self, _ctx: &PhaseContext<'_>, _entries: &[CommitEntry]) -> CallbackStatus {
        CallbackStatus::Ok
    }
}

/// Handler for registrations whose data lives in an application-data store
///
/// Writes are accepted at prepare and applied by the kernel at commit.
pub struct StoreBacked;

impl RegistrationHandler for StoreBacked {
    fn prepare(
        &self,
        _ctx: &mut PrepareContext<'_>,
        _action: Action,
        _key: &KeyPath,
        _payload: Option<&Payload>,
        _credits: u32,
        _cursor: Option<&KeyPath>,
    ) -> CallbackStatus {
        CallbackStatus::Ok
    }
}

/// Key and payload a query resolves to for one registration
#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub key: KeyPath,
    pub payload: Option<Payload>,
}

#[derive(Clone)]
pub struct Registration {
    pub name: String,
    pub key: KeyPath,
    pub role: Role,
    pub flags: RegFlags,
    pub group: Option<GroupId>,
    pub handler: Arc<dyn RegistrationHandler>,
    pub cache: Option<Arc<dyn Cache>>,
}

impl Registration {
    pub fn new(
        name: impl Into<String>,
        key: KeyPath,
        role: Role,
        handler: Arc<dyn RegistrationHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            key,
            role,
            flags: RegFlags::default(),
            group: None,
            handler,
            cache: None,
        }
    }

    /// Registration served entirely from an application-data store
    pub fn cached(name: impl Into<String>, key: KeyPath, role: Role, cache: Arc<dyn Cache>) -> Self {
        Self::new(name, key, role, Arc::new(StoreBacked)).with_cache(cache)
    }

    pub fn internal(mut self) -> Self {
        self.flags.internal = true;
        self
    }

    pub fn in_group(mut self, group: GroupId) -> Self {
        self.group = Some(group);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Resolve `query` against this registration
    ///
    /// Returns `None` when the role or key does not fit. A registration
    /// deeper than the query receives the part of the payload rooted at its
    /// deepest concrete key; for writes that part must exist.
    pub fn resolve(&self, query: &WireQuery) -> Option<Resolved> {
        if Role::for_query(query) != self.role {
            return None;
        }
        let key = self.key.intersect(&query.key)?;

        let query_depth = query.key.depth();
        let Some(payload) = query.payload.as_ref() else {
            return Some(Resolved { key, payload: None });
        };
        if self.key.depth() <= query_depth {
            return Some(Resolved {
                key,
                payload: Some(payload.clone()),
            });
        }

        let mut node = payload;
        let mut depth = query_depth;
        for segment in self.key.suffix(query_depth) {
            let Some(name) = segment.as_name() else {
                break;
            };
            match child_of(node, name) {
                Some(child) => {
                    node = child;
                    depth += 1;
                }
                None if query.action.is_mutating() => return None,
                None => break,
            }
        }

        Some(Resolved {
            key: key.truncated(depth),
            payload: Some(node.clone()),
        })
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("key", &self.key)
            .field("role", &self.role)
            .field("flags", &self.flags)
            .field("group", &self.group)
            .field("caching", &self.cache.is_some())
            .finish()
    }
}

/// Every registration and group a member knows about
#[derive(Debug, Default)]
pub struct Registry {
    registrations: BTreeMap<RegId, Registration>,
    groups: BTreeMap<GroupId, Group>,
    next_reg: u32,
    next_group: u32,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, registration: Registration) -> RegId {
        self.next_reg += 1;
        let id = RegId(self.next_reg);
        tracing::debug!(
            "Registered {} ({}) at {} as {:?}",
            registration.name,
            id,
            registration.key,
            registration.role
        );
        self.registrations.insert(id, registration);
        id
    }

    pub fn unregister(&mut self, id: RegId) -> Option<Registration> {
        self.registrations.remove(&id)
    }

    pub fn add_group(&mut self, name: impl Into<String>, hooks: Arc<dyn GroupHooks>) -> GroupId {
        self.next_group += 1;
        let id = GroupId(self.next_group);
        self.groups.insert(
            id,
            Group {
                id,
                name: name.into(),
                hooks,
            },
        );
        id
    }

    pub fn get(&self, id: RegId) -> Result<&Registration> {
        self.registrations
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown registration {id}")))
    }

    pub fn group(&self, id: GroupId) -> Result<&Group> {
        self.groups
            .get(&id)
            .ok_or_else(|| Error::InvalidState(format!("unknown group {id}")))
    }

    /// Registrations in ascending id order
    pub fn iter(&self) -> impl Iterator<Item = (RegId, &Registration)> {
        self.registrations.iter().map(|(id, reg)| (*id, reg))
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}
