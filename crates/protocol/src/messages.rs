//! Typed events for router-to-member communication

use databus_common::{KeyPath, Payload, QueryId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Protocol phases a member takes part in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Query dispatch and vote collection
    Prepare,
    /// Optional validation pass across every registration touched
    Precommit,
    /// Decision: apply
    Commit,
    /// Decision: roll back
    Abort,
}

impl Phase {
    /// Parse from its wire name
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "prepare" => Some(Self::Prepare),
            "precommit" => Some(Self::Precommit),
            "commit" => Some(Self::Commit),
            "abort" => Some(Self::Abort),
            _ => None,
        }
    }

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Prepare => "prepare",
            Self::Precommit => "precommit",
            Self::Commit => "commit",
            Self::Abort => "abort",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a query asks the member to do
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    Create,
    Read,
    Update,
    Delete,
    Rpc,
}

impl Action {
    /// Create, update and delete leave commit-ledger entries
    pub fn is_mutating(&self) -> bool {
        matches!(self, Action::Create | Action::Update | Action::Delete)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Read => "read",
            Action::Update => "update",
            Action::Delete => "delete",
            Action::Rpc => "rpc",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-query behaviour flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryFlags {
    /// Execute outside the two-phase protocol; the member ends the
    /// transaction on its own once every query has a final result
    pub no_transaction: bool,
    /// Router expects a result even for pure writes
    pub solicit_response: bool,
    /// Echo the written payload back in the result rows
    pub return_payload: bool,
    /// Long-running query whose rows arrive in several results
    pub stream: bool,
    /// Read from subscriber caches instead of publishers
    pub sub_read: bool,
}

impl QueryFlags {
    pub fn non_transactional() -> Self {
        Self {
            no_transaction: true,
            ..Self::default()
        }
    }
}

/// One key/action pair dispatched by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireQuery {
    /// Query ID, unique within the transaction
    pub id: QueryId,
    /// Router-assigned serial number
    pub serial: u64,
    pub action: Action,
    /// Key the query addresses (may contain wildcards)
    pub key: KeyPath,
    /// Data rooted at `key` for create/update/rpc
    pub payload: Option<Payload>,
    pub flags: QueryFlags,
    /// Maximum rows the router buffers in the first result; 0 means the
    /// member default
    pub credits: u32,
    /// Opaque correlation ID echoed in every result
    pub corr_id: Option<Vec<u8>>,
    /// Resume point for paged reads
    pub cursor: Option<KeyPath>,
}

impl WireQuery {
    pub fn new(id: impl Into<QueryId>, action: Action, key: KeyPath) -> Self {
        Self {
            id: id.into(),
            serial: 0,
            action,
            key,
            payload: None,
            flags: QueryFlags::default(),
            credits: 0,
            corr_id: None,
            cursor: None,
        }
    }

    pub fn with_payload(mut self, payload: Payload) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_flags(mut self, flags: QueryFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_credits(mut self, credits: u32) -> Self {
        self.credits = credits;
        self
    }

    pub fn with_serial(mut self, serial: u64) -> Self {
        self.serial = serial;
        self
    }

    pub fn with_corr_id(mut self, corr_id: Vec<u8>) -> Self {
        self.corr_id = Some(corr_id);
        self
    }

    pub fn with_cursor(mut self, cursor: KeyPath) -> Self {
        self.cursor = Some(cursor);
        self
    }

    pub fn is_transactional(&self) -> bool {
        !self.flags.no_transaction
    }
}

/// Where a transaction came from (echoed in every reply)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactOrigin {
    pub router_idx: u64,
    pub client_idx: u64,
    pub serialno: u64,
    pub router_path: String,
    pub client_path: String,
}

/// Transaction identity carried by every router event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactHeader {
    pub id: TransactionId,
    pub origin: XactOrigin,
}

impl XactHeader {
    pub fn new(id: TransactionId) -> Self {
        Self {
            id,
            origin: XactOrigin::default(),
        }
    }

    pub fn with_origin(mut self, origin: XactOrigin) -> Self {
        self.origin = origin;
        self
    }
}

/// Transaction-wide information sent with phase events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct XactBody {
    /// Number of query blocks the router executed for this transaction
    pub blocks: u32,
}

impl Default for XactBody {
    fn default() -> Self {
        Self { blocks: 1 }
    }
}

impl XactBody {
    pub fn multi_block(blocks: u32) -> Self {
        Self { blocks }
    }

    pub fn has_multiple_blocks(&self) -> bool {
        self.blocks > 1
    }
}

/// Events the router dispatches to a member
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RouterEvent {
    Prepare { header: XactHeader, query: WireQuery },
    Precommit { header: XactHeader, body: XactBody },
    Commit { header: XactHeader, body: XactBody },
    Abort { header: XactHeader, body: XactBody },
    End { header: XactHeader },
}

impl RouterEvent {
    pub fn header(&self) -> &XactHeader {
        match self {
            RouterEvent::Prepare { header, .. }
            | RouterEvent::Precommit { header, .. }
            | RouterEvent::Commit { header, .. }
            | RouterEvent::Abort { header, .. }
            | RouterEvent::End { header } => header,
        }
    }

    pub fn xact_id(&self) -> TransactionId {
        self.header().id
    }

    /// Event name for logging
    pub fn name(&self) -> &'static str {
        match self {
            RouterEvent::Prepare { .. } => "PREPARE",
            RouterEvent::Precommit { .. } => "PRECOMMIT",
            RouterEvent::Commit { .. } => "COMMIT",
            RouterEvent::Abort { .. } => "ABORT",
            RouterEvent::End { .. } => "END",
        }
    }
}
