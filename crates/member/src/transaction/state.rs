//! Member transaction state machine

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle states of a member transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XactState {
    /// Created, no query prepared yet
    Init,
    /// One or more queries dispatched to registrations
    Prepare,
    /// Precommit verdict sent
    Precommit,
    /// Commit callbacks running
    CommitRsp,
    /// Committed, waiting for END
    Commit,
    /// Abort callbacks running
    AbortRsp,
    /// Aborted, waiting for END
    Abort,
    /// Finished; state is released once no asynchronous work holds it
    End,
}

/// Events that drive the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum XactEvent {
    Prepare,
    Precommit,
    Commit,
    Abort,
    End,
    /// Internal: a query has sent its final result
    QueryRsp,
}

impl XactState {
    /// Next state for `event`, or `None` when the pair is not allowed
    ///
    /// `multi_block` is only consulted for PRECOMMIT in INIT, which is legal
    /// only when the router ran the transaction across several blocks.
    pub fn next(self, event: XactEvent, multi_block: bool) -> Option<XactState> {
        use XactEvent as E;
        use XactState as S;

        match (self, event) {
            (S::Init, E::Prepare) => Some(S::Prepare),
            (S::Init, E::Precommit) if multi_block => Some(S::Precommit),
            (S::Init, E::Abort) => Some(S::AbortRsp),

            (S::Prepare, E::Prepare) => Some(S::Prepare),
            (S::Prepare, E::Precommit) => Some(S::Precommit),
            (S::Prepare, E::Abort) => Some(S::AbortRsp),
            (S::Prepare, E::QueryRsp) => Some(S::Prepare),

            (S::Precommit, E::Commit) => Some(S::CommitRsp),
            (S::Precommit, E::Abort) => Some(S::AbortRsp),

            (S::Commit, E::End) => Some(S::End),
            (S::Abort, E::End) => Some(S::End),

            (S::End, E::Prepare) => Some(S::Prepare),
            (S::End, E::Precommit) => Some(S::Init),

            _ => None,
        }
    }

    /// Whether late registration responses still count
    pub fn accepts_responses(self) -> bool {
        !matches!(self, XactState::AbortRsp | XactState::Abort | XactState::End)
    }

    pub fn is_aborting(self) -> bool {
        matches!(self, XactState::AbortRsp | XactState::Abort)
    }
}

impl fmt::Display for XactState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            XactState::Init => "INIT",
            XactState::Prepare => "PREPARE",
            XactState::Precommit => "PRECOMMIT",
            XactState::CommitRsp => "COMMIT_RSP",
            XactState::Commit => "COMMIT",
            XactState::AbortRsp => "ABORT_RSP",
            XactState::Abort => "ABORT",
            XactState::End => "END",
        };
        f.write_str(name)
    }
}
