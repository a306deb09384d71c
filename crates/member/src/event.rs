//! Mailbox events
//!
//! Everything that reaches a member's kernel arrives as a `MemberEvent` on
//! its mailbox: router traffic, asynchronous registration answers and
//! watchdog expiries.

use crate::error::{Error, Result};
use crate::transaction::{MatchId, XactHandle};
use databus_common::QueryId;
use databus_protocol::{ResponseCode, ResultRow, RouterEvent};
use tokio::sync::mpsc;

/// Sending half of a member's mailbox
pub type Mailbox = mpsc::UnboundedSender<MemberEvent>;

/// Address of one match inside one transaction generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MatchRef {
    pub xact: XactHandle,
    pub query: QueryId,
    pub match_id: MatchId,
}

#[derive(Debug, Clone)]
pub enum MemberEvent {
    /// Protocol event from the router
    Router(RouterEvent),
    /// A registration answering for one of its matches
    Response {
        target: MatchRef,
        code: ResponseCode,
        rows: Vec<ResultRow>,
    },
    /// A prepare watchdog ran out
    WatchdogExpired { target: MatchRef, token: u64 },
    /// Stop the event loop
    Shutdown,
}

/// Answers one match from outside the member's turn
#[derive(Debug, Clone)]
pub struct Responder {
    mailbox: Mailbox,
    target: MatchRef,
}

impl Responder {
    pub fn new(mailbox: Mailbox, target: MatchRef) -> Self {
        Self { mailbox, target }
    }

    pub fn target(&self) -> MatchRef {
        self.target
    }

    /// Post a response for the match back onto the owning member
    pub fn respond(&self, code: ResponseCode, rows: Vec<ResultRow>) -> Result<()> {
        self.mailbox
            .send(MemberEvent::Response {
                target: self.target,
                code,
                rows,
            })
            .map_err(|_| Error::ChannelClosed)
    }
}
