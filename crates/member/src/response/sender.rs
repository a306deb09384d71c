//! Reply sending for member-to-router communication

use databus_common::TransactionId;
use databus_protocol::{
    ErrorReport, MemberReply, Phase, QueryResult, ReplyBuilder, ResponseCode, XactOrigin,
};
use tokio::sync::mpsc;

/// Sends replies to the router over the member's outbound channel
pub struct ResponseSender {
    tx: mpsc::UnboundedSender<MemberReply>,
    builder: ReplyBuilder,
}

impl ResponseSender {
    pub fn new(tx: mpsc::UnboundedSender<MemberReply>, member: impl Into<String>) -> Self {
        Self {
            tx,
            builder: ReplyBuilder::new(member),
        }
    }

    pub fn builder(&self) -> &ReplyBuilder {
        &self.builder
    }

    pub fn member(&self) -> &str {
        self.builder.member()
    }

    /// Send one query result
    pub fn send_result(&self, result: QueryResult) {
        self.send(MemberReply::Query(result));
    }

    /// Send a precommit, commit or abort verdict
    pub fn send_phase(
        &self,
        xact_id: TransactionId,
        origin: &XactOrigin,
        phase: Phase,
        code: ResponseCode,
        errors: Vec<ErrorReport>,
    ) {
        self.send(self.builder.phase(xact_id, origin, phase, code, errors));
    }

    /// Ask the router to abort a transaction
    pub fn send_abort_request(&self, xact_id: TransactionId, origin: &XactOrigin, report: ErrorReport) {
        self.send(self.builder.abort_request(xact_id, origin, report));
    }

    fn send(&self, reply: MemberReply) {
        if self.tx.send(reply).is_err() {
            tracing::warn!("[{}] Router link closed, dropping reply", self.member());
        }
    }
}
