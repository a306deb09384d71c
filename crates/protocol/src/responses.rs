//! Typed replies for member-to-router communication

use crate::messages::{Phase, XactOrigin};
use databus_common::{KeyPath, Payload, QueryId, TransactionId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Event response code carried by every reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResponseCode {
    /// Success
    Ack,
    /// Failure; the router will abort the transaction
    Nack,
    /// Not applicable: nothing here for this key
    Na,
    /// Partial result, more will follow
    Async,
    /// Handled by a router-internal registration
    Internal,
}

impl ResponseCode {
    /// Everything but `Async` ends a match's participation in a query
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResponseCode::Async)
    }

    /// Precedence when several matches answer one query
    fn rank(&self) -> u8 {
        match self {
            ResponseCode::Async => 4,
            ResponseCode::Nack => 3,
            ResponseCode::Internal => 2,
            ResponseCode::Ack => 1,
            ResponseCode::Na => 0,
        }
    }

    /// Fold codes: async dominates, then nack, internal, ack; na if empty
    pub fn combine(codes: impl IntoIterator<Item = ResponseCode>) -> ResponseCode {
        codes
            .into_iter()
            .fold(ResponseCode::Na, |acc, code| {
                if code.rank() > acc.rank() { code } else { acc }
            })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseCode::Ack => "ACK",
            ResponseCode::Nack => "NACK",
            ResponseCode::Na => "NA",
            ResponseCode::Async => "ASYNC",
            ResponseCode::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One key/payload pair in the query's key space
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub key: KeyPath,
    pub payload: Payload,
}

impl ResultRow {
    pub fn new(key: KeyPath, payload: Payload) -> Self {
        Self { key, payload }
    }
}

/// Why a member reported an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCause {
    /// A registration answered with a key outside the query's key space
    KeyMismatch,
    /// A key could not be materialised for the ledger or a result
    KeyDup,
    /// A registration callback broke the callback contract
    ProtocolViolation,
    /// A prepare callback never completed
    Timeout,
    /// A registration callback returned NOT_OK
    CallbackFailed,
}

/// Error details attached to a reply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub cause: ErrorCause,
    pub message: String,
    /// Offending key, when one is known
    pub key: Option<KeyPath>,
    pub client_path: String,
    pub router_path: String,
}

/// One result for one query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    pub xact_id: TransactionId,
    pub origin: XactOrigin,
    pub query_id: QueryId,
    /// Serial number of the query this answers
    pub serial: u64,
    /// Position of this result among the query's results
    pub sequence: u32,
    pub member: String,
    pub code: ResponseCode,
    pub rows: Vec<ResultRow>,
    pub corr_id: Option<Vec<u8>>,
    pub errors: Vec<ErrorReport>,
}

impl QueryResult {
    /// The final result of a query carries a terminal code
    pub fn is_final(&self) -> bool {
        self.code.is_terminal()
    }
}

/// Verdict for a precommit, commit or abort phase
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseReply {
    pub xact_id: TransactionId,
    pub origin: XactOrigin,
    pub member: String,
    pub phase: Phase,
    pub code: ResponseCode,
    pub errors: Vec<ErrorReport>,
}

/// Member asks the router to abort a transaction it cannot complete
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AbortRequest {
    pub xact_id: TransactionId,
    pub origin: XactOrigin,
    pub member: String,
    pub report: ErrorReport,
}

/// Everything a member sends to the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MemberReply {
    Query(QueryResult),
    Phase(PhaseReply),
    AbortRequest(AbortRequest),
}

impl MemberReply {
    pub fn xact_id(&self) -> TransactionId {
        match self {
            MemberReply::Query(r) => r.xact_id,
            MemberReply::Phase(r) => r.xact_id,
            MemberReply::AbortRequest(r) => r.xact_id,
        }
    }
}

/// Builds replies stamped with the member's name
#[derive(Debug, Clone)]
pub struct ReplyBuilder {
    member: String,
}

impl ReplyBuilder {
    pub fn new(member: impl Into<String>) -> Self {
        Self {
            member: member.into(),
        }
    }

    pub fn member(&self) -> &str {
        &self.member
    }

    /// Error report carrying the transaction's client and router paths
    pub fn error_report(
        &self,
        origin: &XactOrigin,
        cause: ErrorCause,
        message: impl Into<String>,
        key: Option<KeyPath>,
    ) -> ErrorReport {
        ErrorReport {
            cause,
            message: message.into(),
            key,
            client_path: origin.client_path.clone(),
            router_path: origin.router_path.clone(),
        }
    }

    pub fn phase(
        &self,
        xact_id: TransactionId,
        origin: &XactOrigin,
        phase: Phase,
        code: ResponseCode,
        errors: Vec<ErrorReport>,
    ) -> MemberReply {
        MemberReply::Phase(PhaseReply {
            xact_id,
            origin: origin.clone(),
            member: self.member.clone(),
            phase,
            code,
            errors,
        })
    }

    pub fn abort_request(
        &self,
        xact_id: TransactionId,
        origin: &XactOrigin,
        report: ErrorReport,
    ) -> MemberReply {
        MemberReply::AbortRequest(AbortRequest {
            xact_id,
            origin: origin.clone(),
            member: self.member.clone(),
            report,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_precedence() {
        use ResponseCode::*;

        assert_eq!(ResponseCode::combine([]), Na);
        assert_eq!(ResponseCode::combine([Na, Ack]), Ack);
        assert_eq!(ResponseCode::combine([Ack, Nack, Na]), Nack);
        assert_eq!(ResponseCode::combine([Nack, Async, Ack]), Async);
        assert_eq!(ResponseCode::combine([Ack, Internal]), Internal);
        assert_eq!(ResponseCode::combine([Internal, Nack]), Nack);
    }

    #[test]
    fn test_terminal_codes() {
        assert!(ResponseCode::Ack.is_terminal());
        assert!(ResponseCode::Nack.is_terminal());
        assert!(ResponseCode::Na.is_terminal());
        assert!(ResponseCode::Internal.is_terminal());
        assert!(!ResponseCode::Async.is_terminal());
    }

    #[test]
    fn test_error_report_carries_paths() {
        let builder = ReplyBuilder::new("member-a");
        let origin = XactOrigin {
            client_path: "/client/1".to_string(),
            router_path: "/router/0".to_string(),
            ..XactOrigin::default()
        };

        let report = builder.error_report(&origin, ErrorCause::Timeout, "late", None);
        assert_eq!(report.client_path, "/client/1");
        assert_eq!(report.router_path, "/router/0");
        assert_eq!(report.cause, ErrorCause::Timeout);
    }

    #[test]
    fn test_phase_reply_stamped_with_member() {
        let builder = ReplyBuilder::new("member-a");
        let id = TransactionId::new();
        let reply = builder.phase(
            id,
            &XactOrigin::default(),
            Phase::Commit,
            ResponseCode::Ack,
            Vec::new(),
        );

        assert_eq!(reply.xact_id(), id);
        match reply {
            MemberReply::Phase(p) => {
                assert_eq!(p.member, "member-a");
                assert_eq!(p.phase, Phase::Commit);
            }
            other => panic!("unexpected reply: {other:?}"),
        }
    }
}
