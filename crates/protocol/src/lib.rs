//! Protocol definitions for router-member communication
//!
//! Typed events the router dispatches to a member and the replies a member
//! sends back. Framing and byte-level encoding are handled by the transport,
//! not here.

pub mod messages;
pub mod responses;

pub use messages::{
    Action, Phase, QueryFlags, RouterEvent, WireQuery, XactBody, XactHeader, XactOrigin,
};
pub use responses::{
    AbortRequest, ErrorCause, ErrorReport, MemberReply, PhaseReply, QueryResult, ReplyBuilder,
    ResponseCode, ResultRow,
};
