//! Query results: re-rooting, aggregation and sending

pub mod aggregator;
pub mod reroot;
pub mod sender;

pub use aggregator::{Accepted, Draft, accept, drain_pending, next_result, split_credit};
pub use reroot::reroot;
pub use sender::ResponseSender;
