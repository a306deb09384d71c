//! Response aggregation and credit splitting
//!
//! The first answer for a query goes out immediately, cut at the query's
//! credit. Everything after that is parked in the query's pending table,
//! keyed by match id, and released by a deferred merge in match order.

use crate::transaction::{MatchId, Query};
use databus_protocol::{ErrorReport, ResponseCode, ResultRow};

/// Split `rows` into what fits the credit and what must wait
pub fn split_credit(mut rows: Vec<ResultRow>, credit: usize) -> (Vec<ResultRow>, Vec<ResultRow>) {
    if rows.len() <= credit {
        return (rows, Vec::new());
    }
    let rest = rows.split_off(credit);
    (rows, rest)
}

/// What to do with one match's rerooted rows
#[derive(Debug, Default)]
pub struct Accepted {
    /// Rows to emit right away
    pub now: Option<Vec<ResultRow>>,
    /// Rows parked in the pending table
    pub deferred: usize,
    /// A deferred merge must run
    pub needs_merge: bool,
}

/// Route a match's rows into the query
pub fn accept(query: &mut Query, match_id: MatchId, rows: Vec<ResultRow>) -> Accepted {
    if query.responded {
        return Accepted::default();
    }

    if !query.emitted {
        let (now, rest) = split_credit(rows, query.credits as usize);
        let deferred = rest.len();
        if deferred > 0 {
            query.pending.entry(match_id).or_default().extend(rest);
        }
        return Accepted {
            now: Some(now),
            deferred,
            needs_merge: deferred > 0,
        };
    }

    let deferred = rows.len();
    if deferred > 0 {
        query.pending.entry(match_id).or_default().extend(rows);
    }
    Accepted {
        now: None,
        deferred,
        needs_merge: true,
    }
}

/// Take every pending row in ascending match order
pub fn drain_pending(query: &mut Query) -> Vec<ResultRow> {
    std::mem::take(&mut query.pending)
        .into_values()
        .flatten()
        .collect()
}

/// Contents of the next result for a query
#[derive(Debug)]
pub struct Draft {
    pub code: ResponseCode,
    pub sequence: u32,
    pub rows: Vec<ResultRow>,
    pub errors: Vec<ErrorReport>,
}

impl Draft {
    pub fn is_final(&self) -> bool {
        self.code.is_terminal()
    }
}

/// Prepare the next result, or `None` if there is nothing worth sending
///
/// Partial results are only sent when they carry rows. The first result
/// with a terminal code is the query's last.
pub fn next_result(query: &mut Query, rows: Vec<ResultRow>) -> Option<Draft> {
    if query.responded {
        return None;
    }
    let code = query.current_code();
    if !code.is_terminal() && rows.is_empty() {
        return None;
    }

    let sequence = query.sequence;
    query.sequence += 1;
    query.emitted = true;
    if code.is_terminal() {
        query.responded = true;
    }

    Some(Draft {
        code,
        sequence,
        rows,
        errors: std::mem::take(&mut query.errors),
    })
}
