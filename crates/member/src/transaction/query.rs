//! Query registry and match lists

use crate::error::{Error, Result};
use crate::registration::{RegId, Registry};
use crate::watchdog::Watchdog;
use databus_common::{KeyPath, Payload, QueryId};
use databus_protocol::{ErrorReport, ResponseCode, ResultRow, WireQuery};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Process-wide, monotonically increasing match identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MatchId(pub u64);

impl fmt::Display for MatchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// Source of `MatchId`s
#[derive(Debug, Default)]
pub struct MatchIds {
    last: u64,
}

impl MatchIds {
    pub fn next(&mut self) -> MatchId {
        self.last += 1;
        MatchId(self.last)
    }
}

/// One registration's share of a query
#[derive(Debug)]
pub struct Match {
    pub id: MatchId,
    pub reg: RegId,
    /// Query key narrowed by the registration key
    pub key: KeyPath,
    /// Part of the query payload rooted at `key`
    pub payload: Option<Payload>,
    pub prepared: bool,
    /// Code of the most recent response
    pub last_code: Option<ResponseCode>,
    terminal: Option<ResponseCode>,
    pub(crate) watchdog: Option<Watchdog>,
}

impl Match {
    pub fn new(id: MatchId, reg: RegId, key: KeyPath, payload: Option<Payload>) -> Self {
        Self {
            id,
            reg,
            key,
            payload,
            prepared: false,
            last_code: None,
            terminal: None,
            watchdog: None,
        }
    }

    pub fn terminal(&self) -> Option<ResponseCode> {
        self.terminal
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn has_watchdog(&self) -> bool {
        self.watchdog.is_some()
    }

    /// Cancel and drop the watchdog, reporting whether one was running
    pub(crate) fn take_watchdog(&mut self) -> bool {
        match self.watchdog.take() {
            Some(watchdog) => {
                watchdog.cancel();
                true
            }
            None => false,
        }
    }

    /// Record a response code; a second terminal code is refused
    pub fn record(&mut self, code: ResponseCode) -> Result<()> {
        if self.terminal.is_some() {
            return Err(Error::AlreadyResponded(self.id));
        }
        self.last_code = Some(code);
        if code.is_terminal() {
            self.terminal = Some(code);
        }
        Ok(())
    }
}

/// Match the query against every registration, in registration order
///
/// Fails with `NotFound` when nothing overlaps.
pub fn find_matches(registry: &Registry, query: &WireQuery, ids: &mut MatchIds) -> Result<Vec<Match>> {
    let matches: Vec<Match> = registry
        .iter()
        .filter_map(|(reg_id, reg)| {
            reg.resolve(query)
                .map(|resolved| Match::new(ids.next(), reg_id, resolved.key, resolved.payload))
        })
        .collect();

    if matches.is_empty() {
        return Err(Error::NotFound(query.key.clone()));
    }
    Ok(matches)
}

/// A query received in PREPARE and everything needed to answer it
#[derive(Debug)]
pub struct Query {
    pub request: WireQuery,
    /// Credit actually in force (never zero)
    pub credits: u32,
    pub(crate) matches: BTreeMap<MatchId, Match>,
    /// Rows waiting for a deferred merge, already re-rooted
    pub(crate) pending: BTreeMap<MatchId, Vec<ResultRow>>,
    pub(crate) errors: Vec<ErrorReport>,
    /// At least one result left the member
    pub(crate) emitted: bool,
    /// The final result left the member
    pub(crate) responded: bool,
    pub(crate) merge_scheduled: bool,
    pub(crate) sequence: u32,
}

impl Query {
    pub fn new(request: WireQuery, default_credits: u32) -> Self {
        let credits = if request.credits == 0 {
            default_credits.max(1)
        } else {
            request.credits
        };
        Self {
            request,
            credits,
            matches: BTreeMap::new(),
            pending: BTreeMap::new(),
            errors: Vec::new(),
            emitted: false,
            responded: false,
            merge_scheduled: false,
            sequence: 0,
        }
    }

    pub fn id(&self) -> QueryId {
        self.request.id
    }

    pub fn add_matches(&mut self, matches: Vec<Match>) {
        for m in matches {
            self.matches.insert(m.id, m);
        }
    }

    /// Matches in ascending id order
    pub fn matches(&self) -> impl Iterator<Item = &Match> {
        self.matches.values()
    }

    pub fn match_ids(&self) -> Vec<MatchId> {
        self.matches.keys().copied().collect()
    }

    pub fn get_match(&self, id: MatchId) -> Result<&Match> {
        self.matches.get(&id).ok_or(Error::MatchNotFound(id))
    }

    pub fn get_match_mut(&mut self, id: MatchId) -> Result<&mut Match> {
        self.matches.get_mut(&id).ok_or(Error::MatchNotFound(id))
    }

    pub fn pending_rows(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    pub fn is_responded(&self) -> bool {
        self.responded
    }

    pub fn errors(&self) -> &[ErrorReport] {
        &self.errors
    }

    /// Code a result would carry right now
    ///
    /// ASYNC while any match is still open or rows are waiting; otherwise
    /// the combination of every match's terminal code.
    pub fn current_code(&self) -> ResponseCode {
        if !self.pending.is_empty() || self.matches.values().any(|m| !m.is_terminal()) {
            return ResponseCode::Async;
        }
        ResponseCode::combine(self.matches.values().filter_map(Match::terminal))
    }
}

/// Outcome of adding a query to a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Added {
    New,
    /// The id was already known; the existing query is kept
    Existing,
}
