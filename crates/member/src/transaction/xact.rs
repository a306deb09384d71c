//! Per-transaction state owned by the transaction manager

use super::group::GroupTransaction;
use super::ledger::Ledger;
use super::query::{Added, Match, MatchId, Query};
use super::state::XactState;
use super::GroupId;
use crate::error::{Error, Result};
use crate::registration::RegId;
use databus_common::{QueryId, TransactionId};
use databus_protocol::{WireQuery, XactOrigin};
use std::collections::{BTreeMap, BTreeSet};

/// Per-transaction counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct XactStats {
    pub transactional_queries: u64,
    pub non_transactional_queries: u64,
    pub duplicate_queries: u64,
    pub matches: u64,
    pub ledger_entries: u64,
}

/// One distributed transaction as seen by this member
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub origin: XactOrigin,
    pub state: XactState,
    /// False when the transaction runs outside the two-phase protocol
    pub transactional: bool,
    /// Query blocks the router reported
    pub blocks: u32,
    pub(crate) queries: BTreeMap<QueryId, Query>,
    pub(crate) ledger: Ledger,
    pub(crate) groups: BTreeMap<GroupId, GroupTransaction>,
    /// Registrations prepared at least once
    pub(crate) touched: BTreeSet<RegId>,
    pub stats: XactStats,
    /// Outstanding asynchronous work (watchdogs, deferred merges)
    holds: u32,
    /// An abort request went to the router
    pub abort_requested: bool,
}

impl Transaction {
    pub fn new(id: TransactionId, origin: XactOrigin, ledger_chunk: usize) -> Self {
        Self {
            id,
            origin,
            state: XactState::Init,
            transactional: true,
            blocks: 1,
            queries: BTreeMap::new(),
            ledger: Ledger::new(ledger_chunk),
            groups: BTreeMap::new(),
            touched: BTreeSet::new(),
            stats: XactStats::default(),
            holds: 0,
            abort_requested: false,
        }
    }

    pub fn find_query(&self, id: QueryId) -> Result<&Query> {
        self.queries.get(&id).ok_or(Error::QueryNotFound {
            xact: self.id,
            query: id,
        })
    }

    pub fn find_query_mut(&mut self, id: QueryId) -> Result<&mut Query> {
        let xact = self.id;
        self.queries
            .get_mut(&id)
            .ok_or(Error::QueryNotFound { xact, query: id })
    }

    /// Copy a wire query into the registry unless its id is already known
    pub fn add_query(&mut self, request: WireQuery, default_credits: u32) -> Added {
        if self.queries.contains_key(&request.id) {
            self.stats.duplicate_queries += 1;
            return Added::Existing;
        }
        if request.is_transactional() {
            self.stats.transactional_queries += 1;
        } else {
            self.stats.non_transactional_queries += 1;
        }
        self.queries
            .insert(request.id, Query::new(request, default_credits));
        Added::New
    }

    pub fn queries(&self) -> impl Iterator<Item = &Query> {
        self.queries.values()
    }

    pub fn query_count(&self) -> usize {
        self.queries.len()
    }

    pub fn match_mut(&mut self, query: QueryId, id: MatchId) -> Result<&mut Match> {
        self.find_query_mut(query)?.get_match_mut(id)
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn group(&self, id: GroupId) -> Option<&GroupTransaction> {
        self.groups.get(&id)
    }

    pub fn holds(&self) -> u32 {
        self.holds
    }

    pub(crate) fn acquire_hold(&mut self) {
        self.holds += 1;
    }

    pub(crate) fn release_hold(&mut self) {
        match self.holds.checked_sub(1) {
            Some(holds) => self.holds = holds,
            None => tracing::error!("Hold released twice on transaction {}", self.id),
        }
    }

    /// Every query has sent its final result and no merge is outstanding
    pub fn all_queries_final(&self) -> bool {
        self.queries
            .values()
            .all(|q| q.responded && !q.merge_scheduled)
    }

    /// Ready to be dropped: END processed and nothing holds it
    pub fn is_releasable(&self) -> bool {
        self.state == XactState::End && self.holds == 0
    }
}
