//! Process-wide counters for a member
//!
//! One `MemberStats` is shared through an `Arc` by everything that records
//! activity; nothing here is global.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Individual counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    XactsCreated,
    XactsEnded,
    XactsReentered,
    TransactionalQueries,
    NonTransactionalQueries,
    DuplicateQueries,
    MatchesPrepared,
    ResultsEmitted,
    RowsEmitted,
    RowsDeferred,
    MergesDispatched,
    WatchdogsArmed,
    WatchdogsFired,
    Aborts,
    AbortRequests,
    KeyMismatches,
    ProtocolViolations,
    InvalidTransitions,
}

const COUNTERS: usize = Counter::InvalidTransitions as usize + 1;

/// Atomic activity counters
#[derive(Debug, Default)]
pub struct MemberStats {
    counters: [AtomicU64; COUNTERS],
}

impl MemberStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.counters[counter as usize].fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter as usize].load(Ordering::Relaxed)
    }

    /// Point-in-time copy of every counter
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            xacts_created: self.get(Counter::XactsCreated),
            xacts_ended: self.get(Counter::XactsEnded),
            xacts_reentered: self.get(Counter::XactsReentered),
            transactional_queries: self.get(Counter::TransactionalQueries),
            non_transactional_queries: self.get(Counter::NonTransactionalQueries),
            duplicate_queries: self.get(Counter::DuplicateQueries),
            matches_prepared: self.get(Counter::MatchesPrepared),
            results_emitted: self.get(Counter::ResultsEmitted),
            rows_emitted: self.get(Counter::RowsEmitted),
            rows_deferred: self.get(Counter::RowsDeferred),
            merges_dispatched: self.get(Counter::MergesDispatched),
            watchdogs_armed: self.get(Counter::WatchdogsArmed),
            watchdogs_fired: self.get(Counter::WatchdogsFired),
            aborts: self.get(Counter::Aborts),
            abort_requests: self.get(Counter::AbortRequests),
            key_mismatches: self.get(Counter::KeyMismatches),
            protocol_violations: self.get(Counter::ProtocolViolations),
            invalid_transitions: self.get(Counter::InvalidTransitions),
        }
    }
}

/// Serialisable copy of `MemberStats`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub xacts_created: u64,
    pub xacts_ended: u64,
    pub xacts_reentered: u64,
    pub transactional_queries: u64,
    pub non_transactional_queries: u64,
    pub duplicate_queries: u64,
    pub matches_prepared: u64,
    pub results_emitted: u64,
    pub rows_emitted: u64,
    pub rows_deferred: u64,
    pub merges_dispatched: u64,
    pub watchdogs_armed: u64,
    pub watchdogs_fired: u64,
    pub aborts: u64,
    pub abort_requests: u64,
    pub key_mismatches: u64,
    pub protocol_violations: u64,
    pub invalid_transitions: u64,
}
