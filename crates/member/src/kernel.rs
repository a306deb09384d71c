//! Member processing kernel - drives transactions without I/O orchestration
//!
//! The kernel owns every transaction of one member and consumes mailbox
//! events one at a time. Follow-up work produced while an event is handled
//! (deferred merges, final-result notifications, abort requests) is posted
//! to a local queue and drained before `handle` returns, so each turn leaves
//! the member in a settled state.
//!
//! It does NOT own the mailbox receiver or the event loop; see `runtime`.

use crate::config::MemberConfig;
use crate::error::{Error, Result};
use crate::event::{Mailbox, MatchRef, MemberEvent, Responder};
use crate::registration::{CallbackStatus, PrepareContext, PhaseContext, RegId, Registry};
use crate::response::{self, ResponseSender, reroot};
use crate::stats::{Counter, MemberStats};
use crate::transaction::{
    Added, GroupId, GroupPhase, GroupTransaction, Ledger, MatchId, MatchIds, Opened,
    Transaction, TransactionManager, XactEvent, XactHandle, XactState, find_matches,
};
use crate::watchdog::{TimerService, Watchdog};
use databus_common::{KeyPath, QueryId, TransactionId};
use databus_protocol::{
    Action, ErrorCause, ErrorReport, MemberReply, Phase, ResponseCode, ResultRow, RouterEvent,
    WireQuery, XactBody, XactHeader,
};
use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

/// Work posted during a turn and run at its end
#[derive(Debug)]
enum PostedTask {
    /// Flush rows parked in a query's pending table
    MergePending { xact: XactHandle, query: QueryId },
    /// A query sent its final result
    QueryResponded { xact: XactHandle },
    /// Ask the router to abort the transaction
    AbortRequest { xact: XactHandle, report: ErrorReport },
}

/// Decision phases that fan out to every ledger record and group
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Precommit,
    Commit,
    Abort,
}

impl Decision {
    fn phase(self) -> Phase {
        match self {
            Decision::Precommit => Phase::Precommit,
            Decision::Commit => Phase::Commit,
            Decision::Abort => Phase::Abort,
        }
    }

    fn group_phase(self) -> GroupPhase {
        match self {
            Decision::Precommit => GroupPhase::Precommit,
            Decision::Commit => GroupPhase::Commit,
            Decision::Abort => GroupPhase::Abort,
        }
    }
}

/// Judge a decision-phase callback status
fn phase_failure(
    status: CallbackStatus,
    internal: bool,
    who: &str,
    phase: Phase,
) -> Option<(ErrorCause, String)> {
    match status {
        CallbackStatus::Ok | CallbackStatus::Na => None,
        CallbackStatus::Internal if internal => None,
        CallbackStatus::NotOk => Some((ErrorCause::CallbackFailed, format!("{who} refused {phase}"))),
        CallbackStatus::Async => Some((
            ErrorCause::ProtocolViolation,
            format!("{who} returned ASYNC from {phase}"),
        )),
        CallbackStatus::Internal => Some((
            ErrorCause::ProtocolViolation,
            format!("{who} returned INTERNAL from {phase}"),
        )),
    }
}

/// Member processing kernel
///
/// This is the core of a member that:
/// - Runs the per-transaction state machine for router events
/// - Dispatches queries to matching registrations and collects their votes
/// - Aggregates, splits and re-roots query results
/// - Guards every prepare callback with a watchdog
///
/// It does NOT handle:
/// - Receiving from the mailbox (the runtime's responsibility)
/// - Transport to the router (replies leave through an unbounded channel)
pub struct MemberKernel {
    config: MemberConfig,

    /// Registrations and groups of this member
    registry: Registry,

    /// Transaction manager
    xacts: TransactionManager,

    /// Response sender
    response: ResponseSender,

    /// Own mailbox, handed to responders and timers
    mailbox: Mailbox,

    timers: Arc<dyn TimerService>,

    /// Work posted during the current turn
    posted: VecDeque<PostedTask>,

    stats: Arc<MemberStats>,

    match_ids: MatchIds,

    /// Last watchdog token handed out
    next_token: u64,
}

impl MemberKernel {
    /// Create a new member kernel
    pub fn new(
        config: MemberConfig,
        registry: Registry,
        mailbox: Mailbox,
        replies: mpsc::UnboundedSender<MemberReply>,
        timers: Arc<dyn TimerService>,
        stats: Arc<MemberStats>,
    ) -> Self {
        let xacts =
            TransactionManager::new(config.ledger_growth_chunk, config.completed_retention);
        let response = ResponseSender::new(replies, config.name.clone());

        tracing::info!(
            "[{}] Kernel initialized with {} registrations",
            config.name,
            registry.len()
        );

        Self {
            config,
            registry,
            xacts,
            response,
            mailbox,
            timers,
            posted: VecDeque::new(),
            stats,
            match_ids: MatchIds::default(),
            next_token: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &MemberConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut Registry {
        &mut self.registry
    }

    pub fn stats(&self) -> &Arc<MemberStats> {
        &self.stats
    }

    pub fn transactions(&self) -> &TransactionManager {
        &self.xacts
    }

    /// Live transaction by id
    pub fn transaction(&self, id: TransactionId) -> Option<&Transaction> {
        self.xacts.find(id)
    }

    /// Current state, reporting released transactions through their tombstone
    pub fn xact_state(&self, id: TransactionId) -> Option<XactState> {
        self.xacts
            .find(id)
            .map(|x| x.state)
            .or_else(|| self.xacts.tombstone(id).map(|t| t.state))
    }

    pub fn holds(&self, id: TransactionId) -> Option<u32> {
        self.xacts.find(id).map(Transaction::holds)
    }

    /// True once the transaction's state has been released
    pub fn is_released(&self, id: TransactionId) -> bool {
        self.xacts.find(id).is_none() && self.xacts.tombstone(id).is_some()
    }

    /// Handle for the live generation of a transaction
    pub fn handle_of(&self, id: TransactionId) -> Option<XactHandle> {
        self.xacts.lookup(id)
    }

    // === EVENT ENTRY POINT ===

    /// Process one mailbox event and everything it posts
    pub fn handle(&mut self, event: MemberEvent) -> Result<()> {
        let result = match event {
            MemberEvent::Router(event) => self.handle_router(event),
            MemberEvent::Response { target, code, rows } => self.send_response(target, code, rows),
            MemberEvent::WatchdogExpired { target, token } => {
                self.on_watchdog_expired(target, token)
            }
            MemberEvent::Shutdown => Ok(()),
        };
        self.drain_posted();
        result
    }

    fn handle_router(&mut self, event: RouterEvent) -> Result<()> {
        tracing::debug!(
            "[{}] {} for {}",
            self.config.name,
            event.name(),
            event.xact_id()
        );

        match event {
            RouterEvent::Prepare { header, query } => self.on_prepare(header, query),
            RouterEvent::Precommit { header, body } => self.on_precommit(header, body),
            RouterEvent::Commit { header, body } => self.on_commit(header, body),
            RouterEvent::Abort { header, body } => self.on_abort(header, body),
            RouterEvent::End { header } => self.on_end(header),
        }
    }

    // === STATE MACHINE ===

    fn open(&mut self, header: &XactHeader, event: XactEvent) -> Result<(XactHandle, Opened)> {
        let (handle, opened) = match self.xacts.open(header.id, &header.origin, event) {
            Ok(opened) => opened,
            Err(e) => {
                if matches!(e, Error::InvalidTransition { .. }) {
                    self.stats.incr(Counter::InvalidTransitions);
                }
                tracing::warn!("[{}] {:?} for {} refused: {}", self.config.name, event, header.id, e);
                return Err(e);
            }
        };

        match opened {
            Opened::Created => {
                self.stats.incr(Counter::XactsCreated);
                tracing::info!("[{}] Transaction {} created", self.config.name, header.id);
            }
            Opened::Reentered => {
                self.stats.incr(Counter::XactsReentered);
                tracing::info!("[{}] Transaction {} re-entered", self.config.name, header.id);
            }
            Opened::Existing => {}
        }
        Ok((handle, opened))
    }

    /// Next state for `event`, or `InvalidTransition` with the state untouched
    fn transition(
        &self,
        handle: XactHandle,
        event: XactEvent,
        multi_block: bool,
    ) -> Result<XactState> {
        let xact = self.xacts.get(handle)?;
        match xact.state.next(event, multi_block) {
            Some(next) => Ok(next),
            None => {
                self.stats.incr(Counter::InvalidTransitions);
                tracing::warn!(
                    "[{}] Invalid transition: {:?} in {} for {}",
                    self.config.name,
                    event,
                    xact.state,
                    xact.id
                );
                Err(Error::InvalidTransition {
                    state: xact.state,
                    event,
                })
            }
        }
    }

    fn set_state(&mut self, handle: XactHandle, state: XactState) -> Result<()> {
        self.xacts.get_mut(handle)?.state = state;
        Ok(())
    }

    fn on_prepare(&mut self, header: XactHeader, wire: WireQuery) -> Result<()> {
        let (handle, _) = self.open(&header, XactEvent::Prepare)?;
        let next = self.transition(handle, XactEvent::Prepare, false)?;
        let default_credits = self.config.default_credits;
        let query_id = wire.id;
        let transactional = wire.is_transactional();

        let xact = self.xacts.get_mut(handle)?;
        if xact.query_count() == 0 {
            xact.transactional = transactional;
        }
        xact.state = next;
        if xact.add_query(wire, default_credits) == Added::Existing {
            self.stats.incr(Counter::DuplicateQueries);
            tracing::warn!(
                "[{}] Duplicate query {} in {}, keeping the first",
                self.config.name,
                query_id,
                header.id
            );
            return Ok(());
        }

        self.stats.incr(if transactional {
            Counter::TransactionalQueries
        } else {
            Counter::NonTransactionalQueries
        });
        self.prepare_query(handle, query_id)
    }

    fn on_precommit(&mut self, header: XactHeader, body: XactBody) -> Result<()> {
        let (handle, opened) = self.open(&header, XactEvent::Precommit)?;
        if opened == Opened::Reentered {
            // A retried PRECOMMIT after END only resets the transaction
            return Ok(());
        }

        let next = self.transition(handle, XactEvent::Precommit, body.has_multiple_blocks())?;
        let xact = self.xacts.get_mut(handle)?;
        xact.state = next;
        xact.blocks = body.blocks;

        let (code, errors) = self.run_phase(handle, Decision::Precommit)?;
        self.reply_phase(handle, Phase::Precommit, code, errors)
    }

    fn on_commit(&mut self, header: XactHeader, body: XactBody) -> Result<()> {
        let (handle, _) = self.open(&header, XactEvent::Commit)?;
        let next = self.transition(handle, XactEvent::Commit, body.has_multiple_blocks())?;
        self.set_state(handle, next)?;

        let (code, errors) = self.run_phase(handle, Decision::Commit)?;
        self.commit_store(handle)?;
        self.reply_phase(handle, Phase::Commit, code, errors)?;
        self.set_state(handle, XactState::Commit)?;

        tracing::info!("[{}] Transaction {} committed", self.config.name, header.id);
        Ok(())
    }

    fn on_abort(&mut self, header: XactHeader, body: XactBody) -> Result<()> {
        let (handle, _) = self.open(&header, XactEvent::Abort)?;
        let next = self.transition(handle, XactEvent::Abort, body.has_multiple_blocks())?;

        // Watchdogs go before any abort callback runs
        let cancelled = self.cancel_watchdogs(handle)?;
        let xact = self.xacts.get_mut(handle)?;
        xact.state = next;
        for query in xact.queries.values_mut() {
            query.pending.clear();
        }
        self.stats.incr(Counter::Aborts);

        let (code, errors) = self.run_phase(handle, Decision::Abort)?;
        self.reply_phase(handle, Phase::Abort, code, errors)?;
        self.set_state(handle, XactState::Abort)?;

        tracing::info!(
            "[{}] Transaction {} aborted ({} watchdogs cancelled)",
            self.config.name,
            header.id,
            cancelled
        );
        Ok(())
    }

    fn on_end(&mut self, header: XactHeader) -> Result<()> {
        let (handle, _) = self.open(&header, XactEvent::End)?;
        self.transition(handle, XactEvent::End, false)?;
        self.finish_end(handle)
    }

    /// Group deinit, ledger release and END; frees the state once unheld
    fn finish_end(&mut self, handle: XactHandle) -> Result<()> {
        self.cancel_watchdogs(handle)?;

        let xact = self.xacts.get_mut(handle)?;
        let xact_id = xact.id;
        for (group_id, group_xact) in xact.groups.iter_mut() {
            if let Ok(group) = self.registry.group(*group_id) {
                group_xact.deinit(group.hooks.as_ref(), xact_id);
            }
        }
        xact.groups.clear();
        let released = xact.ledger.release();
        xact.state = XactState::End;
        self.stats.incr(Counter::XactsEnded);

        tracing::info!(
            "[{}] Transaction {} ended ({} ledger entries released)",
            self.config.name,
            xact_id,
            released
        );
        self.reap_if_done(handle)
    }

    /// Drop the transaction once END ran and nothing holds it
    fn reap_if_done(&mut self, handle: XactHandle) -> Result<()> {
        let releasable = self
            .xacts
            .get(handle)
            .map(Transaction::is_releasable)
            .unwrap_or(false);
        if !releasable {
            return Ok(());
        }

        let xact = self.xacts.release(handle)?;
        tracing::debug!("[{}] Transaction {} released", self.config.name, xact.id);

        let expired = self.xacts.gc_tombstones(Instant::now());
        if !expired.is_empty() {
            tracing::debug!(
                "[{}] Forgot {} finished transactions",
                self.config.name,
                expired.len()
            );
        }
        Ok(())
    }

    // === PREPARE ===

    fn prepare_query(&mut self, handle: XactHandle, query_id: QueryId) -> Result<()> {
        let request = self.xacts.get(handle)?.find_query(query_id)?.request.clone();

        let matches = match find_matches(&self.registry, &request, &mut self.match_ids) {
            Ok(matches) => matches,
            Err(Error::NotFound(key)) => {
                tracing::debug!(
                    "[{}] No registration for {} {}, answering NA",
                    self.config.name,
                    request.action,
                    key
                );
                return self.emit(handle, query_id, Vec::new());
            }
            Err(e) => return Err(e),
        };

        let ids: Vec<MatchId> = matches.iter().map(|m| m.id).collect();
        let xact = self.xacts.get_mut(handle)?;
        xact.stats.matches += ids.len() as u64;
        xact.find_query_mut(query_id)?.add_matches(matches);

        for match_id in ids {
            self.prepare_match(MatchRef {
                xact: handle,
                query: query_id,
                match_id,
            })?;
        }
        Ok(())
    }

    fn prepare_match(&mut self, target: MatchRef) -> Result<()> {
        let xact = self.xacts.get(target.xact)?;
        let xact_id = xact.id;
        let query = xact.find_query(target.query)?;
        let request = &query.request;
        let (action, credits) = (request.action, query.credits);
        let cursor = request.cursor.clone();
        let return_payload = request.flags.return_payload;
        let m = query.get_match(target.match_id)?;
        let (reg_id, key, payload) = (m.reg, m.key.clone(), m.payload.clone());
        let reg = self.registry.get(reg_id)?.clone();

        // Entries are appended once the match answers ACK; refuse unstorable keys now
        if let Err(e) = Ledger::check_entry(action, &key) {
            return self.fail_match(target, e, Some(key));
        }

        let xact = self.xacts.get_mut(target.xact)?;
        xact.touched.insert(reg_id);
        xact.match_mut(target.query, target.match_id)?.prepared = true;
        if let Some(group_id) = reg.group {
            let group = self.registry.group(group_id)?;
            xact.groups
                .entry(group_id)
                .or_insert_with(|| GroupTransaction::init(group, xact_id));
        }
        self.stats.incr(Counter::MatchesPrepared);

        if let Some(cache) = reg.cache.as_ref()
            && action == Action::Read
        {
            let rows = cache.scan(&key, cursor.as_ref());
            let code = if rows.is_empty() {
                ResponseCode::Na
            } else {
                ResponseCode::Ack
            };
            tracing::debug!(
                "[{}] {} served {} rows for {} from its store",
                self.config.name,
                reg.name,
                rows.len(),
                key
            );
            return self.send_response(target, code, rows);
        }

        self.arm_watchdog(target)?;

        let responder = Responder::new(self.mailbox.clone(), target);
        let xact = self.xacts.get_mut(target.xact)?;
        let scratch = match reg.group {
            Some(group_id) => xact
                .groups
                .get_mut(&group_id)
                .and_then(GroupTransaction::scratch_mut),
            None => None,
        };
        let mut ctx = PrepareContext::new(xact_id, reg_id, target.query, responder, scratch);
        let status = reg.handler.prepare(
            &mut ctx,
            action,
            &key,
            payload.as_ref(),
            credits,
            cursor.as_ref(),
        );
        let mut rows = ctx.into_rows();

        tracing::debug!(
            "[{}] {} prepared {} {} -> {:?} ({} rows)",
            self.config.name,
            reg.name,
            action,
            key,
            status,
            rows.len()
        );

        if rows.is_empty()
            && return_payload
            && action.is_mutating()
            && status == CallbackStatus::Ok
            && key.is_concrete()
            && let Some(payload) = payload
        {
            rows.push(ResultRow::new(key.clone(), payload));
        }

        match status {
            // The answer follows through the responder
            CallbackStatus::Async if rows.is_empty() => Ok(()),
            status => self.send_response(target, status.code(), rows),
        }
    }

    /// Record an error against a match and answer it with NACK
    fn fail_match(&mut self, target: MatchRef, err: Error, key: Option<KeyPath>) -> Result<()> {
        let cause = err.cause();
        let xact = self.xacts.get_mut(target.xact)?;
        let report = self
            .response
            .builder()
            .error_report(&xact.origin, cause, err.to_string(), key);
        xact.find_query_mut(target.query)?.errors.push(report.clone());

        match cause {
            ErrorCause::KeyDup | ErrorCause::KeyMismatch => {
                self.posted.push_back(PostedTask::AbortRequest {
                    xact: target.xact,
                    report,
                });
            }
            ErrorCause::ProtocolViolation => {
                self.stats.incr(Counter::ProtocolViolations);
                tracing::error!("[{}] Protocol violation: {}", self.config.name, err);
            }
            _ => {}
        }
        self.send_response(target, ResponseCode::Nack, Vec::new())
    }

    // === WATCHDOGS ===

    fn arm_watchdog(&mut self, target: MatchRef) -> Result<()> {
        self.next_token += 1;
        let token = self.next_token;
        let timer = self.timers.arm(
            self.config.prepare_timeout,
            self.mailbox.clone(),
            MemberEvent::WatchdogExpired { target, token },
        );

        let xact = self.xacts.get_mut(target.xact)?;
        let previous = xact
            .match_mut(target.query, target.match_id)?
            .watchdog
            .replace(Watchdog::new(token, timer));
        match previous {
            Some(previous) => previous.cancel(),
            None => xact.acquire_hold(),
        }
        self.stats.incr(Counter::WatchdogsArmed);
        Ok(())
    }

    fn on_watchdog_expired(&mut self, target: MatchRef, token: u64) -> Result<()> {
        let Ok(xact) = self.xacts.get_mut(target.xact) else {
            tracing::debug!(
                "[{}] Watchdog {} for a released transaction ignored",
                self.config.name,
                token
            );
            return Ok(());
        };

        let xact_id = xact.id;
        let transactional = xact.transactional;
        let Ok(m) = xact.match_mut(target.query, target.match_id) else {
            return Ok(());
        };
        if m.watchdog.as_ref().map(|w| w.token) != Some(token) {
            tracing::debug!("[{}] Stale watchdog {} ignored", self.config.name, token);
            return Ok(());
        }
        let key = m.key.clone();
        m.take_watchdog();
        xact.release_hold();
        self.stats.incr(Counter::WatchdogsFired);

        tracing::warn!(
            "[{}] Prepare watchdog fired for {} of query {} in {}",
            self.config.name,
            target.match_id,
            target.query,
            xact_id
        );

        let report = self.response.builder().error_report(
            &xact.origin,
            ErrorCause::Timeout,
            format!("prepare callback for {key} timed out"),
            Some(key),
        );
        xact.find_query_mut(target.query)?.errors.push(report);

        let code = if transactional {
            ResponseCode::Nack
        } else {
            ResponseCode::Na
        };
        self.send_response(target, code, Vec::new())
    }

    /// Cancel every watchdog of every query, releasing their holds
    fn cancel_watchdogs(&mut self, handle: XactHandle) -> Result<usize> {
        let xact = self.xacts.get_mut(handle)?;
        let mut cancelled = 0;
        for query in xact.queries.values_mut() {
            for m in query.matches.values_mut() {
                if m.take_watchdog() {
                    cancelled += 1;
                }
            }
        }
        for _ in 0..cancelled {
            xact.release_hold();
        }
        Ok(cancelled)
    }

    // === RESPONSES ===

    /// Deliver a registration's answer for one match
    pub fn send_response(
        &mut self,
        target: MatchRef,
        code: ResponseCode,
        rows: Vec<ResultRow>,
    ) -> Result<()> {
        let xact = self.xacts.get_mut(target.xact)?;
        let xact_id = xact.id;
        let live = xact.state.accepts_responses();
        let query = xact.find_query_mut(target.query)?;

        if query.get_match(target.match_id)?.is_terminal() {
            tracing::warn!(
                "[{}] {} of query {} in {} already answered, dropping {}",
                self.config.name,
                target.match_id,
                target.query,
                xact_id,
                code
            );
            return Err(Error::AlreadyResponded(target.match_id));
        }

        if !live {
            let m = query.get_match_mut(target.match_id)?;
            m.record(code)?;
            let released = code.is_terminal() && m.take_watchdog();
            if released {
                xact.release_hold();
            }
            tracing::debug!(
                "[{}] Late {} for {} in {} dropped",
                self.config.name,
                code,
                target.match_id,
                xact_id
            );
            return Ok(());
        }

        let reg_id = query.get_match(target.match_id)?.reg;
        if code == ResponseCode::Internal {
            let reg = self.registry.get(reg_id)?;
            if !reg.flags.internal {
                let err = Error::ProtocolViolation(format!("{} answered INTERNAL", reg.name));
                let key = query.get_match(target.match_id)?.key.clone();
                return self.fail_match(target, err, Some(key));
            }
        }

        let query_key = query.request.key.clone();
        let mut code = code;
        let mut rerooted = Vec::with_capacity(rows.len());
        let mut mismatch = None;
        for row in &rows {
            match reroot(&row.key, &row.payload, &query_key) {
                Ok(out) => rerooted.extend(out),
                Err(e) => {
                    mismatch = Some((e, row.key.clone()));
                    break;
                }
            }
        }

        let mut abort_report = None;
        if let Some((err, key)) = mismatch {
            code = ResponseCode::Nack;
            rerooted.clear();
            let report = self.response.builder().error_report(
                &xact.origin,
                err.cause(),
                err.to_string(),
                Some(key),
            );
            abort_report = Some(report);
        }

        let query = xact.find_query_mut(target.query)?;
        if let Some(report) = &abort_report {
            query.errors.push(report.clone());
        }
        let (action, serial) = (query.request.action, query.request.serial);
        let m = query.get_match_mut(target.match_id)?;
        m.record(code)?;
        let released = code.is_terminal() && m.take_watchdog();
        let commit_worthy = action.is_mutating()
            && matches!(code, ResponseCode::Ack | ResponseCode::Internal);
        let entry = commit_worthy.then(|| (m.key.clone(), m.payload.clone()));

        let accepted = response::accept(query, target.match_id, rerooted);
        let schedule_merge = accepted.needs_merge && !query.merge_scheduled;
        if schedule_merge {
            query.merge_scheduled = true;
        }
        if released {
            xact.release_hold();
        }
        if schedule_merge {
            xact.acquire_hold();
        }
        if let Some((key, payload)) = entry {
            xact.ledger
                .add_commit_record(reg_id, key, payload, action, query_key, serial)?;
            xact.stats.ledger_entries += 1;
        }

        if let Some(report) = abort_report {
            self.stats.incr(Counter::KeyMismatches);
            tracing::error!(
                "[{}] Key mismatch answering query {} in {}: {}",
                self.config.name,
                target.query,
                xact_id,
                report.message
            );
            self.posted.push_back(PostedTask::AbortRequest {
                xact: target.xact,
                report,
            });
        }
        self.stats.add(Counter::RowsDeferred, accepted.deferred as u64);
        if schedule_merge {
            self.posted.push_back(PostedTask::MergePending {
                xact: target.xact,
                query: target.query,
            });
        }
        if let Some(now) = accepted.now {
            self.emit(target.xact, target.query, now)?;
        }
        Ok(())
    }

    /// Turn rows into the query's next result, if one is due
    fn emit(&mut self, handle: XactHandle, query_id: QueryId, rows: Vec<ResultRow>) -> Result<()> {
        let xact = self.xacts.get_mut(handle)?;
        let xact_id = xact.id;
        let origin = xact.origin.clone();
        let query = xact.find_query_mut(query_id)?;
        let Some(draft) = response::next_result(query, rows) else {
            return Ok(());
        };

        let is_final = draft.is_final();
        let result = databus_protocol::QueryResult {
            xact_id,
            origin,
            query_id,
            serial: query.request.serial,
            sequence: draft.sequence,
            member: self.response.member().to_string(),
            code: draft.code,
            rows: draft.rows,
            corr_id: query.request.corr_id.clone(),
            errors: draft.errors,
        };

        self.stats.incr(Counter::ResultsEmitted);
        self.stats.add(Counter::RowsEmitted, result.rows.len() as u64);
        tracing::debug!(
            "[{}] Result {} for query {} in {}: {} ({} rows)",
            self.config.name,
            result.sequence,
            query_id,
            xact_id,
            result.code,
            result.rows.len()
        );
        self.response.send_result(result);

        if is_final {
            self.posted
                .push_back(PostedTask::QueryResponded { xact: handle });
        }
        Ok(())
    }

    // === POSTED TASKS ===

    fn drain_posted(&mut self) {
        while let Some(task) = self.posted.pop_front() {
            if let Err(e) = self.run_posted(task) {
                tracing::warn!("[{}] Posted task failed: {}", self.config.name, e);
            }
        }
    }

    fn run_posted(&mut self, task: PostedTask) -> Result<()> {
        match task {
            PostedTask::MergePending { xact, query } => {
                self.dispatch_pending_query_response(xact, query)
            }
            PostedTask::QueryResponded { xact } => self.on_query_responded(xact),
            PostedTask::AbortRequest { xact, report } => self.request_abort(xact, report),
        }
    }

    /// Flush a query's pending table into one result and drop the merge hold
    fn dispatch_pending_query_response(
        &mut self,
        handle: XactHandle,
        query_id: QueryId,
    ) -> Result<()> {
        let Ok(xact) = self.xacts.get_mut(handle) else {
            tracing::debug!("[{}] Merge for a released transaction ignored", self.config.name);
            return Ok(());
        };
        xact.release_hold();
        let live = xact.state.accepts_responses();

        if let Ok(query) = xact.find_query_mut(query_id) {
            query.merge_scheduled = false;
            let rows = response::drain_pending(query);
            if live {
                self.stats.incr(Counter::MergesDispatched);
                self.emit(handle, query_id, rows)?;
            } else if !rows.is_empty() {
                tracing::debug!(
                    "[{}] Discarding {} pending rows of query {}",
                    self.config.name,
                    rows.len(),
                    query_id
                );
            }
        }
        self.reap_if_done(handle)
    }

    /// QUERY_RSP: a non-transactional transaction ends once every query is final
    fn on_query_responded(&mut self, handle: XactHandle) -> Result<()> {
        let Ok(xact) = self.xacts.get(handle) else {
            return Ok(());
        };
        if xact.transactional || xact.state != XactState::Prepare {
            return Ok(());
        }

        let next = self.transition(handle, XactEvent::QueryRsp, false)?;
        let xact = self.xacts.get_mut(handle)?;
        xact.state = next;
        if !xact.all_queries_final() {
            return Ok(());
        }

        tracing::info!(
            "[{}] Non-transactional {} answered, ending",
            self.config.name,
            xact.id
        );
        self.commit_store(handle)?;
        self.finish_end(handle)
    }

    fn request_abort(&mut self, handle: XactHandle, report: ErrorReport) -> Result<()> {
        let Ok(xact) = self.xacts.get_mut(handle) else {
            return Ok(());
        };
        if xact.abort_requested || xact.state.is_aborting() || xact.state == XactState::End {
            return Ok(());
        }
        xact.abort_requested = true;
        let (xact_id, origin) = (xact.id, xact.origin.clone());

        self.stats.incr(Counter::AbortRequests);
        tracing::error!(
            "[{}] Requesting abort of {}: {}",
            self.config.name,
            xact_id,
            report.message
        );
        self.response.send_abort_request(xact_id, &origin, report);
        Ok(())
    }

    // === DECISION PHASES ===

    /// Fold every ledger record's and touched group's verdict for a phase
    fn run_phase(
        &mut self,
        handle: XactHandle,
        decision: Decision,
    ) -> Result<(ResponseCode, Vec<ErrorReport>)> {
        let phase = decision.phase();
        let xact = self.xacts.get_mut(handle)?;
        let xact_id = xact.id;
        let builder = self.response.builder();
        let mut failures = Vec::new();

        for record in xact.ledger.records() {
            let Ok(reg) = self.registry.get(record.reg()) else {
                tracing::warn!(
                    "[{}] {} vanished before {}",
                    self.config.name,
                    record.reg(),
                    phase
                );
                continue;
            };
            let ctx = PhaseContext {
                xact: xact_id,
                reg: record.reg(),
                phase,
                origin: &xact.origin,
            };
            let status = match decision {
                Decision::Precommit => reg.handler.precommit(&ctx, record.entries()),
                Decision::Commit => reg.handler.commit(&ctx, record.entries()),
                Decision::Abort => reg.handler.abort(&ctx, record.entries()),
            };
            if let Some(failure) = phase_failure(status, reg.flags.internal, &reg.name, phase) {
                failures.push(failure);
            }
        }

        let groups: BTreeSet<GroupId> = xact
            .touched
            .iter()
            .filter_map(|reg: &RegId| self.registry.get(*reg).ok().and_then(|r| r.group))
            .collect();
        for group_id in groups {
            let (Ok(group), Some(group_xact)) =
                (self.registry.group(group_id), xact.groups.get_mut(&group_id))
            else {
                continue;
            };
            if let Some(status) =
                group_xact.run_once(decision.group_phase(), group.hooks.as_ref(), xact_id)
                && let Some(failure) = phase_failure(status, false, &group.name, phase)
            {
                failures.push(failure);
            }
        }

        let mut code = ResponseCode::Ack;
        if decision == Decision::Precommit && xact.abort_requested {
            code = ResponseCode::Nack;
        }
        let mut errors = Vec::with_capacity(failures.len());
        for (cause, message) in failures {
            code = ResponseCode::Nack;
            if cause == ErrorCause::ProtocolViolation {
                self.stats.incr(Counter::ProtocolViolations);
                tracing::error!("[{}] Protocol violation: {}", self.config.name, message);
            }
            errors.push(builder.error_report(&xact.origin, cause, message, None));
        }
        Ok((code, errors))
    }

    fn reply_phase(
        &mut self,
        handle: XactHandle,
        phase: Phase,
        code: ResponseCode,
        errors: Vec<ErrorReport>,
    ) -> Result<()> {
        let xact = self.xacts.get(handle)?;
        tracing::info!(
            "[{}] {} verdict for {}: {}",
            self.config.name,
            phase,
            xact.id,
            code
        );
        self.response
            .send_phase(xact.id, &xact.origin, phase, code, errors);
        Ok(())
    }

    /// Apply ledger entries of caching registrations to their stores
    fn commit_store(&mut self, handle: XactHandle) -> Result<()> {
        let xact = self.xacts.get(handle)?;
        for record in xact.ledger.records() {
            let Some(cache) = self
                .registry
                .get(record.reg())
                .ok()
                .and_then(|reg| reg.cache.as_ref())
            else {
                continue;
            };
            for entry in record.entries() {
                if let Err(e) = cache.apply(entry) {
                    tracing::warn!(
                        "[{}] Commit-store of {} failed: {}",
                        self.config.name,
                        entry.key,
                        e
                    );
                }
            }
            cache.flush();
        }
        Ok(())
    }
}
