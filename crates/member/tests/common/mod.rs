//! Common test utilities for integration tests

use databus_common::{KeyPath, Payload, TransactionId};
use databus_member::{
    CallbackStatus, CommitEntry, GroupHooks, ManualTimers, Member, MemberConfig, MemberEvent,
    MemberHandle, PhaseContext, PrepareContext, Registry, RegistrationHandler, Responder, Result,
    Scratch,
};
use databus_protocol::{
    AbortRequest, Action, MemberReply, Phase, PhaseReply, QueryResult, RouterEvent, WireQuery,
    XactBody, XactHeader, XactOrigin,
};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

pub fn key(s: &str) -> KeyPath {
    KeyPath::parse(s).unwrap()
}

/// Shared, ordered record of callback activity
#[derive(Clone, Default)]
pub struct CallLog(Arc<Mutex<Vec<String>>>);

impl CallLog {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    #[allow(dead_code)]
    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

/// Registration handler with scripted answers
///
/// Prepare adds the configured rows and returns the configured status;
/// `Async` parks the responder for the test to answer later. Decision
/// callbacks log themselves and return their configured status.
pub struct Scripted {
    pub name: &'static str,
    pub status: CallbackStatus,
    pub rows: Vec<(KeyPath, Payload)>,
    pub precommit_status: CallbackStatus,
    pub log: CallLog,
    /// Timers to sample when the abort callback runs
    pub timers: Option<ManualTimers>,
    parked: Mutex<Vec<Responder>>,
}

impl Scripted {
    pub fn new(name: &'static str, status: CallbackStatus, log: &CallLog) -> Self {
        Self {
            name,
            status,
            rows: Vec::new(),
            precommit_status: CallbackStatus::Ok,
            log: log.clone(),
            timers: None,
            parked: Mutex::new(Vec::new()),
        }
    }

    #[allow(dead_code)]
    pub fn with_row(mut self, k: &str, payload: Payload) -> Self {
        self.rows.push((key(k), payload));
        self
    }

    #[allow(dead_code)]
    pub fn with_precommit(mut self, status: CallbackStatus) -> Self {
        self.precommit_status = status;
        self
    }

    #[allow(dead_code)]
    pub fn watching(mut self, timers: &ManualTimers) -> Self {
        self.timers = Some(timers.clone());
        self
    }

    /// Oldest parked responder
    #[allow(dead_code)]
    pub fn take_responder(&self) -> Option<Responder> {
        let mut parked = self.parked.lock();
        if parked.is_empty() {
            None
        } else {
            Some(parked.remove(0))
        }
    }
}

impl RegistrationHandler for Scripted {
    fn prepare(
        &self,
        ctx: &mut PrepareContext<'_>,
        action: Action,
        key: &KeyPath,
        _payload: Option<&Payload>,
        _credits: u32,
        _cursor: Option<&KeyPath>,
    ) -> CallbackStatus {
        self.log.push(format!("prepare:{}:{action}:{key}", self.name));
        for (k, payload) in &self.rows {
            ctx.add_row(k.clone(), payload.clone());
        }
        if let Some(touches) = ctx.scratch_as::<u32>() {
            *touches += 1;
        }
        if self.status == CallbackStatus::Async {
            self.parked.lock().push(ctx.responder());
        }
        self.status
    }

    fn precommit(&self, _ctx: &PhaseContext<'_>, entries: &[CommitEntry]) -> CallbackStatus {
        self.log
            .push(format!("precommit:{}:{}", self.name, entries.len()));
        self.precommit_status
    }

    fn commit(&self, _ctx: &PhaseContext<'_>, entries: &[CommitEntry]) -> CallbackStatus {
        self.log.push(format!("commit:{}:{}", self.name, entries.len()));
        CallbackStatus::Ok
    }

    fn abort(&self, _ctx: &PhaseContext<'_>, entries: &[CommitEntry]) -> CallbackStatus {
        let armed = self.timers.as_ref().map(ManualTimers::armed).unwrap_or(0);
        self.log
            .push(format!("abort:{}:{}:armed={armed}", self.name, entries.len()));
        CallbackStatus::Ok
    }
}

/// Group hooks that log every call
pub struct LoggingGroup {
    pub log: CallLog,
}

impl GroupHooks for LoggingGroup {
    fn init(&self, _xact: TransactionId) -> Scratch {
        self.log.push("group:init");
        Box::new(0u32)
    }

    fn precommit(&self, _xact: TransactionId, scratch: &mut Scratch) -> CallbackStatus {
        let touches = scratch.downcast_ref::<u32>().copied().unwrap_or(0);
        self.log.push(format!("group:precommit:{touches}"));
        CallbackStatus::Ok
    }

    fn commit(&self, _xact: TransactionId, _scratch: &mut Scratch) -> CallbackStatus {
        self.log.push("group:commit");
        CallbackStatus::Ok
    }

    fn abort(&self, _xact: TransactionId, _scratch: &mut Scratch) -> CallbackStatus {
        self.log.push("group:abort");
        CallbackStatus::Ok
    }

    fn deinit(&self, _xact: TransactionId, _scratch: Scratch) {
        self.log.push("group:deinit");
    }
}

/// A member driven step by step with manual timers
pub struct TestMember {
    pub member: Member,
    pub handle: MemberHandle,
    pub replies: mpsc::UnboundedReceiver<MemberReply>,
    pub timers: ManualTimers,
}

impl TestMember {
    pub fn new(registry: Registry) -> Self {
        Self::with_config(MemberConfig::new("member-under-test"), registry)
    }

    pub fn with_config(config: MemberConfig, registry: Registry) -> Self {
        Self::with_timers(config, registry, ManualTimers::new())
    }

    pub fn with_timers(config: MemberConfig, registry: Registry, timers: ManualTimers) -> Self {
        let (member, handle, replies) = Member::new(config, registry, Arc::new(timers.clone()));
        Self {
            member,
            handle,
            replies,
            timers,
        }
    }

    /// Run one router event directly, returning the kernel's verdict
    pub fn send(&mut self, event: RouterEvent) -> Result<()> {
        let result = self.member.kernel_mut().handle(MemberEvent::Router(event));
        self.member.pump();
        result
    }

    pub fn prepare(&mut self, id: TransactionId, query: WireQuery) -> Result<()> {
        self.send(RouterEvent::Prepare {
            header: header(id),
            query,
        })
    }

    #[allow(dead_code)]
    pub fn precommit(&mut self, id: TransactionId) -> Result<()> {
        self.send(RouterEvent::Precommit {
            header: header(id),
            body: XactBody::default(),
        })
    }

    #[allow(dead_code)]
    pub fn commit(&mut self, id: TransactionId) -> Result<()> {
        self.send(RouterEvent::Commit {
            header: header(id),
            body: XactBody::default(),
        })
    }

    #[allow(dead_code)]
    pub fn abort(&mut self, id: TransactionId) -> Result<()> {
        self.send(RouterEvent::Abort {
            header: header(id),
            body: XactBody::default(),
        })
    }

    #[allow(dead_code)]
    pub fn end(&mut self, id: TransactionId) -> Result<()> {
        self.send(RouterEvent::End { header: header(id) })
    }

    /// Fire every live watchdog and process the expiries
    #[allow(dead_code)]
    pub fn fire_timers(&mut self) -> usize {
        let fired = self.timers.fire_all();
        self.member.pump();
        fired
    }

    pub fn drain(&mut self) -> Vec<MemberReply> {
        let mut out = Vec::new();
        while let Ok(reply) = self.replies.try_recv() {
            out.push(reply);
        }
        out
    }
}

pub fn header(id: TransactionId) -> XactHeader {
    XactHeader::new(id).with_origin(XactOrigin {
        router_idx: 1,
        client_idx: 7,
        serialno: 42,
        router_path: "/routers/r1".to_string(),
        client_path: "/clients/c7".to_string(),
    })
}

pub fn results(replies: &[MemberReply]) -> Vec<QueryResult> {
    replies
        .iter()
        .filter_map(|r| match r {
            MemberReply::Query(q) => Some(q.clone()),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn phase_replies(replies: &[MemberReply], phase: Phase) -> Vec<PhaseReply> {
    replies
        .iter()
        .filter_map(|r| match r {
            MemberReply::Phase(p) if p.phase == phase => Some(p.clone()),
            _ => None,
        })
        .collect()
}

#[allow(dead_code)]
pub fn abort_requests(replies: &[MemberReply]) -> Vec<AbortRequest> {
    replies
        .iter()
        .filter_map(|r| match r {
            MemberReply::AbortRequest(a) => Some(a.clone()),
            _ => None,
        })
        .collect()
}
