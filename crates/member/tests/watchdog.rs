//! Prepare watchdog behaviour: timeouts, cancellation and hold accounting

mod common;

use common::{CallLog, Scripted, TestMember, key, phase_replies, results};
use databus_common::TransactionId;
use databus_member::{
    CallbackStatus, Counter, ManualTimers, MemberConfig, Registration, Registry, Role,
};
use databus_protocol::{
    Action, ErrorCause, MemberReply, Phase, QueryFlags, ResponseCode, ResultRow, WireQuery,
};
use proptest::prelude::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn silent(log: &CallLog) -> (Arc<Scripted>, Registry) {
    let handler = Arc::new(Scripted::new("silent", CallbackStatus::Async, log));
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "silent",
        key("/s"),
        Role::Publisher,
        handler.clone(),
    ));
    (handler, registry)
}

#[test]
fn test_timeout_synthesizes_nack() {
    let log = CallLog::default();
    let (handler, registry) = silent(&log);
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(id, WireQuery::new(1, Action::Read, key("/s")))
        .unwrap();
    assert!(member.drain().is_empty());
    assert_eq!(member.member.kernel().holds(id), Some(1));

    assert_eq!(member.fire_timers(), 1);
    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResponseCode::Nack);
    assert_eq!(results[0].errors.len(), 1);
    assert_eq!(results[0].errors[0].cause, ErrorCause::Timeout);
    assert_eq!(results[0].errors[0].key, Some(key("/s")));
    assert_eq!(member.member.kernel().holds(id), Some(0));

    // The real answer arrives too late and is dropped
    handler
        .take_responder()
        .unwrap()
        .respond(ResponseCode::Ack, vec![ResultRow::new(key("/s"), json!(1))])
        .unwrap();
    member.member.pump();
    assert!(member.drain().is_empty());

    member.abort(id).unwrap();
    member.end(id).unwrap();
    assert!(member.member.kernel().is_released(id));
    assert_eq!(member.member.kernel().stats().get(Counter::WatchdogsFired), 1);
}

#[test]
fn test_timeout_on_non_transactional_query_is_na() {
    let log = CallLog::default();
    let (_handler, registry) = silent(&log);
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Read, key("/s")).with_flags(QueryFlags::non_transactional()),
        )
        .unwrap();
    member.fire_timers();

    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResponseCode::Na);
    assert_eq!(results[0].errors[0].cause, ErrorCause::Timeout);
    assert!(member.member.kernel().is_released(id));
}

#[test]
fn test_timeout_follows_configured_duration() {
    let log = CallLog::default();
    let (_handler, registry) = silent(&log);
    let config = MemberConfig::new("m").with_prepare_timeout(Duration::from_secs(2));
    let mut member = TestMember::with_config(config, registry);
    let id = TransactionId::new();

    member
        .prepare(id, WireQuery::new(1, Action::Read, key("/s")))
        .unwrap();

    assert_eq!(member.timers.advance(Duration::from_secs(1)), 0);
    assert_eq!(member.timers.advance(Duration::from_secs(2)), 1);
    member.member.pump();
    assert_eq!(results(&member.drain())[0].code, ResponseCode::Nack);
}

#[test]
fn test_abort_cancels_watchdogs_before_callbacks() {
    let log = CallLog::default();
    let timers = ManualTimers::new();
    let fast = Arc::new(Scripted::new("fast", CallbackStatus::Ok, &log).watching(&timers));
    let slow = Arc::new(Scripted::new("slow", CallbackStatus::Async, &log));
    let mut registry = Registry::new();
    registry.register(Registration::new("fast", key("/w/fast"), Role::Subscriber, fast));
    registry.register(Registration::new(
        "slow",
        key("/w/slow"),
        Role::Subscriber,
        slow.clone(),
    ));
    let mut member = TestMember::with_timers(MemberConfig::new("m"), registry, timers.clone());
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Update, key("/w")).with_payload(json!({"fast": 1, "slow": 2})),
        )
        .unwrap();
    assert_eq!(timers.armed(), 1);

    member.abort(id).unwrap();
    assert_eq!(log.count("abort:fast:1:armed=0"), 1);
    // Only the registration that accepted holds a ledger entry
    assert_eq!(log.count("abort:slow"), 0);
    assert_eq!(timers.cancelled(), 2);
    assert_eq!(member.member.kernel().holds(id), Some(0));

    // Nothing left to fire, and a late answer is swallowed
    assert_eq!(member.fire_timers(), 0);
    slow.take_responder()
        .unwrap()
        .respond(ResponseCode::Ack, Vec::new())
        .unwrap();
    member.member.pump();

    let replies = member.drain();
    assert!(results(&replies).is_empty());
    assert_eq!(phase_replies(&replies, Phase::Abort).len(), 1);
    assert_eq!(replies.len(), 1);

    member.end(id).unwrap();
    assert!(member.member.kernel().is_released(id));
}

#[test]
fn test_end_waits_for_nothing_once_watchdogs_are_gone() {
    let log = CallLog::default();
    let (_handler, registry) = silent(&log);
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(id, WireQuery::new(1, Action::Read, key("/s")))
        .unwrap();
    member.abort(id).unwrap();
    member.end(id).unwrap();

    // The expiry of a released transaction is stale
    assert_eq!(member.timers.fire_all(), 0);
    member.member.pump();
    assert!(member.member.kernel().is_released(id));
    assert!(
        member
            .drain()
            .iter()
            .all(|r| !matches!(r, MemberReply::Query(_)))
    );
}

#[derive(Debug, Clone)]
enum Step {
    Respond(usize),
    Fire,
}

fn steps(matches: usize) -> impl Strategy<Value = Vec<Step>> {
    prop::collection::vec(
        prop_oneof![(0..matches).prop_map(Step::Respond), Just(Step::Fire)],
        0..12,
    )
}

proptest! {
    /// Whatever the order of answers and expiries, every watchdog is
    /// released exactly once and the query ends with one final result
    #[test]
    fn prop_watchdog_released_exactly_once(plan in steps(3)) {
        let log = CallLog::default();
        let mut registry = Registry::new();
        let mut handlers = Vec::new();
        for i in 0..3 {
            let handler = Arc::new(Scripted::new("async", CallbackStatus::Async, &log));
            registry.register(Registration::new(
                format!("r{i}"),
                key(&format!("/p/r{i}")),
                Role::Publisher,
                handler.clone(),
            ));
            handlers.push(handler);
        }
        let mut member = TestMember::new(registry);
        let id = TransactionId::new();

        member.prepare(id, WireQuery::new(1, Action::Read, key("/p/*"))).unwrap();
        prop_assert_eq!(member.member.kernel().holds(id), Some(3));

        let responders: Vec<_> = handlers
            .iter()
            .map(|h| h.take_responder().unwrap())
            .collect();
        for step in plan.into_iter().chain([Step::Fire]) {
            match step {
                Step::Respond(i) => {
                    let _ = responders[i].respond(
                        ResponseCode::Ack,
                        vec![ResultRow::new(key(&format!("/p/r{i}")), json!(i))],
                    );
                    member.member.pump();
                }
                Step::Fire => {
                    member.fire_timers();
                }
            }
            let holds = member.member.kernel().holds(id).unwrap();
            prop_assert!(holds <= 3);
        }

        prop_assert_eq!(member.member.kernel().holds(id), Some(0));
        prop_assert_eq!(member.timers.armed(), 0);

        let results = results(&member.drain());
        let finals = results.iter().filter(|r| r.code.is_terminal()).count();
        prop_assert_eq!(finals, 1);
        prop_assert!(results.last().unwrap().code.is_terminal());

        member.abort(id).unwrap();
        member.end(id).unwrap();
        prop_assert!(member.member.kernel().is_released(id));
    }
}
