//! Result aggregation, credit splitting and re-rooting through a live member

mod common;

use common::{CallLog, Scripted, TestMember, abort_requests, key, phase_replies, results};
use databus_common::{Payload, TransactionId};
use databus_member::{
    AppData, CallbackStatus, Counter, QueuedStore, Registration, Registry, Role, UnsafeStore,
    XactState,
};
use databus_protocol::{Action, ErrorCause, Phase, QueryFlags, ResponseCode, WireQuery};
use serde_json::json;
use std::sync::Arc;

#[test]
fn test_create_with_single_row() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "users",
        key("/users/*"),
        Role::Subscriber,
        Arc::new(
            Scripted::new("users", CallbackStatus::Ok, &log)
                .with_row("/users/alice", json!({"uid": 1000})),
        ),
    ));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Create, key("/users/alice"))
                .with_payload(json!({"uid": 1000}))
                .with_credits(10)
                .with_serial(77),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    let result = &results[0];
    assert_eq!(result.code, ResponseCode::Ack);
    assert_eq!(result.xact_id, id);
    assert_eq!(result.serial, 77);
    assert_eq!(result.sequence, 0);
    assert_eq!(result.origin.client_idx, 7);
    assert_eq!(result.rows.len(), 1);
    assert_eq!(result.rows[0].key, key("/users/alice"));
    assert_eq!(result.rows[0].payload, json!({"uid": 1000}));
}

#[test]
fn test_query_waits_for_every_match() {
    let log = CallLog::default();
    let fast = Arc::new(Scripted::new("fast", CallbackStatus::Ok, &log).with_row("/p/a", json!(1)));
    let slow = Arc::new(Scripted::new("slow", CallbackStatus::Async, &log));
    let mut registry = Registry::new();
    registry.register(Registration::new("fast", key("/p/a"), Role::Publisher, fast));
    registry.register(Registration::new("slow", key("/p/b"), Role::Publisher, slow.clone()));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Read, key("/p/*")).with_flags(QueryFlags::non_transactional()),
        )
        .unwrap();

    // The first answer goes out, but as a partial result
    let first = results(&member.drain());
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].code, ResponseCode::Async);
    assert_eq!(first[0].rows.len(), 1);
    assert_eq!(member.member.kernel().xact_state(id), Some(XactState::Prepare));
    assert!(!member.member.kernel().is_released(id));

    slow.take_responder()
        .unwrap()
        .respond(
            ResponseCode::Ack,
            vec![databus_protocol::ResultRow::new(key("/p/b"), json!(2))],
        )
        .unwrap();
    member.member.pump();

    let last = results(&member.drain());
    assert_eq!(last.len(), 1);
    assert_eq!(last[0].code, ResponseCode::Ack);
    assert_eq!(last[0].sequence, 1);
    assert_eq!(last[0].rows[0].key, key("/p/b"));
    assert!(member.member.kernel().is_released(id));
}

#[test]
fn test_rows_beyond_credit_follow_in_order() {
    let log = CallLog::default();
    let mut scripted = Scripted::new("table", CallbackStatus::Ok, &log);
    for i in 0..25 {
        scripted = scripted.with_row(&format!("/t/r{i:02}"), json!(i));
    }
    let mut registry = Registry::new();
    registry.register(Registration::new("table", key("/t"), Role::Publisher, Arc::new(scripted)));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Read, key("/t/*"))
                .with_credits(10)
                .with_corr_id(b"req-9".to_vec()),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results.len(), 2);

    assert_eq!(results[0].code, ResponseCode::Async);
    assert_eq!(results[0].rows.len(), 10);
    assert_eq!(results[1].code, ResponseCode::Ack);
    assert_eq!(results[1].rows.len(), 15);

    let order: Vec<Payload> = results
        .iter()
        .flat_map(|r| r.rows.iter().map(|row| row.payload.clone()))
        .collect();
    assert_eq!(order, (0..25).map(|i| json!(i)).collect::<Vec<_>>());

    for result in &results {
        assert_eq!(result.corr_id.as_deref(), Some(&b"req-9"[..]));
    }

    let stats = member.member.kernel().stats();
    assert_eq!(stats.get(Counter::RowsDeferred), 15);
    assert_eq!(stats.get(Counter::MergesDispatched), 1);
    assert_eq!(member.member.kernel().holds(id), Some(0));
}

#[test]
fn test_shallow_registration_fans_out() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "interfaces",
        key("/if"),
        Role::Publisher,
        Arc::new(Scripted::new("interfaces", CallbackStatus::Ok, &log).with_row(
            "/if",
            json!({"eth0": {"mtu": 1500}, "eth1": {"mtu": 9000}}),
        )),
    ));
    let mut member = TestMember::new(registry);

    member
        .prepare(
            TransactionId::new(),
            WireQuery::new(1, Action::Read, key("/if/*/mtu")),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    let rows = &results[0].rows;
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0].key, key("/if/eth0/mtu"));
    assert_eq!(rows[0].payload, json!(1500));
    assert_eq!(rows[1].key, key("/if/eth1/mtu"));
    assert_eq!(rows[1].payload, json!(9000));
}

#[test]
fn test_deep_registration_is_wrapped() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "mtu",
        key("/if/eth0/mtu"),
        Role::Publisher,
        Arc::new(Scripted::new("mtu", CallbackStatus::Ok, &log).with_row("/if/eth0/mtu", json!(1500))),
    ));
    let mut member = TestMember::new(registry);

    member
        .prepare(TransactionId::new(), WireQuery::new(1, Action::Read, key("/if")))
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results[0].rows.len(), 1);
    assert_eq!(results[0].rows[0].key, key("/if"));
    assert_eq!(results[0].rows[0].payload, json!({"eth0": {"mtu": 1500}}));
}

#[test]
fn test_key_mismatch_requests_abort() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "stray",
        key("/k"),
        Role::Publisher,
        Arc::new(Scripted::new("stray", CallbackStatus::Ok, &log).with_row("/elsewhere", json!(0))),
    ));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(id, WireQuery::new(1, Action::Read, key("/k")))
        .unwrap();
    member.precommit(id).unwrap();

    let replies = member.drain();
    let results = results(&replies);
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResponseCode::Nack);
    assert!(results[0].rows.is_empty());
    assert_eq!(results[0].errors[0].cause, ErrorCause::KeyMismatch);
    assert_eq!(results[0].errors[0].key, Some(key("/elsewhere")));

    let requests = abort_requests(&replies);
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].xact_id, id);
    assert_eq!(requests[0].report.cause, ErrorCause::KeyMismatch);
    assert_eq!(requests[0].report.router_path, "/routers/r1");

    // The member no longer votes for this transaction
    assert_eq!(phase_replies(&replies, Phase::Precommit)[0].code, ResponseCode::Nack);
    assert_eq!(member.member.kernel().stats().get(Counter::KeyMismatches), 1);
}

#[test]
fn test_wildcard_write_is_key_dup() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "any",
        key("/a/*"),
        Role::Subscriber,
        Arc::new(Scripted::new("any", CallbackStatus::Ok, &log)),
    ));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Update, key("/a/*")).with_payload(json!({"x": 1})),
        )
        .unwrap();

    let replies = member.drain();
    let results = results(&replies);
    assert_eq!(results[0].code, ResponseCode::Nack);
    assert_eq!(results[0].errors[0].cause, ErrorCause::KeyDup);
    assert_eq!(abort_requests(&replies).len(), 1);
    // The callback never ran for a write it could not record
    assert_eq!(log.count("prepare"), 0);
}

#[test]
fn test_return_payload_echoes_write() {
    let log = CallLog::default();
    let mut registry = Registry::new();
    registry.register(Registration::new(
        "cfg",
        key("/cfg/*"),
        Role::Subscriber,
        Arc::new(Scripted::new("cfg", CallbackStatus::Ok, &log)),
    ));
    let mut member = TestMember::new(registry);

    member
        .prepare(
            TransactionId::new(),
            WireQuery::new(1, Action::Update, key("/cfg/x"))
                .with_payload(json!(5))
                .with_flags(databus_protocol::QueryFlags {
                    return_payload: true,
                    ..Default::default()
                }),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results[0].code, ResponseCode::Ack);
    assert_eq!(results[0].rows.len(), 1);
    assert_eq!(results[0].rows[0].key, key("/cfg/x"));
    assert_eq!(results[0].rows[0].payload, json!(5));
}

#[test]
fn test_unmatched_query_is_na() {
    let mut member = TestMember::new(Registry::new());

    member
        .prepare(
            TransactionId::new(),
            WireQuery::new(1, Action::Read, key("/missing")).with_corr_id(vec![7]),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResponseCode::Na);
    assert_eq!(results[0].corr_id, Some(vec![7]));
}

#[test]
fn test_caching_registration_serves_committed_rows() {
    let store = Arc::new(UnsafeStore::new(key("/db")));
    let mut registry = Registry::new();
    registry.register(Registration::cached(
        "db",
        key("/db/*"),
        Role::Subscriber,
        store.clone(),
    ));
    let mut member = TestMember::new(registry);

    let writer = TransactionId::new();
    member
        .prepare(
            writer,
            WireQuery::new(1, Action::Create, key("/db/a")).with_payload(json!({"n": 1})),
        )
        .unwrap();
    assert_eq!(store.len(), 0);
    member.precommit(writer).unwrap();
    member.commit(writer).unwrap();
    member.end(writer).unwrap();
    assert_eq!(
        AppData::<databus_common::KeyPath>::get(&*store, &key("/db/a")).unwrap(),
        Some(json!({"n": 1}))
    );
    member.drain();

    let reader = TransactionId::new();
    member
        .prepare(
            reader,
            WireQuery::new(1, Action::Read, key("/db/*")).with_flags(QueryFlags {
                sub_read: true,
                ..Default::default()
            }),
        )
        .unwrap();

    let results = results(&member.drain());
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].code, ResponseCode::Ack);
    assert_eq!(results[0].rows.len(), 1);
    assert_eq!(results[0].rows[0].key, key("/db/a"));
}

#[test]
fn test_non_transactional_write_reaches_queued_store() {
    let store = Arc::new(QueuedStore::new(key("/q")));
    let mut registry = Registry::new();
    registry.register(Registration::cached(
        "queue",
        key("/q/*"),
        Role::Subscriber,
        store.clone(),
    ));
    let mut member = TestMember::new(registry);
    let id = TransactionId::new();

    member
        .prepare(
            id,
            WireQuery::new(1, Action::Update, key("/q/item"))
                .with_payload(json!("x"))
                .with_flags(QueryFlags::non_transactional()),
        )
        .unwrap();

    assert!(member.member.kernel().is_released(id));
    // Flushed by the synthesized END
    assert_eq!(store.queued(), 0);
    assert_eq!(
        AppData::<databus_common::KeyPath>::get(&*store, &key("/q/item")).unwrap(),
        Some(json!("x"))
    );
}
