//! End-to-end REQ/REP behaviour over the in-memory broker.

mod common;

use common::*;
use serde_json::json;
use std::time::Duration;
use warren_core::error::WarrenError;
use warren_core::memory::MemoryBroker;
use warren_core::monitor::{ManagerEvent, SocketEvent};
use warren_core::options::SocketOptions;
use warren_core::socket_type::SocketType;
use warren_core::transport::MessageProperties;
use warren_rr::{wait_for_event, ConnectionState};

#[compio::test]
async fn test_request_reply_round_trip() {
    init_tracing();
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("q1").unwrap();
    let req = manager.req_socket(SocketOptions::default());
    req.connect("q1").unwrap();

    let reply = req.send(json!({"foo": "bar"})).unwrap();

    let request = within(rep.recv()).await.unwrap();
    assert_eq!(request.body(), &json!({"foo": "bar"}));
    assert_eq!(request.correlation_id(), Some(reply.correlation_id()));
    assert!(request.reply_to().is_some_and(|q| q.starts_with("amq.gen-")));
    request.reply(json!({"reply": "wooo"})).unwrap();

    assert_eq!(within(reply.wait()).await.unwrap(), json!({"reply": "wooo"}));
    assert_eq!(broker.unacked_count("q1"), 0);
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(req.is_ready());
    assert!(rep.is_ready());
}

#[compio::test]
async fn test_error_reply_resolves_as_application_error() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("users").unwrap();
    let req = manager.req_socket(SocketOptions::default());
    req.connect("users").unwrap();

    let reply = req.send(json!({"id": 42})).unwrap();
    let request = within(rep.recv()).await.unwrap();
    request
        .respond::<serde_json::Value, _>(Err("no such user"))
        .unwrap();

    assert_eq!(
        within(reply.wait()).await,
        Err(WarrenError::Application("no such user".into()))
    );
    let event = socket_event(rep.events(), |e| matches!(e, SocketEvent::ApplicationError(_))).await;
    assert_eq!(event, SocketEvent::ApplicationError("no such user".into()));
}

#[compio::test]
async fn test_independent_managers_never_cross_replies() {
    let broker = MemoryBroker::new();

    let server = manager(&broker);
    let rep = server.rep_socket(SocketOptions::default());
    rep.connect("q2").unwrap();
    spawn_echo(rep);

    let first = manager(&broker);
    let second = manager(&broker);
    let req1 = first.req_socket(SocketOptions::default());
    let req2 = second.req_socket(SocketOptions::default());
    req1.connect("q2").unwrap();
    req2.connect("q2").unwrap();

    let mut handles = Vec::new();
    for i in 0..5 {
        handles.push((1, i, req1.send(json!({"from": 1, "n": i})).unwrap()));
        handles.push((2, i, req2.send(json!({"from": 2, "n": i})).unwrap()));
    }

    for (from, n, handle) in handles {
        let reply = within(handle.wait()).await.unwrap();
        assert_eq!(reply, json!({"echo": {"from": from, "n": n}}));
    }
}

#[compio::test]
async fn test_round_robin_across_destinations() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let req = manager.req_socket(SocketOptions::default());
    for queue in ["a", "b", "c"] {
        req.connect(queue).unwrap();
    }
    // Same destination again must not skew the rotation
    req.connect("a").unwrap();

    let _handles: Vec<_> = (0..7).map(|i| req.send(json!(i)).unwrap()).collect();

    eventually(|| {
        broker.message_count("a") + broker.message_count("b") + broker.message_count("c") == 7
    })
    .await;

    assert_eq!(broker.message_count("a"), 3);
    assert_eq!(broker.message_count("b"), 2);
    assert_eq!(broker.message_count("c"), 2);

    let (body, properties) = broker.take_message("a").unwrap();
    assert_eq!(&body[..], b"0");
    assert!(properties.correlation_id.is_some());
    assert!(properties.reply_to.is_some());
    let (body, _) = broker.take_message("b").unwrap();
    assert_eq!(&body[..], b"1");
}

#[compio::test]
async fn test_rep_connect_is_idempotent() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("q3").unwrap();
    rep.connect("q3").unwrap();

    eventually(|| rep.is_ready() && broker.consumer_count("q3") == 1).await;
    rep.connect("q3").unwrap();
    pause(Duration::from_millis(20)).await;

    assert_eq!(broker.consumer_count("q3"), 1);
    let connected: Vec<_> = rep
        .events()
        .try_iter()
        .filter(|e| matches!(e, SocketEvent::Connected(_)))
        .collect();
    assert_eq!(connected, vec![SocketEvent::Connected("q3".into())]);
}

#[compio::test]
async fn test_rep_connects_replayed_in_order_once_ready() {
    let broker = MemoryBroker::new();
    broker.set_refuse_connections(true);
    let manager = manager(&broker);
    let monitor = manager.monitor();

    let event = within(wait_for_event(&monitor, |e| matches!(e, ManagerEvent::Error(_)))).await;
    assert!(matches!(event, Some(ManagerEvent::Error(WarrenError::Connection(_)))));

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("second").unwrap();
    rep.connect("first").unwrap();
    rep.connect("second").unwrap();
    assert!(!rep.is_ready());

    broker.set_refuse_connections(false);
    manager.connect().unwrap();

    let a = socket_event(rep.events(), |e| matches!(e, SocketEvent::Connected(_))).await;
    let b = socket_event(rep.events(), |e| matches!(e, SocketEvent::Connected(_))).await;
    assert_eq!(a, SocketEvent::Connected("second".into()));
    assert_eq!(b, SocketEvent::Connected("first".into()));
    socket_event(rep.events(), |e| *e == SocketEvent::Ready).await;

    assert_eq!(broker.consumer_count("second"), 1);
    assert_eq!(broker.consumer_count("first"), 1);
}

#[compio::test]
async fn test_prefetch_one_serializes_handling() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let rep = manager.rep_socket(SocketOptions::new().with_prefetch(1));
    rep.connect("serial").unwrap();
    let req = manager.req_socket(SocketOptions::default());
    req.connect("serial").unwrap();

    let first = req.send(json!("one")).unwrap();
    let second = req.send(json!("two")).unwrap();

    let request = within(rep.recv()).await.unwrap();
    assert_eq!(request.body(), &json!("one"));

    // Second request stays on the broker until the first is answered
    assert!(race(Duration::from_millis(50), rep.recv()).await.is_none());
    assert_eq!(broker.message_count("serial"), 1);

    request.reply(json!(1)).unwrap();
    let request = within(rep.recv()).await.unwrap();
    assert_eq!(request.body(), &json!("two"));
    request.reply(json!(2)).unwrap();

    assert_eq!(within(first.wait()).await.unwrap(), json!(1));
    assert_eq!(within(second.wait()).await.unwrap(), json!(2));
}

#[compio::test]
async fn test_prefetch_is_per_socket_on_shared_channel() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let serial = manager.rep_socket(SocketOptions::new().with_prefetch(1));
    let bulk = manager.rep_socket(SocketOptions::new().with_prefetch(10));
    bulk.connect("bulk").unwrap();
    eventually(|| serial.is_ready() && bulk.is_ready()).await;

    // Connected after the sibling applied its own prefetch
    serial.connect("serial").unwrap();
    let req = manager.req_socket(SocketOptions::default());
    req.connect("serial").unwrap();
    let first = req.send(json!("one")).unwrap();
    let second = req.send(json!("two")).unwrap();

    let request = within(serial.recv()).await.unwrap();
    pause(Duration::from_millis(20)).await;
    assert_eq!(broker.unacked_count("serial"), 1);
    assert_eq!(broker.message_count("serial"), 1);

    request.reply(json!(1)).unwrap();
    within(serial.recv()).await.unwrap().reply(json!(2)).unwrap();
    assert_eq!(within(first.wait()).await.unwrap(), json!(1));
    assert_eq!(within(second.wait()).await.unwrap(), json!(2));
}

#[compio::test]
async fn test_malformed_request_never_reaches_handler() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("inbox").unwrap();
    eventually(|| broker.consumer_count("inbox") == 1).await;

    broker.publish("inbox", "{not json", MessageProperties::default());
    broker.publish("inbox", "\"fine\"", MessageProperties::default());

    let event = socket_event(rep.events(), |e| matches!(e, SocketEvent::ParseError(_))).await;
    assert!(matches!(event, SocketEvent::ParseError(_)));

    let request = within(rep.recv()).await.unwrap();
    assert_eq!(request.body(), &json!("fine"));
    // The malformed one was discarded, not left pending
    assert_eq!(broker.unacked_count("inbox"), 1);
    assert_eq!(broker.message_count("inbox"), 0);
}

#[compio::test]
async fn test_malformed_reply_reports_parse_error() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let req = manager.req_socket(SocketOptions::default());
    req.connect("svc").unwrap();
    let reply = req.send(json!({"ping": true})).unwrap();

    eventually(|| broker.message_count("svc") == 1).await;
    let (_, properties) = broker.take_message("svc").unwrap();
    let reply_to = properties.reply_to.unwrap();
    broker.publish(
        &reply_to,
        "\u{0}garbage",
        MessageProperties {
            correlation_id: properties.correlation_id,
            ..MessageProperties::default()
        },
    );

    assert!(matches!(within(reply.wait()).await, Err(WarrenError::Parse(_))));
    socket_event(req.events(), |e| matches!(e, SocketEvent::ParseError(_))).await;
}

#[compio::test]
async fn test_invalid_socket_type_reported_asynchronously() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    let monitor = manager.monitor();

    assert!(manager.socket_named("dealer", SocketOptions::default()).is_none());
    let event = within(wait_for_event(&monitor, |e| matches!(e, ManagerEvent::Error(_)))).await;
    assert_eq!(
        event,
        Some(ManagerEvent::Error(WarrenError::InvalidSocketType("dealer".into())))
    );

    let socket = manager
        .socket_named("Request", SocketOptions::default())
        .unwrap();
    assert_eq!(socket.kind(), SocketType::Request);
    assert!(socket.into_req().is_some());
}

#[compio::test]
async fn test_request_timeout_fails_pending() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let timeout = Duration::from_millis(50);
    let req = manager.req_socket(SocketOptions::new().with_request_timeout(timeout));
    req.connect("void").unwrap();

    assert_eq!(
        within(req.request(json!("anyone?"))).await,
        Err(WarrenError::Timeout(timeout))
    );
}

#[compio::test]
async fn test_socket_close() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let req = manager.req_socket(SocketOptions::default());
    req.connect("void").unwrap();
    let pending = req.send(json!(1)).unwrap();
    eventually(|| broker.message_count("void") == 1).await;

    req.close().await;
    assert_eq!(within(pending.wait()).await, Err(WarrenError::SocketClosed));
    socket_event(req.events(), |e| *e == SocketEvent::Closed).await;
    assert!(!req.is_ready());

    let rep = manager.rep_socket(SocketOptions::default());
    rep.connect("jobs").unwrap();
    eventually(|| broker.consumer_count("jobs") == 1).await;
    rep.close().await;
    assert_eq!(broker.consumer_count("jobs"), 0);
    assert!(within(rep.recv()).await.is_none());

    // The shared channel survives
    assert_eq!(broker.channel_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[compio::test]
async fn test_manager_close_fails_pending() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);

    let req = manager.req_socket(SocketOptions::default());
    req.connect("void").unwrap();
    let pending = req.send(json!(1)).unwrap();
    eventually(|| broker.message_count("void") == 1).await;

    within(manager.close()).await;

    assert_eq!(manager.state(), ConnectionState::Closed);
    assert_eq!(within(pending.wait()).await, Err(WarrenError::ManagerClosed));
    assert_eq!(broker.connection_count(), 0);
    assert_eq!(req.send(json!(2)).unwrap_err(), WarrenError::ManagerClosed);
}

#[compio::test]
async fn test_flow_signals_pass_through() {
    let broker = MemoryBroker::new();
    let manager = manager(&broker);
    let monitor = manager.monitor();

    let req = manager.req_socket(SocketOptions::default());
    eventually(|| req.is_ready()).await;

    broker.emit_drain();
    broker.emit_readable();
    broker.block("low on memory");
    broker.unblock();

    socket_event(req.events(), |e| *e == SocketEvent::Drain).await;
    socket_event(req.events(), |e| *e == SocketEvent::Readable).await;
    let blocked = within(wait_for_event(&monitor, |e| matches!(e, ManagerEvent::Blocked(_)))).await;
    assert_eq!(blocked, Some(ManagerEvent::Blocked("low on memory".into())));
    within(wait_for_event(&monitor, |e| *e == ManagerEvent::Unblocked)).await;
}
