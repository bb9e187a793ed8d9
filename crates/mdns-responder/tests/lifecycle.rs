//! End-to-end responder scenarios: probing, conflict abort, announcing,
//! answering, and goodbye-on-cancel, all driven against a fake wire with
//! tokio's virtual clock.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dns_types::protocol::types::test_util::{a_record, domain};
use dns_types::protocol::types::{Message, QueryType, Question, RecordClass, RecordType};
use mdns_net::test_util::FakeNetwork;
use mdns_net::{Family, Transport};
use mdns_responder::{respond, ResponderError};
use tokio_util::sync::CancellationToken;

fn addr(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 5353)
}

fn query(question: Question) -> Message {
    Message::query(1, vec![question])
}

#[tokio::test(start_paused = true)]
async fn probes_then_announces_twice() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let records = vec![a_record("host.local.", Ipv4Addr::new(5, 5, 5, 5))];
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(respond(records, transport, cancel.clone()));

    tokio::time::advance(Duration::from_millis(1000)).await;

    for _ in 0..3 {
        let (bytes, _) = peer.receive().await.unwrap();
        let msg = Message::from_octets(&bytes).unwrap();
        assert!(!msg.header.is_response, "probes are queries");
        assert_eq!(msg.questions[0].qtype, QueryType::Any);
        assert!(!msg.authority.is_empty());
    }

    let (bytes, _) = peer.receive().await.unwrap();
    let first_announce = Message::from_octets(&bytes).unwrap();
    assert!(first_announce.header.is_response);
    assert_eq!(first_announce.answers.len(), 1);
    assert!(first_announce.answers[0].is_unique);

    tokio::time::advance(Duration::from_millis(1000)).await;
    let (bytes, _) = peer.receive().await.unwrap();
    let second_announce = Message::from_octets(&bytes).unwrap();
    assert_eq!(second_announce.answers, first_announce.answers);

    cancel.cancel();
    let result = handle.await.unwrap();
    assert_eq!(result, Err(ResponderError::Aborted));
}

#[tokio::test(start_paused = true)]
async fn conflicting_answer_during_probe_aborts_with_name_taken() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let records = vec![a_record("host.local.", Ipv4Addr::new(5, 5, 5, 5))];
    let cancel = CancellationToken::new();
    let handle = tokio::spawn(respond(records, transport, cancel));

    tokio::time::advance(Duration::from_millis(250)).await;
    peer.receive().await.unwrap();

    let mut conflicting = a_record("host.local.", Ipv4Addr::new(9, 9, 9, 9));
    conflicting.is_unique = true;
    let mut response = Message::query(2, vec![]).make_response();
    response.answers = vec![conflicting];
    peer.send(&response.into_octets().unwrap()).await.unwrap();

    let result = handle.await.unwrap();
    assert_eq!(result, Err(ResponderError::NameTaken));
}

#[tokio::test(start_paused = true)]
async fn answers_matching_query_after_announcing() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let records = vec![a_record("host.local.", Ipv4Addr::new(5, 5, 5, 5))];
    let cancel = CancellationToken::new();
    let _handle = tokio::spawn(respond(records, transport, cancel.clone()));

    tokio::time::advance(Duration::from_millis(2000)).await;
    for _ in 0..5 {
        peer.receive().await.unwrap();
    }

    let question = Question {
        name: domain("host.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    peer.send(&query(question).into_octets().unwrap()).await.unwrap();

    let (bytes, _) = peer.receive().await.unwrap();
    let msg = Message::from_octets(&bytes).unwrap();
    assert!(msg.header.is_response);
    assert_eq!(msg.answers.len(), 1);
    assert_eq!(msg.answers[0].name, domain("host.local."));

    cancel.cancel();
}

#[tokio::test(start_paused = true)]
async fn unanswerable_type_gets_nsec() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let records = vec![a_record("host.local.", Ipv4Addr::new(5, 5, 5, 5))];
    let cancel = CancellationToken::new();
    let _handle = tokio::spawn(respond(records, transport, cancel.clone()));

    tokio::time::advance(Duration::from_millis(2000)).await;
    for _ in 0..5 {
        peer.receive().await.unwrap();
    }

    let question = Question {
        name: domain("host.local."),
        qtype: QueryType::Record(RecordType::SRV),
        qclass: RecordClass::Internet,
    };
    peer.send(&query(question).into_octets().unwrap()).await.unwrap();

    // SRV is unique and all-answered, so this dispatches immediately rather
    // than waiting for the aggregation window.
    let (bytes, _) = peer.receive().await.unwrap();
    let msg = Message::from_octets(&bytes).unwrap();
    assert_eq!(msg.answers.len(), 1);
    assert_eq!(msg.answers[0].rtype(), RecordType::NSEC);

    cancel.cancel();
}
