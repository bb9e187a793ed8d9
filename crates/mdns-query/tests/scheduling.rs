//! Concrete query-scheduling scenarios, driven against a fake wire with
//! tokio's virtual clock so the TTL ladder and backoff timings are exact.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use dns_types::protocol::types::test_util::{a_record, domain};
use dns_types::protocol::types::{Message, QueryType, Question, RecordClass, RecordType};
use mdns_net::test_util::FakeNetwork;
use mdns_net::{Family, Transport};
use mdns_query::{CacheEventKind, Query};

fn addr(n: u8) -> SocketAddr {
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, n)), 5353)
}

fn response_with(answers: Vec<dns_types::protocol::types::ResourceRecord>) -> Message {
    let mut msg = Message::query(1, vec![]).make_response();
    msg.answers = answers;
    msg
}

#[tokio::test(start_paused = true)]
async fn scenario_1_first_query_within_window() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let question = Question {
        name: domain("x.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    let (_query, _events) = Query::start(vec![question], transport);

    tokio::time::advance(Duration::from_millis(19)).await;
    assert!(tokio::time::timeout(Duration::ZERO, peer.receive())
        .await
        .is_err());

    tokio::time::advance(Duration::from_millis(121)).await;
    let (_bytes, _from) = peer.receive().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_2_backoff_doubles() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let question = Question {
        name: domain("x.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    let (_query, _events) = Query::start(vec![question], transport);

    tokio::time::advance(Duration::from_millis(140)).await;
    peer.receive().await.unwrap();
    assert!(tokio::time::timeout(Duration::ZERO, peer.receive())
        .await
        .is_err());

    tokio::time::advance(Duration::from_millis(1000)).await;
    peer.receive().await.unwrap();
    assert!(tokio::time::timeout(Duration::ZERO, peer.receive())
        .await
        .is_err());

    tokio::time::advance(Duration::from_millis(2000)).await;
    peer.receive().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn scenario_3_known_answer_suppression_for_ptr() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let question = Question {
        name: domain("_http._tcp.local."),
        qtype: QueryType::Record(RecordType::PTR),
        qclass: RecordClass::Internet,
    };
    let (_query, _events) = Query::start(vec![question], transport);

    tokio::time::advance(Duration::from_millis(140)).await;
    peer.receive().await.unwrap();

    let ptr = dns_types::protocol::types::test_util::ptr_record(
        "_http._tcp.local.",
        "a._http._tcp.local.",
    );
    let mut ptr_ttl = ptr.clone();
    ptr_ttl.ttl = 2000;
    let response = response_with(vec![ptr_ttl.clone()]);
    let bytes = response.into_octets().unwrap();
    peer.send(&bytes).await.unwrap();

    tokio::time::advance(Duration::from_millis(1000)).await;
    let (bytes, _from) = peer.receive().await.unwrap();
    let msg = Message::from_octets(&bytes).unwrap();
    assert!(msg.answers.iter().any(|rr| rr.rtype_with_data == ptr_ttl.rtype_with_data));
}

#[tokio::test(start_paused = true)]
async fn scenario_4_flush_on_differing_rdata() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let question = Question {
        name: domain("x.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    let (_query, mut events) = Query::start(vec![question], transport);

    tokio::time::advance(Duration::from_millis(140)).await;
    peer.receive().await.unwrap();

    let mut first = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
    first.ttl = 1000;
    let response = response_with(vec![first.clone()]);
    peer.send(&response.into_octets().unwrap()).await.unwrap();
    let first_event = events.recv().await.unwrap();
    assert_eq!(first_event.kind, CacheEventKind::Added);

    let mut second = a_record("x.local.", Ipv4Addr::new(6, 6, 6, 6));
    second.ttl = 1000;
    let response2 = response_with(vec![second.clone()]);
    peer.send(&response2.into_octets().unwrap()).await.unwrap();

    let flushed = events.recv().await.unwrap();
    assert_eq!(flushed.kind, CacheEventKind::Flushed);
    let added_again = events.recv().await.unwrap();
    assert_eq!(added_again.kind, CacheEventKind::Added);
}

#[tokio::test(start_paused = true)]
async fn scenario_5_answered_question_dropped_from_base_query() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let q_a = Question {
        name: domain("x.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    let q_ptr = Question {
        name: domain("_http._tcp.local."),
        qtype: QueryType::Record(RecordType::PTR),
        qclass: RecordClass::Internet,
    };
    let (_query, _events) = Query::start(vec![q_a, q_ptr], transport);

    tokio::time::advance(Duration::from_millis(140)).await;
    peer.receive().await.unwrap();

    let mut a = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
    a.ttl = 60;
    let response = response_with(vec![a]);
    peer.send(&response.into_octets().unwrap()).await.unwrap();

    tokio::time::advance(Duration::from_millis(1000)).await;
    let (bytes, _from) = peer.receive().await.unwrap();
    let msg = Message::from_octets(&bytes).unwrap();
    assert_eq!(msg.questions.len(), 1);
    assert_eq!(msg.questions[0].qtype, QueryType::Record(RecordType::PTR));
}

#[tokio::test(start_paused = true)]
async fn scenario_6_goodbye_then_expiry() {
    let net = FakeNetwork::new();
    let transport = Arc::new(net.transport(addr(1), vec![addr(1).ip()], Family::V4));
    let peer = net.transport(addr(2), vec![addr(2).ip()], Family::V4);

    let question = Question {
        name: domain("x.local."),
        qtype: QueryType::Record(RecordType::A),
        qclass: RecordClass::Internet,
    };
    let (_query, mut events) = Query::start(vec![question], transport);

    tokio::time::advance(Duration::from_millis(140)).await;
    peer.receive().await.unwrap();

    let mut rr = a_record("x.local.", Ipv4Addr::new(5, 5, 5, 5));
    rr.ttl = 60;
    peer.send(&response_with(vec![rr.clone()]).into_octets().unwrap())
        .await
        .unwrap();
    let added = events.recv().await.unwrap();
    assert_eq!(added.kind, CacheEventKind::Added);

    let mut goodbye = rr.clone();
    goodbye.ttl = 0;
    peer.send(&response_with(vec![goodbye]).into_octets().unwrap())
        .await
        .unwrap();
    let added_again = events.recv().await.unwrap();
    assert_eq!(added_again.kind, CacheEventKind::Added);

    tokio::time::advance(Duration::from_secs(2)).await;
    let expired = events.recv().await.unwrap();
    assert_eq!(expired.kind, CacheEventKind::Expired);
}
