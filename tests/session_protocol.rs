// tests/session_protocol.rs
// Multi-step exchanges between in-memory nodes

use bytes::Bytes;
use futures::{FutureExt, SinkExt};
use serde_json::json;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dkg_node::error::NetworkError;
use dkg_node::network::codec;
use dkg_node::network::memory::{MemoryNetwork, MemoryTransport};
use dkg_node::network::message::{PROTOCOL_INIT, PROTOCOL_REQUEST};
use dkg_node::network::transport::{self, InboundStream, StreamAcceptor, Transport};
use dkg_node::network::{
    handler_fn, new_session_id, GuardConfig, HandlerResponse, Message, NetworkService, PeerId, RequestSequence,
    ResponseType, ServiceConfig, WindowPolicy,
};

const PROTO: &str = "/test/1.0.0";

struct Node {
    transport: Arc<MemoryTransport>,
    service: NetworkService,
}

fn node(net: &MemoryNetwork, config: ServiceConfig) -> Node {
    let transport = net.join(PeerId::random());
    let service = NetworkService::new(transport.clone(), config);
    Node { transport, service }
}

fn config() -> ServiceConfig {
    ServiceConfig {
        response_timeout: Duration::from_secs(5),
        ..ServiceConfig::default()
    }
}

fn three_step() -> RequestSequence {
    RequestSequence::new(["INIT", "DATA", "FIN"]).unwrap()
}

async fn send(from: &Node, to: &Node, session: &str, message_type: &str) -> Option<ResponseType> {
    from.service
        .send_message(
            PROTO,
            &to.service.local_peer_id(),
            Message::new(session, message_type, json!({"step": message_type})),
        )
        .await
        .unwrap()
        .and_then(|m| m.response_type())
}

async fn ack_all(net: &MemoryNetwork, sequence: RequestSequence, config: ServiceConfig) -> (Node, Node) {
    let a = node(net, config.clone());
    let b = node(net, config);
    a.service.register_sequence(PROTO, sequence.clone());
    b.service
        .register_handler_with_sequence(
            PROTO,
            sequence,
            handler_fn(|_, _| async { Ok(HandlerResponse::ack(json!({}))) }),
        )
        .await
        .unwrap();
    (a, b)
}

fn remaining(node: &Node, session: &str) -> Option<VecDeque<String>> {
    node.service.sessions().receiver(session).and_then(|s| s.remaining)
}

#[tokio::test]
async fn three_step_exchange_runs_to_completion() {
    let net = MemoryNetwork::new();
    let (a, b) = ack_all(&net, three_step(), config()).await;

    assert_eq!(send(&a, &b, "abc", "INIT").await, Some(ResponseType::Ack));
    assert_eq!(
        remaining(&b, "abc"),
        Some(VecDeque::from(vec!["DATA".to_string(), "FIN".to_string()]))
    );

    assert_eq!(send(&a, &b, "abc", "DATA").await, Some(ResponseType::Ack));
    assert_eq!(remaining(&b, "abc"), Some(VecDeque::from(vec!["FIN".to_string()])));
    assert!(a.service.sessions().has_sender("abc"));

    assert_eq!(send(&a, &b, "abc", "FIN").await, Some(ResponseType::Ack));
    assert!(b.service.sessions().receiver("abc").is_none());
    assert!(!a.service.sessions().has_sender("abc"));

    // the session is gone, so a repeated FIN is out of order
    assert_eq!(send(&a, &b, "abc", "FIN").await, Some(ResponseType::Nack));
    assert_eq!(b.service.sessions().receiver_count(), 0);
    assert!(!a.service.sessions().has_sender("abc"));
}

#[tokio::test]
async fn out_of_order_requests_are_rejected() {
    let net = MemoryNetwork::new();
    let (a, b) = ack_all(&net, three_step(), config()).await;

    // a session cannot start with anything but the first type
    assert_eq!(send(&a, &b, "s1", "DATA").await, Some(ResponseType::Nack));
    assert_eq!(b.service.sessions().receiver_count(), 0);

    // skipping a step ends the session
    assert_eq!(send(&a, &b, "s2", "INIT").await, Some(ResponseType::Ack));
    assert_eq!(send(&a, &b, "s2", "FIN").await, Some(ResponseType::Nack));
    assert!(b.service.sessions().receiver("s2").is_none());
    assert_eq!(send(&a, &b, "s2", "DATA").await, Some(ResponseType::Nack));

    // types outside the protocol's sequence are malformed
    assert_eq!(send(&a, &b, "s3", "ACK").await, Some(ResponseType::Nack));
    assert_eq!(b.service.sessions().receiver_count(), 0);
}

#[tokio::test]
async fn unknown_type_mid_exchange_ends_the_session() {
    let net = MemoryNetwork::new();
    let (a, b) = ack_all(&net, three_step(), config()).await;
    let intruder = node(&net, config());
    intruder.service.register_sequence(PROTO, three_step());

    assert_eq!(send(&a, &b, "m", "INIT").await, Some(ResponseType::Ack));

    // a foreign peer's malformed request leaves the owner's session alone
    assert_eq!(send(&intruder, &b, "m", "BOGUS").await, Some(ResponseType::Nack));
    assert!(b.service.sessions().receiver("m").is_some());

    assert_eq!(send(&a, &b, "m", "BOGUS").await, Some(ResponseType::Nack));
    assert!(b.service.sessions().receiver("m").is_none());
    assert!(!a.service.sessions().has_sender("m"));

    // the next regular step finds no session to continue
    assert_eq!(send(&a, &b, "m", "DATA").await, Some(ResponseType::Nack));
    assert_eq!(b.service.sessions().receiver_count(), 0);
}

#[tokio::test]
async fn another_peer_cannot_hijack_a_session() {
    let net = MemoryNetwork::new();
    let (a, b) = ack_all(&net, three_step(), config()).await;
    let intruder = node(&net, config());
    intruder.service.register_sequence(PROTO, three_step());

    assert_eq!(send(&a, &b, "owned", "INIT").await, Some(ResponseType::Ack));
    assert_eq!(send(&intruder, &b, "owned", "DATA").await, Some(ResponseType::Nack));

    // the owner's session is untouched
    assert_eq!(send(&a, &b, "owned", "DATA").await, Some(ResponseType::Ack));
}

#[tokio::test]
async fn guard_limits_new_sessions_but_not_open_ones() {
    let net = MemoryNetwork::new();
    let sequence = RequestSequence::new(["INIT", "S1", "S2", "S3", "S4", "S5"]).unwrap();
    let guarded = ServiceConfig {
        guard: GuardConfig {
            basic: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: 2,
            },
            spam: WindowPolicy {
                window: Duration::from_secs(60),
                max_requests: 4,
            },
            blacklist_window: Duration::from_secs(3600),
        },
        ..config()
    };
    let (a, b) = ack_all(&net, sequence, guarded).await;

    // one session may use as many steps as its sequence has
    assert_eq!(send(&a, &b, "long", "INIT").await, Some(ResponseType::Ack));
    for step in ["S1", "S2", "S3", "S4"] {
        assert_eq!(send(&a, &b, "long", step).await, Some(ResponseType::Ack));
    }

    // second new session is still inside the basic budget
    assert_eq!(send(&a, &b, "second", "INIT").await, Some(ResponseType::Ack));
    // third and fourth trip the basic window, fifth trips the spam window
    assert_eq!(send(&a, &b, "third", "INIT").await, Some(ResponseType::Nack));
    assert_eq!(send(&a, &b, "fourth", "INIT").await, Some(ResponseType::Nack));
    assert!(!b.service.is_blacklisted(&a.service.local_peer_id()));
    assert_eq!(send(&a, &b, "fifth", "INIT").await, Some(ResponseType::Nack));
    assert!(b.service.is_blacklisted(&a.service.local_peer_id()));
    assert_eq!(send(&a, &b, "sixth", "INIT").await, Some(ResponseType::Nack));

    // exchanges opened before the blacklist keep going
    assert_eq!(send(&a, &b, "long", "S5").await, Some(ResponseType::Ack));
    assert_eq!(send(&a, &b, "second", "S1").await, Some(ResponseType::Ack));

    // other peers are unaffected
    let c = node(&net, config());
    c.service.register_sequence(PROTO, RequestSequence::new(["INIT", "S1", "S2", "S3", "S4", "S5"]).unwrap());
    assert_eq!(send(&c, &b, "c1", "INIT").await, Some(ResponseType::Ack));
}

#[tokio::test]
async fn busy_response_leaves_session_unchanged() {
    let net = MemoryNetwork::new();
    let a = node(&net, config());
    let b = node(&net, config());
    a.service.register_sequence(PROTO, three_step());

    let data_calls = Arc::new(AtomicUsize::new(0));
    let init_calls = Arc::new(AtomicUsize::new(0));
    let (dc, ic) = (data_calls.clone(), init_calls.clone());
    b.service
        .register_handler_with_sequence(
            PROTO,
            three_step(),
            handler_fn(move |m: Message, _| {
                let (dc, ic) = (dc.clone(), ic.clone());
                async move {
                    let busy = match m.message_type() {
                        "INIT" => ic.fetch_add(1, Ordering::SeqCst) == 0,
                        "DATA" => dc.fetch_add(1, Ordering::SeqCst) == 0,
                        _ => false,
                    };
                    Ok(if busy {
                        HandlerResponse::busy()
                    } else {
                        HandlerResponse::ack(json!({}))
                    })
                }
            }),
        )
        .await
        .unwrap();

    // BUSY on the opening request creates nothing
    assert_eq!(send(&a, &b, "x", "INIT").await, Some(ResponseType::Busy));
    assert_eq!(b.service.sessions().receiver_count(), 0);
    assert!(a.service.sessions().has_sender("x"));

    assert_eq!(send(&a, &b, "x", "INIT").await, Some(ResponseType::Ack));
    let before = remaining(&b, "x");

    assert_eq!(send(&a, &b, "x", "DATA").await, Some(ResponseType::Busy));
    assert_eq!(remaining(&b, "x"), before);

    // the same request succeeds on retry
    assert_eq!(send(&a, &b, "x", "DATA").await, Some(ResponseType::Ack));
    assert_eq!(remaining(&b, "x"), Some(VecDeque::from(vec!["FIN".to_string()])));
}

#[tokio::test]
async fn retry_repeats_busy_requests() {
    let net = MemoryNetwork::new();
    let retrying = ServiceConfig {
        retry: dkg_node::network::RetryPolicy {
            max_attempts: 5,
            delay: Duration::from_millis(10),
            deadline: Duration::from_secs(5),
        },
        ..config()
    };
    let a = node(&net, retrying.clone());
    let b = node(&net, retrying);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    b.service
        .register_handler(
            PROTO,
            handler_fn(move |_, _| {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Ok(HandlerResponse::busy())
                    } else {
                        Ok(HandlerResponse::ack(json!({"ok": true})))
                    }
                }
            }),
        )
        .await
        .unwrap();

    let response = a
        .service
        .send_message_with_retry(
            PROTO,
            &b.service.local_peer_id(),
            Message::new(new_session_id(), PROTOCOL_INIT, json!({})),
        )
        .await
        .unwrap()
        .unwrap();
    assert_eq!(response.response_type(), Some(ResponseType::Ack));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn retry_gives_up_after_max_attempts() {
    let net = MemoryNetwork::new();
    let retrying = ServiceConfig {
        retry: dkg_node::network::RetryPolicy {
            max_attempts: 3,
            delay: Duration::from_millis(10),
            deadline: Duration::from_secs(5),
        },
        ..config()
    };
    let a = node(&net, retrying.clone());
    let b = node(&net, retrying);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    b.service
        .register_handler(
            PROTO,
            handler_fn(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(HandlerResponse::busy()) }
            }),
        )
        .await
        .unwrap();

    let id = new_session_id();
    let err = a
        .service
        .send_message_with_retry(
            PROTO,
            &b.service.local_peer_id(),
            Message::new(id.clone(), PROTOCOL_INIT, json!({})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Busy { attempts: 3 }));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!a.service.sessions().has_sender(&id));
}

#[tokio::test]
async fn slow_peer_times_out() {
    let net = MemoryNetwork::new();
    let impatient = ServiceConfig {
        response_timeout: Duration::from_millis(100),
        ..config()
    };
    let a = node(&net, impatient.clone());
    let b = node(&net, impatient);
    b.service
        .register_handler(
            PROTO,
            handler_fn(|_, _| async {
                tokio::time::sleep(Duration::from_millis(500)).await;
                Ok(HandlerResponse::ack(json!({})))
            }),
        )
        .await
        .unwrap();

    let id = new_session_id();
    let err = a
        .service
        .send_message(
            PROTO,
            &b.service.local_peer_id(),
            Message::new(id.clone(), PROTOCOL_INIT, json!({})),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, NetworkError::Timeout(_)));
    assert!(!a.service.sessions().has_sender(&id));
}

#[tokio::test]
async fn session_count_overload_declines_new_sessions() {
    let net = MemoryNetwork::new();
    let small = ServiceConfig {
        max_open_sessions: 1,
        ..config()
    };
    let (a, b) = ack_all(&net, RequestSequence::default(), small).await;

    assert_eq!(send(&a, &b, "one", PROTOCOL_INIT).await, Some(ResponseType::Ack));
    assert_eq!(send(&a, &b, "two", PROTOCOL_INIT).await, Some(ResponseType::Ack));
    assert_eq!(send(&a, &b, "three", PROTOCOL_INIT).await, Some(ResponseType::Busy));
    assert_eq!(b.service.sessions().receiver_count(), 2);

    // finishing one frees room
    assert_eq!(send(&a, &b, "one", PROTOCOL_REQUEST).await, Some(ResponseType::Ack));
    assert_eq!(send(&a, &b, "three", PROTOCOL_INIT).await, Some(ResponseType::Ack));
}

#[tokio::test]
async fn invalid_response_is_discarded() {
    let net = MemoryNetwork::new();
    let a = node(&net, config());
    let b = node(&net, config());

    // a peer that echoes a request type instead of a response
    let acceptor: StreamAcceptor = Arc::new(|inbound: InboundStream| {
        async move {
            let (mut reader, mut writer) = transport::framed(inbound.stream);
            if let Ok(header) = codec::read_header(&mut reader).await {
                let reply = Message::new(header.session_id, PROTOCOL_INIT, json!({}));
                let _ = codec::write_message(&mut writer, &reply).await;
            }
        }
        .boxed()
    });
    b.transport.handle(PROTO, acceptor).await.unwrap();

    let response = a
        .service
        .send_message(
            PROTO,
            &b.transport.local_peer_id(),
            Message::new(new_session_id(), PROTOCOL_INIT, json!({})),
        )
        .await
        .unwrap();
    assert!(response.is_none());
}

#[tokio::test]
async fn undecodable_traffic_creates_no_session() {
    let net = MemoryNetwork::new();
    let (a, b) = ack_all(&net, RequestSequence::default(), config()).await;
    let target = b.service.local_peer_id();

    // garbage header: stream is dropped without an answer
    let stream = a.transport.dial(&target, PROTO).await.unwrap();
    let (mut reader, mut writer) = transport::framed(stream);
    writer.send(Bytes::from_static(b"{{{")).await.unwrap();
    SinkExt::<Bytes>::close(&mut writer).await.unwrap();
    assert!(codec::read_header(&mut reader).await.is_err());

    // valid header, broken payload: NACK and nothing kept
    let stream = a.transport.dial(&target, PROTO).await.unwrap();
    let (mut reader, mut writer) = transport::framed(stream);
    writer
        .send(Bytes::from_static(br#"{"sessionId":"p","messageType":"PROTOCOL_INIT"}"#))
        .await
        .unwrap();
    writer.send(Bytes::from_static(b"{not json")).await.unwrap();
    SinkExt::<Bytes>::close(&mut writer).await.unwrap();
    let reply = codec::read_message(&mut reader, 1024).await.unwrap();
    assert_eq!(reply.response_type(), Some(ResponseType::Nack));
    assert_eq!(reply.session_id(), "p");

    assert_eq!(b.service.sessions().receiver_count(), 0);
}
