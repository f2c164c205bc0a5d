mod common;

use bindrop_core::protocol::{CodeCheck, Identify, Inbound, Message, recv_msg, send_msg};
use bindrop_core::relay;
use bindrop_core::{ClientEvent, transport};
use common::*;
use std::collections::HashSet;
use std::time::Duration;

#[tokio::test]
async fn test_codes_are_unique_per_session() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let mut codes = HashSet::new();
    let mut clients = Vec::new();
    for i in 0..4 {
        let client = connect_client(relay.addr, dir.path(), &format!("c{}", i), 1200).await;
        assert_eq!(client.code.len(), bindrop_core::codes::CODE_LENGTH);
        assert!(codes.insert(client.code.clone()), "code handed out twice");
        clients.push(client);
    }

    let mut live = relay.relay.live_codes().await;
    live.sort();
    let mut expected: Vec<_> = codes.into_iter().collect();
    expected.sort();
    assert_eq!(live, expected);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_negotiated_target_is_smallest_side() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let small = connect_client(relay.addr, dir.path(), "small", 5).await;
    assert_eq!(small.client().target_length().await, Some(2048));

    let big = connect_client(relay.addr, dir.path(), "big", 1200).await;
    assert_eq!(big.client().target_length().await, Some(relay.relay.target_length()));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_code_check_excludes_own_code() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let mut a = connect_client(relay.addr, dir.path(), "a", 1200).await;
    let b = connect_client(relay.addr, dir.path(), "b", 1200).await;

    let own = a.code.clone();
    a.client().check_code(&own);
    let event = a
        .expect(|e| matches!(e, ClientEvent::CodeChecked { .. }))
        .await;
    assert_eq!(
        event,
        ClientEvent::CodeChecked {
            code: own,
            valid: false
        }
    );

    a.client().check_code("ZZZZZZZZ");
    let event = a
        .expect(|e| matches!(e, ClientEvent::CodeChecked { .. }))
        .await;
    assert!(matches!(event, ClientEvent::CodeChecked { valid: false, .. }));

    a.client().check_code(&b.code);
    let event = a
        .expect(|e| matches!(e, ClientEvent::CodeChecked { .. }))
        .await;
    assert_eq!(
        event,
        ClientEvent::CodeChecked {
            code: b.code.clone(),
            valid: true
        }
    );

    relay.shutdown().await;
}

#[tokio::test]
async fn test_handshake_pairs_both_sides() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let mut a = connect_client(relay.addr, dir.path(), "a", 1200).await;
    let mut b = connect_client(relay.addr, dir.path(), "b", 1200).await;
    pair(&mut a, &mut b).await;

    // Checking again after the handshake does not start a new one
    b.client().check_code(&a.code);
    let a_code = a.code.clone();
    b.expect(|e| matches!(e, ClientEvent::HandshakeComplete { code, .. } if *code == a_code))
        .await;
    assert!(b.client().is_paired(&a.code).await);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_disconnect_invalidates_code() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let mut a = connect_client(relay.addr, dir.path(), "a", 1200).await;
    let mut b = connect_client(relay.addr, dir.path(), "b", 1200).await;
    pair(&mut a, &mut b).await;

    let gone = a.code.clone();
    a.client().disconnect().await;

    let event = b
        .expect(|e| matches!(e, ClientEvent::CodeInvalidated { .. }))
        .await;
    assert_eq!(event, ClientEvent::CodeInvalidated { code: gone.clone() });
    assert!(!b.client().is_paired(&gone).await);

    let handle = &relay.relay;
    assert!(eventually(|| async move { handle.session_count().await == 1 }).await);
    assert!(!handle.live_codes().await.contains(&gone));

    relay.shutdown().await;
}

#[tokio::test]
async fn test_unidentified_session_is_dropped() {
    let dir = tempfile::tempdir().unwrap();
    init_tracing();
    let mut config = relay_config(dir.path());
    config.identify_timeout_ms = 300;
    let relay = relay::start(config).await.unwrap();

    let endpoint = transport::make_client_endpoint().unwrap();
    let mut session = transport::connect(&endpoint, relay.addr).await.unwrap();

    // Anything but Identify opens the stream without identifying
    send_msg(
        &mut session.send,
        &Message::CodeCheck(CodeCheck {
            code: "ABCD".to_string(),
        }),
    )
    .await
    .unwrap();

    let ended = tokio::time::timeout(EVENT_TIMEOUT, async {
        loop {
            match recv_msg(&mut session.recv).await {
                Ok(Inbound::Message(Message::Disconnect)) => return true,
                Ok(_) => continue,
                Err(_) => return true,
            }
        }
    })
    .await
    .unwrap();
    assert!(ended);

    let handle = &relay.relay;
    assert!(eventually(|| async move { handle.session_count().await == 0 }).await);

    relay.shutdown().await;
}

#[tokio::test]
async fn test_identified_session_outlives_deadline() {
    let dir = tempfile::tempdir().unwrap();
    init_tracing();
    let mut config = relay_config(dir.path());
    config.identify_timeout_ms = 200;
    let relay = relay::start(config).await.unwrap();

    let endpoint = transport::make_client_endpoint().unwrap();
    let mut session = transport::connect(&endpoint, relay.addr).await.unwrap();
    send_msg(
        &mut session.send,
        &Message::Identify(Identify {
            peer_id: bindrop_core::codes::generate_peer_id(),
        }),
    )
    .await
    .unwrap();

    match recv_msg(&mut session.recv).await.unwrap() {
        Inbound::Message(Message::IdentifyReply(reply)) => assert!(reply.allowed),
        other => panic!("Expected identify reply, got {:?}", other),
    }

    tokio::time::sleep(Duration::from_millis(800)).await;
    assert_eq!(relay.relay.session_count().await, 1);

    // No Disconnect was queued for us
    let next = tokio::time::timeout(Duration::from_millis(200), recv_msg(&mut session.recv)).await;
    assert!(next.is_err(), "unexpected frame after identify");

    relay.shutdown().await;
}

#[tokio::test]
async fn test_empty_peer_id_is_refused() {
    let dir = tempfile::tempdir().unwrap();
    let relay = start_relay(dir.path()).await;

    let endpoint = transport::make_client_endpoint().unwrap();
    let mut session = transport::connect(&endpoint, relay.addr).await.unwrap();
    send_msg(
        &mut session.send,
        &Message::Identify(Identify {
            peer_id: String::new(),
        }),
    )
    .await
    .unwrap();

    match recv_msg(&mut session.recv).await.unwrap() {
        Inbound::Message(Message::IdentifyReply(reply)) => {
            assert!(!reply.allowed);
            assert!(reply.code.is_empty());
        }
        other => panic!("Expected identify reply, got {:?}", other),
    }
    assert!(relay.relay.live_codes().await.is_empty());

    relay.shutdown().await;
}
