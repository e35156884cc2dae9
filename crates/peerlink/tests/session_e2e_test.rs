//! End-to-end call flow tests
//!
//! Two or three nodes negotiate over the in-memory broker and talk over
//! loopback data channels.
//!
//! ```bash
//! cargo test --test session_e2e_test -- --nocapture
//! ```

mod harness;

use harness::{init_logging, messages, TestNetwork};
use peerlink::{
    IceCandidate, NodeEvent, PeerId, SessionEvent, SignalPayload, SignalingEnvelope,
};
use std::time::Duration;

fn is_message(event: &NodeEvent) -> bool {
    matches!(event, NodeEvent::Session(SessionEvent::Message { .. }))
}

#[tokio::test]
async fn test_call_delivers_hello_exactly_once() {
    init_logging();

    let network = TestNetwork::new();
    let mut a = network.start_node("peer_a");
    let mut b = network.start_node("peer_b");
    a.wait_link(peerlink::LinkState::Connected).await.unwrap();
    b.wait_link(peerlink::LinkState::Connected).await.unwrap();

    a.node.call(PeerId::new("peer_b")).await.unwrap();
    a.wait_opened().await.unwrap();
    b.wait_opened().await.unwrap();

    a.node.send_message("hello").await.unwrap();
    let received = b
        .wait_for("hello", is_message)
        .await
        .unwrap();
    assert_eq!(messages(&[received]), vec!["hello"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(messages(&b.drain()).is_empty());

    let status = b.node.session_status().await.unwrap().unwrap();
    assert_eq!(status.peer, PeerId::new("peer_a"));
    assert_eq!(status.role, peerlink::CallRole::Callee);
    assert!(status.has_remote_description);
    assert_eq!(status.pending_candidates, 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_messages_sent_before_open_arrive_in_order_after_open() {
    init_logging();

    let network = TestNetwork::new();
    let mut a = network.start_node("peer_a");
    let mut b = network.start_node("peer_b");
    a.wait_link(peerlink::LinkState::Connected).await.unwrap();
    b.wait_link(peerlink::LinkState::Connected).await.unwrap();

    a.node.call(PeerId::new("peer_b")).await.unwrap();
    for n in 1..=5 {
        a.node.send_message(format!("msg-{}", n)).await.unwrap();
    }

    // Nothing reaches the peer before its channel reports open
    let mut seen = Vec::new();
    loop {
        let event = b
            .wait_for("open or message", |event| {
                is_message(event)
                    || matches!(event, NodeEvent::Session(SessionEvent::Opened { .. }))
            })
            .await
            .unwrap();
        let opened = matches!(event, NodeEvent::Session(SessionEvent::Opened { .. }));
        seen.push(event);
        if opened {
            break;
        }
    }
    assert!(messages(&seen).is_empty());

    let received = b.collect("queued messages", 5, is_message).await.unwrap();
    assert_eq!(
        messages(&received),
        vec!["msg-1", "msg-2", "msg-3", "msg-4", "msg-5"]
    );

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_switching_peers_leaves_nothing_from_old_session() {
    init_logging();

    let network = TestNetwork::new();
    let mut a = network.start_node("peer_a");
    let mut b = network.start_node("peer_b");
    let mut c = network.start_node("peer_c");
    for node in [&a, &b, &c] {
        node.wait_link(peerlink::LinkState::Connected).await.unwrap();
    }

    let first = a.node.call(PeerId::new("peer_b")).await.unwrap();
    a.wait_opened().await.unwrap();
    b.wait_opened().await.unwrap();
    a.node.send_message("for b").await.unwrap();
    b.wait_for("message for b", is_message).await.unwrap();

    let second = a.node.call(PeerId::new("peer_c")).await.unwrap();
    assert_ne!(first, second);

    // The old session closes exactly once
    let closed = a
        .wait_for("old session closed", |event| {
            matches!(event, NodeEvent::Session(SessionEvent::Closed { session_id, .. }) if *session_id == first)
        })
        .await
        .unwrap();
    assert!(matches!(
        closed,
        NodeEvent::Session(SessionEvent::Closed { peer, .. }) if peer == PeerId::new("peer_b")
    ));

    // A late candidate from the old peer must not reach the new session
    let stale = IceCandidate {
        sdp_mid: "0".to_string(),
        sdp_mline_index: 0,
        candidate: "candidate:stale 1 udp 1 10.9.9.9 9 typ host".to_string(),
    };
    let envelope = SignalingEnvelope::new(
        PeerId::new("peer_b"),
        PeerId::new("peer_a"),
        SignalPayload::Ice(stale.clone()),
    );
    network
        .broker
        .inject("webrtc/signaling", envelope.to_bytes().unwrap().into());

    a.wait_opened().await.unwrap();
    c.wait_opened().await.unwrap();
    a.node.send_message("for c").await.unwrap();
    let received = c.wait_for("message for c", is_message).await.unwrap();
    assert_eq!(messages(&[received]), vec!["for c"]);

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(messages(&b.drain()).is_empty());
    assert!(!a.engine.applied_candidates(second).contains(&stale));
    assert!(a.engine.is_closed(first));
    assert_eq!(
        a.engine.sent_messages(first),
        vec![bytes::Bytes::from_static(b"for b")]
    );

    let status = a.node.session_status().await.unwrap().unwrap();
    assert_eq!(status.session_id, second);
    assert_eq!(status.peer, PeerId::new("peer_c"));
    assert_eq!(status.queued_messages, 0);

    for node in [a, b, c] {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_hang_up_closes_both_ends() {
    init_logging();

    let network = TestNetwork::new();
    let mut a = network.start_node("peer_a");
    let mut b = network.start_node("peer_b");
    a.wait_link(peerlink::LinkState::Connected).await.unwrap();
    b.wait_link(peerlink::LinkState::Connected).await.unwrap();

    a.node.call(PeerId::new("peer_b")).await.unwrap();
    a.wait_opened().await.unwrap();
    b.wait_opened().await.unwrap();

    a.node.hang_up().await.unwrap();
    a.wait_for("local close", |event| {
        matches!(event, NodeEvent::Session(SessionEvent::Closed { .. }))
    })
    .await
    .unwrap();
    b.wait_for("remote close", |event| {
        matches!(event, NodeEvent::Session(SessionEvent::Closed { .. }))
    })
    .await
    .unwrap();
    assert!(a.node.session_status().await.unwrap().is_none());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn test_candidates_before_offer_reach_callee_session() {
    init_logging();

    let network = TestNetwork::new();
    let mut b = network.start_node("peer_b");
    b.wait_link(peerlink::LinkState::Connected).await.unwrap();

    let from = PeerId::new("peer_x");
    let candidates: Vec<IceCandidate> = (1..=3)
        .map(|n| IceCandidate {
            sdp_mid: "0".to_string(),
            sdp_mline_index: 0,
            candidate: format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n),
        })
        .collect();

    // Candidates overtake the offer on the bus
    for candidate in &candidates {
        let envelope = SignalingEnvelope::new(
            from.clone(),
            PeerId::new("peer_b"),
            SignalPayload::Ice(candidate.clone()),
        );
        network
            .broker
            .inject("webrtc/signaling", envelope.to_bytes().unwrap().into());
    }
    let offer = SignalingEnvelope::new(
        from.clone(),
        PeerId::new("peer_b"),
        SignalPayload::Offer {
            sdp: "v=0\r\na=loopback-uid:999\r\n".to_string(),
            ice_restart: false,
        },
    );
    network
        .broker
        .inject("webrtc/signaling", offer.to_bytes().unwrap().into());

    let ready = b
        .wait_for("callee session", |event| {
            matches!(event, NodeEvent::Session(SessionEvent::Ready { .. }))
        })
        .await
        .unwrap();
    let NodeEvent::Session(SessionEvent::Ready { session_id, peer, .. }) = ready else {
        panic!("expected a ready session");
    };
    assert_eq!(peer, from);

    let status = loop {
        let status = b.node.session_status().await.unwrap().unwrap();
        if status.has_remote_description {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    };
    assert_eq!(status.pending_candidates, 0);
    assert_eq!(b.engine.applied_candidates(session_id), candidates);

    b.shutdown().await;
}

#[tokio::test]
async fn test_callee_renegotiates_in_place_on_ice_restart() {
    init_logging();

    let network = TestNetwork::new();
    let mut a = network.start_node("peer_a");
    let mut b = network.start_node("peer_b");
    a.wait_link(peerlink::LinkState::Connected).await.unwrap();
    b.wait_link(peerlink::LinkState::Connected).await.unwrap();

    let caller_session = a.node.call(PeerId::new("peer_b")).await.unwrap();
    a.wait_opened().await.unwrap();
    b.wait_opened().await.unwrap();
    let callee_session = b.node.session_status().await.unwrap().unwrap().session_id;

    a.engine.fail_ice(caller_session);

    // The restart answer reconnects the existing callee session
    b.wait_for("ICE checking after restart", |event| {
        matches!(
            event,
            NodeEvent::Session(SessionEvent::IceStateChanged {
                state: peerlink::IceConnectionState::Checking,
                ..
            })
        )
    })
    .await
    .unwrap();

    let status = b.node.session_status().await.unwrap().unwrap();
    assert_eq!(status.session_id, callee_session);
    assert_eq!(
        a.node.session_status().await.unwrap().unwrap().ice_restarts,
        1
    );

    a.node.send_message("after restart").await.unwrap();
    let received = b.wait_for("message after restart", is_message).await.unwrap();
    assert_eq!(messages(&[received]), vec!["after restart"]);

    let closed = b
        .drain()
        .into_iter()
        .any(|event| matches!(event, NodeEvent::Session(SessionEvent::Closed { .. })));
    assert!(!closed);

    a.shutdown().await;
    b.shutdown().await;
}
