//! End-to-end connection tests
//!
//! A loopback rendezvous server hands out a route to a loopback peer
//! (directly or through a relay) and the client runs the whole flow.

mod common;

use std::time::Duration;

use tokio::net::TcpListener;
use uuid::Uuid;

use deskline::config::ClientConfig;
use deskline::network::{
    Connection, ConnectionContext, ConnectionState, Inbound, LookupFailureReason, Negotiated,
    NetworkError, PixelFrame,
};
use deskline::protocol::{
    encode_yuv_frame, CursorPosition, Message, MouseEvent, PunchHoleFailure, PunchHoleResponse,
    RelayResponse, RendezvousMessage, TestDelay,
};

use common::*;

const PEER_ID: &str = "123456789";

/// Signaling server answering one lookup with `reply`
async fn start_signaling(listener: TcpListener, reply: RendezvousMessage) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _request: RendezvousMessage = recv_message(&mut ws).await;
        send_message(&mut ws, &reply).await;
        let _ = wait_closed(&mut ws).await;
    })
}

fn config(base_port: u16) -> ClientConfig {
    let mut config = ClientConfig::new(format!("127.0.0.1:{}", base_port));
    config.licence_key = "licence".into();
    config.send_interval_ms = 5;
    config
}

/// Test: Relayed session
/// Given a rendezvous server that assigns a relay
/// When the client connects
/// Then it requests the relay, secures the session, answers delay
/// probes and exchanges encrypted traffic
#[tokio::test]
async fn test_relayed_session_end_to_end() {
    let root = root_signer();
    let peer = PeerIdentity::new(PEER_ID);
    let relay_uuid = Uuid::new_v4().to_string();

    let (relay_listener, relay_port) = bind().await;
    let (signaling_listener, base_port) = bind_signaling().await;
    let signaling = start_signaling(
        signaling_listener,
        RendezvousMessage::RelayResponse(RelayResponse {
            uuid: relay_uuid.clone(),
            relay_server: format!("127.0.0.1:{}", relay_port - 2),
            pk: Some(peer.signed_pk(&root)),
            ..Default::default()
        }),
    )
    .await;

    let expected_uuid = relay_uuid.clone();
    let relay = tokio::spawn(async move {
        let mut ws = accept_ws(&relay_listener).await;
        match recv_message::<RendezvousMessage>(&mut ws).await {
            RendezvousMessage::RequestRelay(request) => {
                assert_eq!(request.id, PEER_ID);
                assert_eq!(request.uuid, expected_uuid);
                assert_eq!(request.licence_key, "licence");
            }
            other => panic!("Expected RequestRelay, got {:?}", other),
        }

        let signed_id = peer.signed_id();
        let key = peer_handshake(&mut ws, &peer, signed_id)
            .await
            .expect("Session should be secured");
        let mut session = PeerSession::new(&key);

        let probe = Message::TestDelay(TestDelay {
            time: 1234,
            from_client: false,
            last_delay: 17,
            target_bitrate: 0,
        });
        session.send(&mut ws, &probe).await;
        session
            .send(&mut ws, &Message::CursorPosition(CursorPosition { x: 5, y: 6 }))
            .await;

        let echo = session.recv(&mut ws).await;
        assert_eq!(echo, probe);
        let event = session.recv(&mut ws).await;
        (ws, event)
    });

    let ctx = ConnectionContext::new(root.verifying_key());
    let mut connection = Connection::new(ctx, config(base_port));
    let negotiated = tokio::time::timeout(STEP_TIMEOUT, connection.start(PEER_ID))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(negotiated, Negotiated::Secured);
    assert_eq!(connection.state(), ConnectionState::Active);

    // The delay probe is answered internally, not delivered
    let item = tokio::time::timeout(STEP_TIMEOUT, connection.next())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        item,
        Inbound::Message(Message::CursorPosition(CursorPosition { x: 5, y: 6 }))
    );

    let event = Message::MouseEvent(MouseEvent {
        mask: 2,
        x: 10,
        y: 20,
        modifiers: vec![],
    });
    connection.send(event.clone()).unwrap();

    let (_ws, received) = tokio::time::timeout(STEP_TIMEOUT, relay)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, event);

    let stats = connection.stats();
    assert!(stats.secured);
    assert_eq!(stats.last_peer_delay_ms, Some(17));
    assert_eq!(stats.messages_received, 1);

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    signaling.await.unwrap();
}

/// Test: Direct session without a signed key
/// Given a punch hole reply pointing at the peer and no signed key
/// Then the client speaks first with PublicKey{}, the session runs
/// unencrypted and frames are reassembled
#[tokio::test]
async fn test_direct_session_unencrypted() {
    let peer = PeerIdentity::new(PEER_ID);
    let (peer_listener, peer_port) = bind().await;
    let (signaling_listener, base_port) = bind_signaling().await;
    let signaling = start_signaling(
        signaling_listener,
        RendezvousMessage::PunchHoleResponse(PunchHoleResponse {
            socket_addr: Some(format!("127.0.0.1:{}", peer_port).parse().unwrap()),
            ..Default::default()
        }),
    )
    .await;

    let peer_side = tokio::spawn(async move {
        let mut ws = accept_ws(&peer_listener).await;
        assert!(await_key_reply(&mut ws, &peer).await.is_none());

        for frame in encode_yuv_frame(4, false, &[1; 8], &[2; 4], &[3; 4])
            .to_wire()
            .unwrap()
        {
            send_binary(&mut ws, frame).await;
        }
        let event: Message = recv_message(&mut ws).await;
        (ws, event)
    });

    let ctx = ConnectionContext::new(root_signer().verifying_key());
    let mut connection = Connection::new(ctx, config(base_port));
    let negotiated = connection.start(PEER_ID).await.unwrap();
    assert!(!negotiated.is_secured());

    match connection.next().await.unwrap() {
        Inbound::Frame(PixelFrame::Yuv(frame)) => {
            assert_eq!(frame.stride, 4);
            assert_eq!(frame.y, vec![1; 8]);
            assert_eq!(frame.chroma_stride(), 2);
        }
        other => panic!("Expected a YUV frame, got {:?}", other),
    }
    assert_eq!(connection.stats().frames_received, 1);

    connection.send(Message::CursorId(4)).unwrap();
    let (_ws, event) = peer_side.await.unwrap();
    assert_eq!(event, Message::CursorId(4));

    signaling.await.unwrap();
}

/// Test: Lookup failure
/// Given the peer id does not exist
/// Then start() fails with the typed reason and the connection is closed
#[tokio::test]
async fn test_lookup_failure_closes_connection() {
    let (signaling_listener, base_port) = bind_signaling().await;
    let signaling = start_signaling(
        signaling_listener,
        RendezvousMessage::PunchHoleResponse(PunchHoleResponse {
            failure: Some(PunchHoleFailure::IdNotExist),
            ..Default::default()
        }),
    )
    .await;

    let ctx = ConnectionContext::new(root_signer().verifying_key());
    let mut connection = Connection::new(ctx, config(base_port));
    match connection.start(PEER_ID).await {
        Err(NetworkError::LookupFailure(reason)) => {
            assert_eq!(reason, LookupFailureReason::IdNotExist);
            assert!(!reason.is_retryable());
        }
        other => panic!("Expected LookupFailure, got {:?}", other),
    }
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(matches!(
        connection.send(Message::CursorId(1)),
        Err(NetworkError::InvalidState(ConnectionState::Closed))
    ));
    signaling.await.unwrap();
}

/// Test: Cancel a pending start
/// Given a peer that never sends its SignedId
/// When the connection is closed from another task
/// Then start() resolves with an error instead of hanging
#[tokio::test]
async fn test_close_handle_cancels_start() {
    let root = root_signer();
    let peer = PeerIdentity::new(PEER_ID);
    let (peer_listener, peer_port) = bind().await;
    let (signaling_listener, base_port) = bind_signaling().await;
    let signaling = start_signaling(
        signaling_listener,
        RendezvousMessage::PunchHoleResponse(PunchHoleResponse {
            socket_addr: Some(format!("127.0.0.1:{}", peer_port).parse().unwrap()),
            pk: Some(peer.signed_pk(&root)),
            ..Default::default()
        }),
    )
    .await;
    let silent_peer = tokio::spawn(async move {
        let mut ws = accept_ws(&peer_listener).await;
        wait_closed(&mut ws).await
    });

    let ctx = ConnectionContext::new(root.verifying_key());
    let mut connection = Connection::new(ctx, config(base_port));
    let handle = connection.close_handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle.close();
    });

    let result = tokio::time::timeout(STEP_TIMEOUT, connection.start(PEER_ID))
        .await
        .unwrap();
    assert!(result.is_err());
    assert_eq!(connection.state(), ConnectionState::Closed);

    connection.close();
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(silent_peer.await.unwrap());
    signaling.await.unwrap();
}

/// Test: Peer hangs up during key negotiation
/// Given a trusted peer key and a peer that closes before SignedId
/// Then start() fails with a transport error and the connection is closed
#[tokio::test]
async fn test_peer_hangup_while_securing_closes_connection() {
    let root = root_signer();
    let peer = PeerIdentity::new(PEER_ID);
    let (peer_listener, peer_port) = bind().await;
    let (signaling_listener, base_port) = bind_signaling().await;
    let signaling = start_signaling(
        signaling_listener,
        RendezvousMessage::PunchHoleResponse(PunchHoleResponse {
            socket_addr: Some(format!("127.0.0.1:{}", peer_port).parse().unwrap()),
            pk: Some(peer.signed_pk(&root)),
            ..Default::default()
        }),
    )
    .await;
    let peer_side = tokio::spawn(async move {
        let mut ws = accept_ws(&peer_listener).await;
        ws.close(None).await.unwrap();
    });

    let ctx = ConnectionContext::new(root.verifying_key());
    let mut connection = Connection::new(ctx, config(base_port));
    let result = tokio::time::timeout(STEP_TIMEOUT, connection.start(PEER_ID))
        .await
        .unwrap();
    assert!(matches!(result, Err(ref e) if e.is_transport()));
    assert_eq!(connection.state(), ConnectionState::Closed);
    assert!(connection.negotiated().is_none());

    peer_side.await.unwrap();
    signaling.await.unwrap();
}
