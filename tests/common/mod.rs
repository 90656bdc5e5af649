//! Loopback servers standing in for the rendezvous server, relay and peer

#![allow(dead_code)]

use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::SigningKey;
use futures_util::{SinkExt, StreamExt};
use rand::rngs::OsRng;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{accept_async, WebSocketStream};
use x25519_dalek::{PublicKey as BoxPublicKey, StaticSecret};

use deskline::network::{open_sealed_key, sign_combined, Direction, SessionCipher, SessionKey};
use deskline::protocol::codec::{decode, encode};
use deskline::protocol::{Message, PublicKey, SignedId};

pub type ServerSocket = WebSocketStream<TcpStream>;

/// Upper bound for any single step of a test
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Bind a loopback listener on an ephemeral port
pub async fn bind() -> (TcpListener, u16) {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("Failed to bind loopback listener");
    let port = listener.local_addr().expect("No local address").port();
    (listener, port)
}

/// Bind a listener usable as signaling endpoint; returns the base port
/// to configure the client with
pub async fn bind_signaling() -> (TcpListener, u16) {
    loop {
        let (listener, port) = bind().await;
        if port > 2 {
            return (listener, port - 2);
        }
    }
}

pub async fn accept_ws(listener: &TcpListener) -> ServerSocket {
    let (stream, _) = tokio::time::timeout(STEP_TIMEOUT, listener.accept())
        .await
        .expect("Timed out waiting for a client")
        .expect("Accept failed");
    accept_async(stream).await.expect("WebSocket handshake failed")
}

/// Next binary frame, or `None` once the client has gone away
pub async fn recv_binary(ws: &mut ServerSocket) -> Option<Vec<u8>> {
    loop {
        let frame = tokio::time::timeout(STEP_TIMEOUT, ws.next())
            .await
            .expect("Timed out waiting for a frame");
        match frame {
            Some(Ok(WsMessage::Binary(bytes))) => return Some(bytes),
            Some(Ok(WsMessage::Close(_))) | None | Some(Err(_)) => return None,
            Some(Ok(_)) => continue,
        }
    }
}

pub async fn send_binary(ws: &mut ServerSocket, bytes: Vec<u8>) {
    ws.send(WsMessage::Binary(bytes))
        .await
        .expect("Failed to send frame");
}

pub async fn send_message<T: serde::Serialize>(ws: &mut ServerSocket, message: &T) {
    send_binary(ws, encode(message).expect("encode")).await;
}

pub async fn recv_message<T: serde::de::DeserializeOwned>(ws: &mut ServerSocket) -> T {
    let bytes = recv_binary(ws).await.expect("Client closed the channel");
    decode(&bytes).expect("Undecodable message from client")
}

/// True once the client closes its side
pub async fn wait_closed(ws: &mut ServerSocket) -> bool {
    recv_binary(ws).await.is_none()
}

/// Rendezvous root signing key for tests
pub fn root_signer() -> SigningKey {
    SigningKey::generate(&mut OsRng)
}

/// A remote desktop peer's long-term keys
pub struct PeerIdentity {
    pub id: String,
    pub signing: SigningKey,
    pub box_secret: StaticSecret,
}

impl PeerIdentity {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            signing: SigningKey::generate(&mut OsRng),
            box_secret: StaticSecret::random_from_rng(OsRng),
        }
    }

    /// The peer's identity key as signed by the rendezvous server
    pub fn signed_pk(&self, root: &SigningKey) -> Vec<u8> {
        sign_combined(root, self.signing.verifying_key().as_bytes())
    }

    pub fn signed_id_payload(&self, declared_id: &str) -> Vec<u8> {
        let box_public = BoxPublicKey::from(&self.box_secret);
        let mut payload = declared_id.as_bytes().to_vec();
        payload.push(0);
        payload.extend_from_slice(STANDARD.encode(box_public.as_bytes()).as_bytes());
        payload
    }

    pub fn signed_id(&self) -> Message {
        Message::SignedId(SignedId {
            id: sign_combined(&self.signing, &self.signed_id_payload(&self.id)),
        })
    }

    /// Open the client's key reply; `None` for the empty "no encryption" reply
    pub fn open_reply(&self, reply: &PublicKey) -> Option<SessionKey> {
        if reply.is_empty() {
            return None;
        }
        Some(
            open_sealed_key(
                &self.box_secret,
                &reply.asymmetric_value,
                &reply.symmetric_value,
            )
            .expect("Sealed session key did not open"),
        )
    }
}

/// Peer side of an encrypted session
pub struct PeerSession {
    pub inbound: SessionCipher,
    pub outbound: SessionCipher,
}

impl PeerSession {
    pub fn new(key: &SessionKey) -> Self {
        Self {
            inbound: SessionCipher::new(key, Direction::ClientToPeer),
            outbound: SessionCipher::new(key, Direction::PeerToClient),
        }
    }

    pub async fn recv(&mut self, ws: &mut ServerSocket) -> Message {
        let bytes = recv_binary(ws).await.expect("Client closed the channel");
        let plaintext = self
            .inbound
            .open_next(&bytes)
            .expect("Client message did not decrypt");
        decode(&plaintext).expect("Undecodable message from client")
    }

    pub async fn send(&mut self, ws: &mut ServerSocket, message: &Message) {
        let sealed = self
            .outbound
            .seal_next(&encode(message).expect("encode"))
            .expect("encrypt");
        send_binary(ws, sealed).await;
    }
}

/// Run the peer half of the handshake; returns the session key if the
/// client secured the session
pub async fn peer_handshake(ws: &mut ServerSocket, peer: &PeerIdentity, signed_id: Message) -> Option<SessionKey> {
    send_message(ws, &signed_id).await;
    await_key_reply(ws, peer).await
}

/// Wait for the client's `PublicKey` reply without sending anything first
pub async fn await_key_reply(ws: &mut ServerSocket, peer: &PeerIdentity) -> Option<SessionKey> {
    match recv_message::<Message>(ws).await {
        Message::PublicKey(reply) => peer.open_reply(&reply),
        other => panic!("Expected PublicKey, got {:?}", other),
    }
}
