//! Session key negotiation
//!
//! Runs once per session channel, before any other session traffic:
//!
//! ```text
//! verify signed peer key --> read SignedId --> verify, parse "id\0box_pk"
//!     --> seal fresh session key to box_pk --> send PublicKey{eph_pk, sealed}
//!     --> Secured
//! no trusted key, or any verification failure
//!     --> send PublicKey{} --> ExplicitlyInsecure
//! ```
//!
//! Verification failures downgrade the session; they never abort it.
//! A channel failure does.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::VerifyingKey;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::protocol::{Message, PublicKey};

use super::encryption::{to_key_array, EphemeralKeyPair, SessionKey};
use super::error::NetworkError;
use super::identity::{open_signed, open_signed_peer_key, ConnectionContext};
use super::transport::{Inbound, SessionChannel};

/// Why a session ended up unencrypted
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SecurityDowngrade {
    #[error("no trusted peer key")]
    NoTrustedKey,

    #[error("expected SignedId, got {0}")]
    UnexpectedMessage(String),

    #[error("SignedId signature did not verify")]
    BadSignedId,

    #[error("malformed SignedId payload: {0}")]
    MalformedPayload(String),

    #[error("peer declared id {declared}, expected {expected}")]
    IdMismatch { expected: String, declared: String },

    #[error("could not seal session key: {0}")]
    Seal(String),
}

/// Result of a negotiation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiated {
    Secured,
    Insecure(SecurityDowngrade),
}

impl Negotiated {
    pub fn is_secured(&self) -> bool {
        matches!(self, Negotiated::Secured)
    }
}

/// Negotiate the session key on `channel`
///
/// `signed_pk` is the rendezvous-signed peer identity key. Without a
/// trusted key the client replies `PublicKey{}` at once and reads
/// nothing. Verification failures downgrade the session; a failed or
/// undecodable read is returned as an error, and the channel is then
/// unusable.
pub async fn negotiate(
    channel: &mut SessionChannel,
    ctx: &ConnectionContext,
    expected_id: &str,
    signed_pk: Option<&[u8]>,
) -> Result<Negotiated, NetworkError> {
    let outcome = match trusted_peer_key(ctx, signed_pk) {
        Some(peer_key) => {
            let first = channel.next().await?;
            establish(first, &peer_key, expected_id)
        }
        None => Err(SecurityDowngrade::NoTrustedKey),
    };

    match outcome {
        Ok((announce, key)) => {
            channel.send_and_secure(&announce, key)?;
            info!("Session with {} is encrypted", expected_id);
            Ok(Negotiated::Secured)
        }
        Err(downgrade) => {
            warn!("Session with {} is not encrypted: {}", expected_id, downgrade);
            channel.send(&Message::PublicKey(PublicKey::default()))?;
            channel.mark_insecure()?;
            Ok(Negotiated::Insecure(downgrade))
        }
    }
}

/// Check the peer's first message and build the key reply
fn establish(
    first: Inbound<Message>,
    peer_key: &VerifyingKey,
    expected_id: &str,
) -> Result<(Message, SessionKey), SecurityDowngrade> {
    let signed_id = match first {
        Inbound::Message(Message::SignedId(signed_id)) => signed_id,
        Inbound::Message(other) => {
            return Err(SecurityDowngrade::UnexpectedMessage(other.kind().into()))
        }
        Inbound::Frame(_) => {
            return Err(SecurityDowngrade::UnexpectedMessage("pixel frame".into()))
        }
    };

    let payload = open_signed(&signed_id.id, peer_key).map_err(|_| SecurityDowngrade::BadSignedId)?;
    let box_public = parse_signed_id(&payload, expected_id)?;

    let session_key = SessionKey::generate();
    let sealed = EphemeralKeyPair::generate()
        .seal(&box_public, &session_key)
        .map_err(|e| SecurityDowngrade::Seal(e.to_string()))?;
    debug!("Session key sealed to peer box key");

    let announce = Message::PublicKey(PublicKey {
        asymmetric_value: sealed.ephemeral_public.to_vec(),
        symmetric_value: sealed.ciphertext,
    });
    Ok((announce, session_key))
}

fn trusted_peer_key(ctx: &ConnectionContext, signed_pk: Option<&[u8]>) -> Option<VerifyingKey> {
    let blob = signed_pk?;
    match open_signed_peer_key(blob, ctx.root_key()) {
        Ok(key) => Some(key),
        Err(e) => {
            warn!("Rendezvous-signed peer key rejected: {}", e);
            None
        }
    }
}

/// Parse `declared_id \0 base64(box_public_key)` and check the id
fn parse_signed_id(payload: &[u8], expected_id: &str) -> Result<[u8; 32], SecurityDowngrade> {
    let split = payload
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| SecurityDowngrade::MalformedPayload("missing separator".into()))?;
    let (declared, encoded) = (&payload[..split], &payload[split + 1..]);

    let declared = std::str::from_utf8(declared)
        .map_err(|_| SecurityDowngrade::MalformedPayload("id is not UTF-8".into()))?;
    if declared != expected_id {
        return Err(SecurityDowngrade::IdMismatch {
            expected: expected_id.to_string(),
            declared: declared.to_string(),
        });
    }

    let box_public = STANDARD
        .decode(encoded)
        .map_err(|e| SecurityDowngrade::MalformedPayload(e.to_string()))?;
    to_key_array(&box_public).map_err(|e| SecurityDowngrade::MalformedPayload(e.to_string()))
}
