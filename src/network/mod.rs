//! Network module for remote desktop sessions
//!
//! Handles the WebSocket transport, rendezvous lookup, session key
//! negotiation, frame reassembly and connection management.

mod connection;
mod encryption;
mod error;
mod identity;
mod reassembly;
mod rendezvous;
mod secure;
mod transport;

pub use connection::{CloseHandle, Connection, ConnectionState, ConnectionStats};
pub use encryption::{
    open_sealed_key, Direction, EphemeralKeyPair, SealedKey, SessionCipher, SessionKey, KEY_SIZE,
    TAG_SIZE,
};
pub use error::{CryptoError, LookupFailureReason, NetworkError};
pub use identity::{
    decode_verifying_key, open_signed, open_signed_peer_key, root_key, sign_combined,
    verifying_key_from_bytes, ConnectionContext, RootKeyVersion,
};
pub use reassembly::{PixelFrame, Reassembler, RgbFrame, YuvFrame};
pub use rendezvous::{interpret_reply, RendezvousClient, RendezvousOutcome, DECLARED_NAT_TYPE};
pub use secure::{negotiate, Negotiated, SecurityDowngrade};
pub use transport::{
    ChannelCloser, ChannelSender, Inbound, SessionChannel, SessionKeyState, SignalingChannel,
    TransportChannel,
};
