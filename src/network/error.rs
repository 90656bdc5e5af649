//! Network error types

use std::fmt;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

use super::connection::ConnectionState;

/// Why the rendezvous server could not hand out a route to the peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LookupFailureReason {
    IdNotExist,
    Offline,
    LicenseMismatch,
    LicenseOveruse,
    Other(String),
}

impl LookupFailureReason {
    /// Whether trying again later can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Offline | Self::Other(_))
    }
}

impl fmt::Display for LookupFailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::IdNotExist => write!(f, "ID does not exist"),
            Self::Offline => write!(f, "remote peer is offline"),
            Self::LicenseMismatch => write!(f, "key mismatch"),
            Self::LicenseOveruse => write!(f, "key overuse"),
            Self::Other(reason) => write!(f, "{}", reason),
        }
    }
}

/// Errors from the crypto primitives
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("Signature verification failed")]
    BadSignature,

    #[error("Invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    #[error("Invalid public key")]
    InvalidPublicKey,

    #[error("Invalid base64 key: {0}")]
    InvalidEncoding(String),

    #[error("Encryption failed")]
    EncryptionFailed,

    #[error("Decryption failed")]
    DecryptionFailed,

    #[error("Key derivation failed")]
    KeyDerivation,
}

/// Errors that can occur in the network subsystem
#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Lookup failed: {0}")]
    LookupFailure(LookupFailureReason),

    #[error("WebSocket error: {0}")]
    WebSocket(Box<tungstenite::Error>),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Operation not valid in state {0:?}")]
    InvalidState(ConnectionState),

    #[error("Session key already set")]
    KeyAlreadySet,

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),
}

impl From<tungstenite::Error> for NetworkError {
    fn from(e: tungstenite::Error) -> Self {
        match e {
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                NetworkError::ChannelClosed
            }
            other => NetworkError::WebSocket(Box::new(other)),
        }
    }
}

impl NetworkError {
    /// True for failures of the underlying connection rather than of the
    /// protocol running over it
    pub fn is_transport(&self) -> bool {
        matches!(self, NetworkError::WebSocket(_) | NetworkError::ChannelClosed)
    }
}
