//! Signed identities and the rendezvous root key
//!
//! Signed blobs use the combined layout: a 64-byte Ed25519 signature
//! followed by the signed payload.

use std::sync::OnceLock;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey, SIGNATURE_LENGTH};

use super::encryption::{to_key_array, KEY_SIZE};
use super::error::CryptoError;

/// Versions of the rendezvous root signing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKeyVersion {
    V1,
}

impl RootKeyVersion {
    pub const CURRENT: RootKeyVersion = RootKeyVersion::V1;

    fn encoded(self) -> &'static str {
        match self {
            RootKeyVersion::V1 => "XND4Mv9+CL/h4d7rzNOGlo/nPOwZ1odhAHcoXHwDUjU=",
        }
    }
}

static ROOT_KEY_V1: OnceLock<Result<VerifyingKey, CryptoError>> = OnceLock::new();

/// Built-in root key for `version`, decoded once on first use
pub fn root_key(version: RootKeyVersion) -> Result<VerifyingKey, CryptoError> {
    let cell = match version {
        RootKeyVersion::V1 => &ROOT_KEY_V1,
    };
    cell.get_or_init(|| decode_verifying_key(version.encoded()))
        .clone()
}

/// Decode a base64 Ed25519 public key
pub fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, CryptoError> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| CryptoError::InvalidEncoding(e.to_string()))?;
    verifying_key_from_bytes(&bytes)
}

pub fn verifying_key_from_bytes(bytes: &[u8]) -> Result<VerifyingKey, CryptoError> {
    let bytes = to_key_array(bytes)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)
}

/// Verify a combined signed blob and return the payload
pub fn open_signed(blob: &[u8], key: &VerifyingKey) -> Result<Vec<u8>, CryptoError> {
    if blob.len() < SIGNATURE_LENGTH {
        return Err(CryptoError::BadSignature);
    }
    let (signature, payload) = blob.split_at(SIGNATURE_LENGTH);
    let signature = Signature::from_slice(signature).map_err(|_| CryptoError::BadSignature)?;
    key.verify_strict(payload, &signature)
        .map_err(|_| CryptoError::BadSignature)?;
    Ok(payload.to_vec())
}

/// Produce a combined signed blob
pub fn sign_combined(key: &SigningKey, payload: &[u8]) -> Vec<u8> {
    let signature = key.sign(payload);
    let mut blob = Vec::with_capacity(SIGNATURE_LENGTH + payload.len());
    blob.extend_from_slice(&signature.to_bytes());
    blob.extend_from_slice(payload);
    blob
}

/// Verify a rendezvous-signed peer key against the root key
///
/// The payload must be exactly one Ed25519 public key.
pub fn open_signed_peer_key(blob: &[u8], root: &VerifyingKey) -> Result<VerifyingKey, CryptoError> {
    let payload = open_signed(blob, root)?;
    if payload.len() != KEY_SIZE {
        return Err(CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: payload.len(),
        });
    }
    verifying_key_from_bytes(&payload)
}

/// Read-only state shared by every connection of a process
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    root_key: VerifyingKey,
}

impl ConnectionContext {
    pub fn new(root_key: VerifyingKey) -> Self {
        Self { root_key }
    }

    /// Context trusting the current built-in root key
    pub fn builtin() -> Result<Self, CryptoError> {
        Ok(Self::new(root_key(RootKeyVersion::CURRENT)?))
    }

    pub fn root_key(&self) -> &VerifyingKey {
        &self.root_key
    }
}
