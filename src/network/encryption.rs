//! Encryption layer for session traffic
//!
//! Uses X25519 to seal a random session key to the peer and AES-256-GCM
//! for session traffic. Traffic nonces are derived from a per-direction
//! message counter so the same key never sees the same nonce twice.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;
use x25519_dalek::{EphemeralSecret, PublicKey as BoxPublicKey, StaticSecret};

use super::error::CryptoError;

/// Size of a session key and of an X25519 public key
pub const KEY_SIZE: usize = 32;

/// Size of the nonce (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

/// Size of the authentication tag (AES-GCM)
pub const TAG_SIZE: usize = 16;

/// Nonce used for the one-shot session key seal
const SEAL_NONCE: [u8; NONCE_SIZE] = [0u8; NONCE_SIZE];

const SEAL_INFO: &[u8] = b"deskline-session-key-seal";

/// Symmetric key shared by both ends of one session
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    /// Generate a new random key
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

/// Which way a message travels; both directions share the session key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    ClientToPeer,
    PeerToClient,
}

impl Direction {
    fn tag(self) -> u8 {
        match self {
            Direction::ClientToPeer => 0x01,
            Direction::PeerToClient => 0x02,
        }
    }
}

/// Authenticated encryption for one direction of a session
///
/// The counter starts at zero and is incremented before every
/// `seal_next`/`open_next`, so the first message uses counter 1.
pub struct SessionCipher {
    cipher: Aes256Gcm,
    direction: Direction,
    counter: u64,
}

impl SessionCipher {
    pub fn new(key: &SessionKey, direction: Direction) -> Self {
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key.as_bytes()));
        Self {
            cipher,
            direction,
            counter: 0,
        }
    }

    /// Encrypt with an explicit counter value
    pub fn encrypt(&self, counter: u64, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.derive_nonce(counter);
        self.cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|_| CryptoError::EncryptionFailed)
    }

    /// Decrypt with an explicit counter value
    pub fn decrypt(&self, counter: u64, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.derive_nonce(counter);
        self.cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext)
            .map_err(|_| CryptoError::DecryptionFailed)
    }

    /// Encrypt the next outgoing message
    pub fn seal_next(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.counter += 1;
        self.encrypt(self.counter, plaintext)
    }

    /// Decrypt the next incoming message
    pub fn open_next(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.counter += 1;
        self.decrypt(self.counter, ciphertext)
    }

    /// Last counter value used
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Nonce format: [8 bytes counter LE][1 byte direction][3 bytes zero]
    fn derive_nonce(&self, counter: u64) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[0..8].copy_from_slice(&counter.to_le_bytes());
        nonce[8] = self.direction.tag();
        nonce
    }
}

/// Session key sealed to the peer's box public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SealedKey {
    pub ephemeral_public: [u8; KEY_SIZE],
    pub ciphertext: Vec<u8>,
}

/// Single-use X25519 key pair for sealing the session key
///
/// `seal` consumes the pair, so the fixed seal nonce is only ever used
/// once per key.
pub struct EphemeralKeyPair {
    secret: EphemeralSecret,
    public: BoxPublicKey,
}

impl EphemeralKeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let secret = EphemeralSecret::random_from_rng(OsRng);
        let public = BoxPublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key_bytes(&self) -> [u8; KEY_SIZE] {
        self.public.to_bytes()
    }

    /// Seal `key` so that only the holder of `peer_public`'s secret can open it
    pub fn seal(self, peer_public: &[u8; KEY_SIZE], key: &SessionKey) -> Result<SealedKey, CryptoError> {
        let ephemeral_public = self.public.to_bytes();
        let peer = BoxPublicKey::from(*peer_public);
        let shared = self.secret.diffie_hellman(&peer);
        if !shared.was_contributory() {
            return Err(CryptoError::InvalidPublicKey);
        }

        let cipher = seal_cipher(shared.as_bytes(), &ephemeral_public, peer_public)?;
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&SEAL_NONCE), key.as_bytes().as_slice())
            .map_err(|_| CryptoError::EncryptionFailed)?;

        Ok(SealedKey {
            ephemeral_public,
            ciphertext,
        })
    }
}

/// Open a sealed session key with the recipient's static box secret
pub fn open_sealed_key(
    secret: &StaticSecret,
    ephemeral_public: &[u8],
    ciphertext: &[u8],
) -> Result<SessionKey, CryptoError> {
    let ephemeral_public = to_key_array(ephemeral_public)?;
    let our_public = BoxPublicKey::from(secret).to_bytes();
    let shared = secret.diffie_hellman(&BoxPublicKey::from(ephemeral_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidPublicKey);
    }

    let cipher = seal_cipher(shared.as_bytes(), &ephemeral_public, &our_public)?;
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&SEAL_NONCE), ciphertext)
        .map_err(|_| CryptoError::DecryptionFailed)?;

    Ok(SessionKey::from_bytes(to_key_array(&plaintext)?))
}

/// Derive the seal cipher, binding both public keys into the key
fn seal_cipher(
    shared_secret: &[u8; KEY_SIZE],
    ephemeral_public: &[u8; KEY_SIZE],
    recipient_public: &[u8; KEY_SIZE],
) -> Result<Aes256Gcm, CryptoError> {
    let mut salt = [0u8; KEY_SIZE * 2];
    salt[..KEY_SIZE].copy_from_slice(ephemeral_public);
    salt[KEY_SIZE..].copy_from_slice(recipient_public);

    let hk = Hkdf::<Sha256>::new(Some(&salt), shared_secret);
    let mut key_bytes = [0u8; KEY_SIZE];
    hk.expand(SEAL_INFO, &mut key_bytes)
        .map_err(|_| CryptoError::KeyDerivation)?;

    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)))
}

pub(crate) fn to_key_array(bytes: &[u8]) -> Result<[u8; KEY_SIZE], CryptoError> {
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength {
            expected: KEY_SIZE,
            actual: bytes.len(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_law() {
        let key = SessionKey::generate();
        let cipher = SessionCipher::new(&key, Direction::ClientToPeer);
        let plaintext = b"move the mouse";

        for counter in [1u64, 2, 255, 256, u32::MAX as u64 + 1, u64::MAX - 1] {
            let ct = cipher.encrypt(counter, plaintext).unwrap();
            assert_eq!(cipher.decrypt(counter, &ct).unwrap(), plaintext);
            assert_eq!(
                cipher.decrypt(counter + 1, &ct),
                Err(CryptoError::DecryptionFailed)
            );
        }
    }

    #[test]
    fn test_directions_do_not_share_nonces() {
        let key = SessionKey::generate();
        let outbound = SessionCipher::new(&key, Direction::ClientToPeer);
        let inbound = SessionCipher::new(&key, Direction::PeerToClient);

        let ct = outbound.encrypt(1, b"hello").unwrap();
        assert!(inbound.decrypt(1, &ct).is_err());
        assert_ne!(ct, inbound.encrypt(1, b"hello").unwrap());
    }

    #[test]
    fn test_counters_advance_in_lockstep() {
        let key = SessionKey::generate();
        let mut sender = SessionCipher::new(&key, Direction::ClientToPeer);
        let mut receiver = SessionCipher::new(&key, Direction::ClientToPeer);

        for i in 0..5u8 {
            let ct = sender.seal_next(&[i; 10]).unwrap();
            assert_eq!(receiver.open_next(&ct).unwrap(), vec![i; 10]);
        }
        assert_eq!(sender.counter(), 5);
        assert_eq!(receiver.counter(), 5);
    }

    #[test]
    fn test_seal_and_open_session_key() {
        let peer_secret = StaticSecret::random_from_rng(OsRng);
        let peer_public = BoxPublicKey::from(&peer_secret).to_bytes();
        let session_key = SessionKey::generate();

        let sealed = EphemeralKeyPair::generate()
            .seal(&peer_public, &session_key)
            .unwrap();
        assert_eq!(sealed.ciphertext.len(), KEY_SIZE + TAG_SIZE);

        let opened =
            open_sealed_key(&peer_secret, &sealed.ephemeral_public, &sealed.ciphertext).unwrap();
        assert_eq!(opened, session_key);
    }

    #[test]
    fn test_sealed_key_is_bound_to_recipient() {
        let peer_secret = StaticSecret::random_from_rng(OsRng);
        let peer_public = BoxPublicKey::from(&peer_secret).to_bytes();
        let other_secret = StaticSecret::random_from_rng(OsRng);

        let sealed = EphemeralKeyPair::generate()
            .seal(&peer_public, &SessionKey::generate())
            .unwrap();

        assert_eq!(
            open_sealed_key(&other_secret, &sealed.ephemeral_public, &sealed.ciphertext),
            Err(CryptoError::DecryptionFailed)
        );
    }

    #[test]
    fn test_low_order_peer_key_rejected() {
        let result = EphemeralKeyPair::generate().seal(&[0u8; KEY_SIZE], &SessionKey::generate());
        assert_eq!(result, Err(CryptoError::InvalidPublicKey));
    }

    #[test]
    fn test_wrong_length_ephemeral_key() {
        let secret = StaticSecret::random_from_rng(OsRng);
        assert_eq!(
            open_sealed_key(&secret, &[1, 2, 3], &[0; 48]),
            Err(CryptoError::InvalidKeyLength {
                expected: KEY_SIZE,
                actual: 3
            })
        );
    }

    #[test]
    fn test_session_key_debug_is_redacted() {
        let key = SessionKey::from_bytes([0x41; KEY_SIZE]);
        assert_eq!(format!("{:?}", key), "SessionKey(..)");
    }
}
