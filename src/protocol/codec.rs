//! Binary encoding shared by both wire schemas
//!
//! Messages are bincode-encoded with fixed-width integers. Trailing bytes
//! are rejected so that ciphertext or raw plane data never decodes as a
//! valid message by accident.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Upper bound on a single encoded message (16 MiB)
pub const MAX_MESSAGE_SIZE: u64 = 16 * 1024 * 1024;

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
        .reject_trailing_bytes()
}

/// Serialize a message to its wire form
pub fn encode<T: Serialize + ?Sized>(msg: &T) -> Result<Vec<u8>, bincode::Error> {
    options().serialize(msg)
}

/// Deserialize a message from its wire form
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    options().deserialize(bytes)
}
