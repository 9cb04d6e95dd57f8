//! MTProto message codec for the pylon proxy.
//!
//! Provides:
//! - AES-256-IGE encryption/decryption (true two-register chaining)
//! - SHA-256 hash macro
//! - `AuthKey` — 256-byte session key with wire identifier
//! - Frame encryption / decryption with per-side key derivation
//! - Inner message layout and message-id generation
//!
//! Everything in this crate is pure and synchronous; no function suspends,
//! blocks, or touches shared state.

#![deny(unsafe_code)]

mod auth_key;
pub mod codec;
pub mod ige;
mod message;
mod sha;

pub use auth_key::AuthKey;
pub use codec::{FRAME_HEADER_LEN, Side, decrypt, encrypt, frame_auth_key_id, frame_shape_ok};
pub use message::{INNER_HEADER_LEN, InnerMessage, MessageIdGen};

/// Errors from frame encryption and decryption.
#[derive(Clone, Debug, PartialEq)]
pub enum CodecError {
    /// Malformed wire data: undersized, misaligned, or an inconsistent
    /// declared length. Rejects the single frame only.
    InvalidFrame,
    /// The msg_key recomputed from the decrypted plaintext does not match
    /// the one carried in the frame — tampering, corruption, or a frame
    /// decrypted with the wrong direction.
    Integrity,
    /// A codec precondition was violated (configuration or programming
    /// error); should not occur in normal operation.
    Encryption(&'static str),
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidFrame => write!(f, "invalid frame"),
            Self::Integrity => write!(f, "msg_key mismatch"),
            Self::Encryption(s) => write!(f, "encryption failed: {s}"),
        }
    }
}
impl std::error::Error for CodecError {}
