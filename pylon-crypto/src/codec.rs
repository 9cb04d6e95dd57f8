//! MTProto 2.0 frame encryption and decryption.
//!
//! Wire layout of an encrypted frame:
//!
//! ```text
//! auth_key_id:  8 bytes   (first 8 bytes of the auth key)
//! msg_key:     16 bytes   (middle of SHA-256 over key material ‖ plaintext)
//! ciphertext:   n·16 bytes (AES-256-IGE over the padded inner message)
//! ```

use crate::auth_key::AuthKey;
use crate::ige;
use crate::message::InnerMessage;
use crate::{CodecError, sha256};

/// Bytes before the ciphertext: `auth_key_id(8) + msg_key(16)`.
pub const FRAME_HEADER_LEN: usize = 24;

/// Upper bound on a single message body; anything larger cannot be framed.
pub const MAX_BODY_LEN: usize = 1 << 24;

/// Which peer produced a frame.
///
/// Client→server and server→client traffic derive different cipher keys from
/// the same auth key, selected by an offset into the key material. A frame
/// can only be decrypted with the side it was encrypted for; the wrong side
/// fails the msg_key integrity check.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Side {
    /// Frames travelling client → datacenter.
    Client,
    /// Frames travelling datacenter → client.
    Server,
}

impl Side {
    fn x(self) -> usize {
        match self {
            Side::Client => 0,
            Side::Server => 8,
        }
    }
}

/// Derive the per-message AES key and IV from `(auth_key, msg_key, side)`.
fn calc_key(auth_key: &AuthKey, msg_key: &[u8; 16], side: Side) -> ([u8; 32], [u8; 32]) {
    let x = side.x();
    let sha_a = sha256!(msg_key, &auth_key.data[x..x + 36]);
    let sha_b = sha256!(&auth_key.data[40 + x..40 + x + 36], msg_key);

    let mut aes_key = [0u8; 32];
    aes_key[..8].copy_from_slice(&sha_a[..8]);
    aes_key[8..24].copy_from_slice(&sha_b[8..24]);
    aes_key[24..].copy_from_slice(&sha_a[24..]);

    let mut aes_iv = [0u8; 32];
    aes_iv[..8].copy_from_slice(&sha_b[..8]);
    aes_iv[8..24].copy_from_slice(&sha_a[8..24]);
    aes_iv[24..].copy_from_slice(&sha_b[24..]);

    (aes_key, aes_iv)
}

/// msg_key = SHA-256(auth_key[88+x..120+x] ‖ padded_plaintext)[8..24].
///
/// Binding the digest to session key material prevents replaying one
/// session's ciphertext against another.
fn calc_msg_key(auth_key: &AuthKey, plaintext: &[u8], side: Side) -> [u8; 16] {
    let x = side.x();
    let large = sha256!(&auth_key.data[88 + x..88 + x + 32], plaintext);
    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&large[8..24]);
    msg_key
}

/// Padding to the next 16-byte boundary, always at least one full block.
fn padding_len(len: usize) -> usize {
    16 + (16 - (len % 16))
}

/// Build and encrypt a frame.
pub fn encrypt(
    body: &[u8],
    auth_key: &AuthKey,
    salt: i64,
    session_id: i64,
    msg_id: i64,
    seq_no: i32,
    side: Side,
) -> Result<Vec<u8>, CodecError> {
    if body.len() > MAX_BODY_LEN {
        return Err(CodecError::Encryption("message body too large to frame"));
    }

    let inner = InnerMessage {
        salt,
        session_id,
        msg_id,
        seq_no,
        body: body.to_vec(),
    };
    let mut plaintext = inner.to_bytes();

    let mut rnd = [0u8; 32];
    getrandom::getrandom(&mut rnd)
        .map_err(|_| CodecError::Encryption("system randomness unavailable"))?;
    plaintext.extend(rnd.iter().take(padding_len(plaintext.len())));

    let msg_key = calc_msg_key(auth_key, &plaintext, side);
    let (key, iv) = calc_key(auth_key, &msg_key, side);
    ige::ige_encrypt(&mut plaintext, &key, &iv);

    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + plaintext.len());
    frame.extend(auth_key.key_id());
    frame.extend(msg_key);
    frame.extend(plaintext);
    Ok(frame)
}

/// Decrypt a frame and parse the inner message.
///
/// `side` names the peer that *produced* the frame. The msg_key is always
/// recomputed from the decrypted plaintext and compared against the one in
/// the frame header; a mismatch means tampering, corruption, or the wrong
/// direction, and the frame is rejected.
pub fn decrypt(frame: &[u8], auth_key: &AuthKey, side: Side) -> Result<InnerMessage, CodecError> {
    if frame.len() < FRAME_HEADER_LEN || frame.len() % 4 != 0 {
        return Err(CodecError::InvalidFrame);
    }
    let ciphertext = &frame[FRAME_HEADER_LEN..];
    if ciphertext.is_empty() || ciphertext.len() % 16 != 0 {
        return Err(CodecError::InvalidFrame);
    }
    if frame[..8] != auth_key.key_id() {
        return Err(CodecError::Integrity);
    }

    let mut msg_key = [0u8; 16];
    msg_key.copy_from_slice(&frame[8..24]);

    let (key, iv) = calc_key(auth_key, &msg_key, side);
    let mut plaintext = ciphertext.to_vec();
    ige::ige_decrypt(&mut plaintext, &key, &iv);

    if calc_msg_key(auth_key, &plaintext, side) != msg_key {
        return Err(CodecError::Integrity);
    }

    InnerMessage::parse(&plaintext)
}

/// Cheap shape check used by the bridge before touching any session state:
/// total length ≥ 24 and a multiple of 4.
pub fn frame_shape_ok(frame: &[u8]) -> bool {
    frame.len() >= FRAME_HEADER_LEN && frame.len() % 4 == 0
}

/// Extract the 8-byte routing identifier from a wire frame, if present.
pub fn frame_auth_key_id(frame: &[u8]) -> Option<u64> {
    if frame.len() < 8 {
        return None;
    }
    Some(u64::from_le_bytes(frame[..8].try_into().unwrap()))
}
