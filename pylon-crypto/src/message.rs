//! Inner message layout and message-id generation.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::CodecError;

/// Fixed part of the decrypted inner layout:
/// `salt(8) + session_id(8) + msg_id(8) + seq_no(4) + len(4)`.
pub const INNER_HEADER_LEN: usize = 32;

/// The plaintext structure carried inside an encrypted frame.
#[derive(Clone, Debug, PartialEq)]
pub struct InnerMessage {
    /// Session-scoped server salt.
    pub salt: i64,
    /// The session this message belongs to.
    pub session_id: i64,
    /// Timestamp-derived unique message identifier.
    pub msg_id: i64,
    /// Per-session sequence number.
    pub seq_no: i32,
    /// The opaque message body.
    pub body: Vec<u8>,
}

impl InnerMessage {
    /// Serialize header + body (little-endian fields, no padding).
    ///
    /// ```text
    /// salt:       i64
    /// session_id: i64
    /// msg_id:     i64
    /// seq_no:     i32
    /// body_len:   i32
    /// body:       [u8; body_len]
    /// ```
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(INNER_HEADER_LEN + self.body.len());
        buf.extend(self.salt.to_le_bytes());
        buf.extend(self.session_id.to_le_bytes());
        buf.extend(self.msg_id.to_le_bytes());
        buf.extend(self.seq_no.to_le_bytes());
        buf.extend((self.body.len() as u32).to_le_bytes());
        buf.extend(&self.body);
        buf
    }

    /// Parse a decrypted (still padded) buffer.
    ///
    /// Rejects a header that does not fit, and a declared body length that
    /// exceeds the bytes actually present after the header.
    pub fn parse(plaintext: &[u8]) -> Result<Self, CodecError> {
        if plaintext.len() < INNER_HEADER_LEN {
            return Err(CodecError::InvalidFrame);
        }
        let salt = i64::from_le_bytes(plaintext[..8].try_into().unwrap());
        let session_id = i64::from_le_bytes(plaintext[8..16].try_into().unwrap());
        let msg_id = i64::from_le_bytes(plaintext[16..24].try_into().unwrap());
        let seq_no = i32::from_le_bytes(plaintext[24..28].try_into().unwrap());
        let body_len = u32::from_le_bytes(plaintext[28..32].try_into().unwrap()) as usize;

        if body_len > plaintext.len() - INNER_HEADER_LEN {
            return Err(CodecError::InvalidFrame);
        }
        let body = plaintext[INNER_HEADER_LEN..INNER_HEADER_LEN + body_len].to_vec();
        Ok(Self { salt, session_id, msg_id, seq_no, body })
    }
}

/// Generates 64-bit timestamp-derived message identifiers.
///
/// Lower layout mirrors MTProto: whole seconds in the high 32 bits, nanosecond
/// fraction (shifted to keep the two LSBs clear) in the low bits. Two calls in
/// the same clock tick are forced apart so an id is never reissued.
#[derive(Debug, Default)]
pub struct MessageIdGen {
    last: i64,
}

impl MessageIdGen {
    /// Create a generator with no issued ids.
    pub fn new() -> Self {
        Self { last: 0 }
    }

    /// Resume a generator from the last id issued for a session, so ids
    /// stay strictly increasing across process restarts and reconnects.
    pub fn resume(last: i64) -> Self {
        Self { last }
    }

    /// Allocate the next message id, strictly greater than any previous one.
    pub fn next(&mut self) -> i64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        let secs = now.as_secs();
        let nanos = u64::from(now.subsec_nanos());
        let mut id = ((secs << 32) | (nanos << 2 & 0xffff_fffc)) as i64;
        if self.last >= id {
            id = self.last + 4;
        }
        self.last = id;
        id
    }
}
