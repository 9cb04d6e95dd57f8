//! The session record — the unit of protocol state.

use std::time::{SystemTime, UNIX_EPOCH};

use pylon_crypto::AuthKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer, de};

/// 8-byte session identifier, hex-encoded everywhere it leaves the process.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct SessionId(pub u64);

impl SessionId {
    /// Allocate a fresh random identifier.
    pub fn generate() -> Self {
        let mut rnd = [0u8; 8];
        getrandom::getrandom(&mut rnd).expect("system randomness unavailable");
        Self(u64::from_le_bytes(rnd))
    }

    /// Parse the 16-char hex form.
    pub fn from_hex(s: &str) -> Option<Self> {
        let bytes: [u8; 8] = hex::decode(s).ok()?.try_into().ok()?;
        Some(Self(u64::from_be_bytes(bytes)))
    }

    /// The 16-char hex form.
    pub fn to_hex(self) -> String {
        hex::encode(self.0.to_be_bytes())
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for SessionId {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for SessionId {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        Self::from_hex(&s).ok_or_else(|| de::Error::custom("invalid session id"))
    }
}

/// Hex-encode binary fields inside JSON records.
mod hex_encoded {
    use super::*;

    pub fn serialize<S: Serializer>(bytes: &Vec<u8>, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        hex::decode(&s).map_err(de::Error::custom)
    }
}

/// Canonical per-session protocol state, owned by the store.
///
/// The bridge only ever holds the `session_id` and must re-fetch the record
/// before use; a copy cached across a suspension point is not authoritative.
#[derive(Clone, Deserialize, Serialize)]
pub struct Session {
    pub session_id: SessionId,
    /// 256 bytes of already-negotiated key material. Never logged.
    #[serde(with = "hex_encoded")]
    auth_key: Vec<u8>,
    /// Session-scoped salt, regenerated only at creation.
    pub server_salt: i64,
    /// Incremented on every outbound message; never decreases.
    pub seq_no: u32,
    /// Last issued timestamp-derived message id.
    pub last_msg_id: i64,
    /// Target datacenter, 1..=5.
    pub dc_id: u8,
    pub user_id: Option<i64>,
    /// Unix milliseconds of the last successful exchange.
    pub last_activity: u64,
}

impl Session {
    /// Create a session with freshly generated key material.
    pub fn new(dc_id: u8, user_id: Option<i64>) -> Self {
        let mut auth_key = vec![0u8; 256];
        getrandom::getrandom(&mut auth_key).expect("system randomness unavailable");
        // The first key byte doubles as the first wire byte of every frame
        // this session emits; it must never collide with the '{' that marks
        // a JSON control message.
        if auth_key[0] == b'{' {
            auth_key[0] ^= 0x80;
        }
        Self::with_material(dc_id, user_id, auth_key)
    }

    /// Create a session whose key identifier is fixed to `key_id` — the
    /// first 8 key bytes are the id, the remaining 248 are fresh random
    /// material. This ties the session to the identifier the client puts on
    /// the wire, so the same client can find its session again after a
    /// reconnect.
    ///
    /// The caller must not pass a `key_id` whose low byte is `b'{'`; ids
    /// taken from binary frames never are, since such a frame would have
    /// been read as a control message instead.
    pub fn with_key_id(dc_id: u8, user_id: Option<i64>, key_id: u64) -> Self {
        let id_bytes = key_id.to_le_bytes();
        debug_assert_ne!(id_bytes[0], b'{');
        let mut auth_key = vec![0u8; 256];
        getrandom::getrandom(&mut auth_key).expect("system randomness unavailable");
        auth_key[..8].copy_from_slice(&id_bytes);
        Self::with_material(dc_id, user_id, auth_key)
    }

    fn with_material(dc_id: u8, user_id: Option<i64>, auth_key: Vec<u8>) -> Self {
        let mut salt = [0u8; 8];
        getrandom::getrandom(&mut salt).expect("system randomness unavailable");

        Self {
            session_id: SessionId::generate(),
            auth_key,
            server_salt: i64::from_le_bytes(salt),
            seq_no: 0,
            last_msg_id: 0,
            dc_id,
            user_id,
            last_activity: now_millis(),
        }
    }

    /// The session's key material as a codec-ready [`AuthKey`].
    pub fn auth_key(&self) -> AuthKey {
        AuthKey::from_slice(&self.auth_key).expect("stored auth key is always 256 bytes")
    }

    /// The 8-byte wire identifier of this session's key, as a u64.
    pub fn auth_key_id(&self) -> u64 {
        u64::from_le_bytes(self.auth_key[..8].try_into().unwrap())
    }

    /// Milliseconds since the last recorded activity.
    pub fn idle_millis(&self) -> u64 {
        now_millis().saturating_sub(self.last_activity)
    }

    /// Refresh the activity timestamp.
    pub fn touch(&mut self) {
        self.last_activity = now_millis();
    }
}

impl std::fmt::Debug for Session {
    // Key material is deliberately absent.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id.to_hex())
            .field("dc_id", &self.dc_id)
            .field("user_id", &self.user_id)
            .field("seq_no", &self.seq_no)
            .finish_non_exhaustive()
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
