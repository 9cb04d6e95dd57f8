//! 256-byte authorization key shared between a session and its datacenter.

/// A session authorization key (256 bytes) plus its pre-computed identifier.
///
/// The key material is treated as already negotiated — the proxy never runs
/// a DH exchange. The identifier carried on the wire is the first 8 bytes of
/// the key, which lets the bridge route a frame without attempting a decrypt.
#[derive(Clone)]
pub struct AuthKey {
    pub(crate) data: [u8; 256],
    key_id: [u8; 8],
}

impl AuthKey {
    /// Construct from raw 256-byte key material.
    pub fn from_bytes(data: [u8; 256]) -> Self {
        let mut key_id = [0u8; 8];
        key_id.copy_from_slice(&data[..8]);
        Self { data, key_id }
    }

    /// Construct from a slice, rejecting anything that is not 256 bytes.
    pub fn from_slice(data: &[u8]) -> Option<Self> {
        let data: [u8; 256] = data.try_into().ok()?;
        Some(Self::from_bytes(data))
    }

    /// Return the raw 256-byte representation.
    pub fn to_bytes(&self) -> [u8; 256] {
        self.data
    }

    /// The 8-byte wire identifier (first 8 bytes of the key).
    pub fn key_id(&self) -> [u8; 8] {
        self.key_id
    }
}

impl std::fmt::Debug for AuthKey {
    // Never print key material.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AuthKey(id={})", u64::from_le_bytes(self.key_id))
    }
}

impl PartialEq for AuthKey {
    fn eq(&self, other: &Self) -> bool {
        self.key_id == other.key_id
    }
}
