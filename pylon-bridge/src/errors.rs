//! Error taxonomy for the bridge.

use pylon_crypto::CodecError;
use pylon_session::StoreError;

/// Everything that can go wrong while handling a single message or
/// connection. None of these are fatal to the process; most are not even
/// fatal to the connection.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Malformed wire data — rejects the single frame, connection survives.
    #[error("invalid frame")]
    InvalidFrame,
    /// msg_key mismatch on decrypt; treated as tampering or corruption.
    #[error("frame integrity check failed")]
    Integrity,
    /// Codec precondition violated; logged as severe, should never happen.
    #[error("encryption failure: {0}")]
    Encryption(&'static str),
    /// No reachable upstream for the datacenter — retryable, fails only
    /// messages destined for that datacenter.
    #[error("no reachable upstream for dc {0}")]
    Connection(u8),
    /// Session store error (not found / expired / unavailable).
    #[error(transparent)]
    Store(#[from] StoreError),
    /// Socket-level failure; the connection itself is unusable.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CodecError> for BridgeError {
    fn from(e: CodecError) -> Self {
        match e {
            CodecError::InvalidFrame => Self::InvalidFrame,
            CodecError::Integrity => Self::Integrity,
            CodecError::Encryption(msg) => Self::Encryption(msg),
        }
    }
}

impl BridgeError {
    /// Stable machine-readable code used in error acknowledgements.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidFrame => "invalid_frame",
            Self::Integrity => "integrity_error",
            Self::Encryption(_) => "encryption_error",
            Self::Connection(_) => "connection_error",
            Self::Store(StoreError::NotFound) => "session_not_found",
            Self::Store(StoreError::Expired) => "session_expired",
            Self::Store(StoreError::Unavailable(_)) => "store_unavailable",
            Self::Io(_) => "io_error",
        }
    }
}
