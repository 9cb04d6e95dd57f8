//! JSON control channel.
//!
//! Control messages ride the same socket as binary frames but start with
//! `{`. They bypass the codec and the session state entirely and are
//! answered synchronously by the bridge.

use pylon_session::SessionInfo;
use serde::{Deserialize, Serialize};

use crate::errors::BridgeError;

/// A request from the client's control channel.
#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
    Ping,
    GetStats,
    GetSessionInfo { session_id: String },
    /// Any unrecognized `type`, kept for forward compatibility.
    #[serde(other)]
    Unknown,
}

/// A reply on the control channel (also used for error acknowledgements on
/// failed binary frames).
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlReply {
    Pong,
    Stats {
        connections: usize,
        upstreams: usize,
        sessions: usize,
    },
    SessionInfo {
        session: SessionInfo,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

impl ControlReply {
    /// Structured acknowledgement for a failed operation.
    pub fn error(err: &BridgeError) -> Self {
        Self::Error { code: err.code(), message: err.to_string() }
    }

    /// Serialize for the wire.
    pub fn to_bytes(&self) -> Vec<u8> {
        serde_json::to_vec(self).expect("control replies always serialize")
    }
}
