//! Transparent relay between MTProto clients and Telegram datacenters.
//!
//! The bridge accepts client sockets, binds each to a [`pylon_session`]
//! record on the first valid frame, and forwards encrypted frames verbatim
//! to the right datacenter over a pool of shared upstream sockets (at most
//! one per datacenter). Replies are routed back to the single connection
//! whose key id matches; nothing is ever broadcast.
//!
//! A JSON control channel (`ping` / `get_stats` / `get_session_info`) rides
//! the same socket: any frame starting with `{` bypasses the relay path.

#![deny(unsafe_code)]

mod abuse;
mod bridge;
mod control;
mod errors;
pub mod framing;
mod registry;
mod telemetry;
mod upstream;

pub use abuse::{AbuseGate, FixedWindow, GateError, PermitAll};
pub use bridge::{Bridge, BridgeConfig, BridgeStats, ConnState};
pub use control::{ControlReply, ControlRequest};
pub use errors::BridgeError;
pub use registry::DcRegistry;
pub use telemetry::{Event, NullSink, TelemetrySink, TracingSink};
pub use upstream::{TcpConnector, UpstreamConnector};
