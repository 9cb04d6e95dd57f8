//! Fire-and-forget event sink.
//!
//! The bridge reports lifecycle and per-message events here. Sinks must not
//! fail the caller: `record` is infallible from the bridge's point of view,
//! and a sink that forwards to external infrastructure is expected to
//! swallow (at most log) its own delivery problems.

use std::net::IpAddr;

/// A single telemetry event.
#[derive(Clone, Debug)]
pub enum Event {
    ConnectionOpened { connection_id: u64, client_ip: IpAddr, country: Option<String> },
    ConnectionClosed { connection_id: u64 },
    ConnectionRejected { client_ip: IpAddr },
    FrameForwarded { connection_id: u64, dc_id: u8, bytes: usize },
    FrameDelivered { connection_id: u64, dc_id: u8, bytes: usize },
    UpstreamOpened { dc_id: u8 },
    UpstreamClosed { dc_id: u8 },
    Error { connection_id: Option<u64>, code: &'static str },
}

pub trait TelemetrySink: Send + Sync {
    fn record(&self, event: Event);
}

/// Discards everything.
pub struct NullSink;

impl TelemetrySink for NullSink {
    fn record(&self, _event: Event) {}
}

/// Emits every event as a structured tracing event.
pub struct TracingSink;

impl TelemetrySink for TracingSink {
    fn record(&self, event: Event) {
        match event {
            Event::ConnectionOpened { connection_id, client_ip, country } => {
                tracing::info!(connection_id, %client_ip, ?country, "connection opened");
            }
            Event::ConnectionClosed { connection_id } => {
                tracing::info!(connection_id, "connection closed");
            }
            Event::ConnectionRejected { client_ip } => {
                tracing::warn!(%client_ip, "connection rejected by abuse gate");
            }
            Event::FrameForwarded { connection_id, dc_id, bytes } => {
                tracing::debug!(connection_id, dc_id, bytes, "frame forwarded to dc");
            }
            Event::FrameDelivered { connection_id, dc_id, bytes } => {
                tracing::debug!(connection_id, dc_id, bytes, "frame delivered to client");
            }
            Event::UpstreamOpened { dc_id } => {
                tracing::info!(dc_id, "upstream connected");
            }
            Event::UpstreamClosed { dc_id } => {
                tracing::info!(dc_id, "upstream closed");
            }
            Event::Error { connection_id, code } => {
                tracing::warn!(?connection_id, code, "bridge error");
            }
        }
    }
}
