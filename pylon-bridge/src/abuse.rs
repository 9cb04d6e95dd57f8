//! Connection-permission gate.
//!
//! The bridge consults [`AbuseGate::allow`] before accepting a connection.
//! A gate *error* (as opposed to a refusal) fails open: degraded abuse
//! infrastructure must not turn into a denial of service against legitimate
//! traffic.

use std::net::IpAddr;
use std::time::{Duration, Instant};

use dashmap::DashMap;

/// The gate itself failed; the bridge treats this as "allow".
#[derive(Debug, thiserror::Error)]
#[error("abuse gate unavailable: {0}")]
pub struct GateError(pub String);

/// Decides whether a new connection from `client_ip` is permitted.
pub trait AbuseGate: Send + Sync {
    fn allow(&self, client_ip: IpAddr) -> Result<bool, GateError>;

    /// Charge a protocol violation (malformed or tampered frame) against
    /// `client_ip`. Fire-and-forget; gates that do not score ignore it.
    fn penalize(&self, _client_ip: IpAddr) {}
}

/// Permits everything. Useful default and test double.
pub struct PermitAll;

impl AbuseGate for PermitAll {
    fn allow(&self, _client_ip: IpAddr) -> Result<bool, GateError> {
        Ok(true)
    }
}

/// Fixed-window per-IP counter: at most `max_per_window` new connections per
/// IP within each window. Windows are aligned to the first request in them.
pub struct FixedWindow {
    max_per_window: u32,
    window: Duration,
    counters: DashMap<IpAddr, (Instant, u32)>,
}

impl FixedWindow {
    pub fn new(max_per_window: u32, window: Duration) -> Self {
        Self { max_per_window, window, counters: DashMap::new() }
    }
}

impl AbuseGate for FixedWindow {
    fn allow(&self, client_ip: IpAddr) -> Result<bool, GateError> {
        let now = Instant::now();
        let mut entry = self.counters.entry(client_ip).or_insert((now, 0));
        let (window_start, count) = *entry;
        if now.duration_since(window_start) >= self.window {
            *entry = (now, 1);
            return Ok(true);
        }
        if count >= self.max_per_window {
            return Ok(false);
        }
        entry.1 = count + 1;
        Ok(true)
    }

    /// A violation spends one unit of the same per-window budget a new
    /// connection would, so abusive frames shrink what the IP can open next.
    fn penalize(&self, client_ip: IpAddr) {
        let now = Instant::now();
        let mut entry = self.counters.entry(client_ip).or_insert((now, 0));
        if now.duration_since(entry.0) >= self.window {
            *entry = (now, 1);
        } else {
            entry.1 = entry.1.saturating_add(1);
        }
    }
}
