//! Session state for the pylon proxy.
//!
//! This crate owns:
//! * [`Session`] — the canonical per-session record (key material, salt,
//!   sequence counters, activity timestamp)
//! * [`SessionStore`] — create/get/update/delete/validate/sweep over a
//!   pluggable [`KvStore`] with per-record TTLs
//! * [`SessionApi`] — a thin create/validate/delete/info surface keyed by
//!   hex session ids

#![deny(unsafe_code)]

pub mod api;
pub mod kv;
mod record;
mod store;

pub use api::{SessionApi, SessionInfo};
pub use kv::{KvError, KvStore, MemoryKv};
pub use record::{Session, SessionId};
pub use store::{SessionStore, StoreError};
