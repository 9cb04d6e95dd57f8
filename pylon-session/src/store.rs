//! The session store — canonical owner of all session records.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use pylon_crypto::MessageIdGen;

use crate::kv::{KvError, KvStore};
use crate::record::{Session, SessionId};

/// Attempts per store operation before surfacing `Unavailable`.
const MAX_RETRIES: u32 = 3;

/// Errors surfaced by [`SessionStore`] operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record under that id; the caller must establish a new session.
    #[error("session not found")]
    NotFound,
    /// The record exists but sat idle past the configured timeout; it has
    /// been removed.
    #[error("session expired")]
    Expired,
    /// The persistence layer failed after bounded retries.
    #[error(transparent)]
    Unavailable(#[from] KvError),
}

/// Owns session records keyed by id, plus a user → session-ids index.
///
/// Records are persisted with a TTL of twice the idle timeout so that a
/// record cannot vanish out from under an in-flight connection before the
/// idle check itself fires.
pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    idle_timeout: Duration,
    /// Per-session update serialization so a seq_no bump is never lost.
    locks: DashMap<SessionId, Arc<std::sync::Mutex<()>>>,
}

fn session_key(id: SessionId) -> String {
    format!("session/{id}")
}

fn user_key(user_id: i64, id: SessionId) -> String {
    format!("user/{user_id}/{id}")
}

fn key_id_key(key_id: u64) -> String {
    format!("key/{}", hex::encode(key_id.to_le_bytes()))
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, idle_timeout: Duration) -> Self {
        tracing::info!(backend = kv.name(), ?idle_timeout, "session store ready");
        Self { kv, idle_timeout, locks: DashMap::new() }
    }

    /// The configured idle timeout.
    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    fn record_ttl(&self) -> Duration {
        self.idle_timeout * 2
    }

    fn with_retry<T>(&self, mut op: impl FnMut() -> Result<T, KvError>) -> Result<T, StoreError> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if attempt + 1 < MAX_RETRIES => {
                    attempt += 1;
                    tracing::warn!(attempt, error = %e, "store operation failed, retrying");
                }
                Err(e) => return Err(StoreError::Unavailable(e)),
            }
        }
    }

    /// Write the record plus the `auth_key_id → session_id` index row; both
    /// carry the same TTL so the index cannot outlive the record.
    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(session)
            .map_err(|e| StoreError::Unavailable(KvError(e.to_string())))?;
        let ttl = self.record_ttl();
        self.with_retry(|| self.kv.put(&session_key(session.session_id), encoded.clone(), ttl))?;
        let id_hex = session.session_id.to_hex().into_bytes();
        self.with_retry(|| self.kv.put(&key_id_key(session.auth_key_id()), id_hex.clone(), ttl))
    }

    /// Raw fetch and decode, without the idle check.
    fn load(&self, id: SessionId) -> Result<Session, StoreError> {
        let raw = self
            .with_retry(|| self.kv.get(&session_key(id)))?
            .ok_or(StoreError::NotFound)?;
        serde_json::from_slice(&raw).map_err(|e| StoreError::Unavailable(KvError(e.to_string())))
    }

    fn is_idle_expired(&self, session: &Session) -> bool {
        u128::from(session.idle_millis()) > self.idle_timeout.as_millis()
    }

    fn update_lock(&self, id: SessionId) -> Arc<std::sync::Mutex<()>> {
        self.locks.entry(id).or_default().clone()
    }

    // ─── Operations ───────────────────────────────────────────────────────────

    /// Allocate a session with fresh key material, persist and index it.
    pub fn create(&self, dc_id: u8, user_id: Option<i64>) -> Result<Session, StoreError> {
        self.insert(Session::new(dc_id, user_id))
    }

    /// Allocate a session tied to a wire key identifier, so later frames
    /// carrying that id can find it through [`SessionStore::find_by_key_id`].
    pub fn create_with_key_id(
        &self,
        dc_id: u8,
        user_id: Option<i64>,
        key_id: u64,
    ) -> Result<Session, StoreError> {
        self.insert(Session::with_key_id(dc_id, user_id, key_id))
    }

    fn insert(&self, session: Session) -> Result<Session, StoreError> {
        self.persist(&session)?;
        if let Some(uid) = session.user_id {
            self.with_retry(|| {
                self.kv.put(&user_key(uid, session.session_id), Vec::new(), self.record_ttl())
            })?;
        }
        tracing::debug!(session = %session.session_id, dc_id = session.dc_id, "session created");
        Ok(session)
    }

    /// Fetch a session. An idle-expired record is deleted and reported as
    /// [`StoreError::Expired`].
    pub fn get(&self, id: SessionId) -> Result<Session, StoreError> {
        let session = self.load(id)?;
        if self.is_idle_expired(&session) {
            self.delete(id)?;
            return Err(StoreError::Expired);
        }
        Ok(session)
    }

    /// Refresh the activity timestamp and persist the record.
    pub fn update(&self, session: &mut Session) -> Result<(), StoreError> {
        session.touch();
        self.persist(session)
    }

    /// The session owning `key_id` (the 8-byte wire identifier), resolved
    /// through the key index. `NotFound` if no live session carries it.
    pub fn find_by_key_id(&self, key_id: u64) -> Result<Session, StoreError> {
        let raw = self
            .with_retry(|| self.kv.get(&key_id_key(key_id)))?
            .ok_or(StoreError::NotFound)?;
        let id = std::str::from_utf8(&raw)
            .ok()
            .and_then(SessionId::from_hex)
            .ok_or(StoreError::NotFound)?;
        self.get(id)
    }

    /// Remove the record and its index entries. Idempotent.
    pub fn delete(&self, id: SessionId) -> Result<(), StoreError> {
        if let Ok(session) = self.load(id) {
            if let Some(uid) = session.user_id {
                self.with_retry(|| self.kv.delete(&user_key(uid, id)))?;
            }
            self.with_retry(|| self.kv.delete(&key_id_key(session.auth_key_id())))?;
        }
        self.with_retry(|| self.kv.delete(&session_key(id)))?;
        self.locks.remove(&id);
        Ok(())
    }

    /// `true` iff the session exists and is not idle-expired; an expired
    /// record is deleted as a side effect.
    pub fn validate(&self, id: SessionId) -> Result<bool, StoreError> {
        match self.get(id) {
            Ok(_) => Ok(true),
            Err(StoreError::NotFound | StoreError::Expired) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Record one successful exchange: advance the sequence counter, issue
    /// the next message id, refresh activity. Serialized per session so
    /// concurrent callers never lose a bump. Returns the new sequence number.
    pub fn touch(&self, id: SessionId) -> Result<u32, StoreError> {
        let lock = self.update_lock(id);
        let _guard = lock.lock().expect("session lock poisoned");

        let mut session = self.load(id)?;
        if self.is_idle_expired(&session) {
            drop(_guard);
            self.delete(id)?;
            return Err(StoreError::Expired);
        }
        session.seq_no += 1;
        session.last_msg_id = MessageIdGen::resume(session.last_msg_id).next();
        session.touch();
        self.persist(&session)?;
        Ok(session.seq_no)
    }

    /// All live sessions belonging to `user_id`.
    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Session>, StoreError> {
        let prefix = format!("user/{user_id}/");
        let keys = self.with_retry(|| self.kv.list(&prefix))?;
        let mut sessions = Vec::new();
        for key in keys {
            let Some(id) = key.strip_prefix(&prefix).and_then(SessionId::from_hex) else {
                continue;
            };
            match self.get(id) {
                Ok(s) => sessions.push(s),
                Err(StoreError::NotFound | StoreError::Expired) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(sessions)
    }

    /// Scan all records and delete those idle past the timeout. Returns the
    /// number removed. Intended for a periodic task, not the request path.
    ///
    /// Also prunes update locks whose record vanished through the kv TTL
    /// without going through `delete`, so the lock map cannot grow without
    /// bound.
    pub fn sweep_expired(&self) -> Result<usize, StoreError> {
        let keys = self.with_retry(|| self.kv.list("session/"))?;
        let mut removed = 0;
        let mut live = std::collections::HashSet::new();
        for key in keys {
            let Some(id) = key.strip_prefix("session/").and_then(SessionId::from_hex) else {
                continue;
            };
            match self.load(id) {
                Ok(session) if self.is_idle_expired(&session) => {
                    self.delete(id)?;
                    removed += 1;
                }
                Ok(_) => {
                    live.insert(id);
                }
                Err(StoreError::NotFound) => {}
                Err(e) => return Err(e),
            }
        }

        let stale: Vec<SessionId> =
            self.locks.iter().map(|e| *e.key()).filter(|id| !live.contains(id)).collect();
        for id in stale {
            // Re-check so a session created after the scan keeps its lock.
            if self.load(id).is_err() {
                self.locks.remove(&id);
            }
        }

        if removed > 0 {
            tracing::info!(removed, "swept expired sessions");
        }
        Ok(removed)
    }

    /// Number of live session records.
    pub fn count(&self) -> Result<usize, StoreError> {
        Ok(self.with_retry(|| self.kv.list("session/"))?.len())
    }
}
