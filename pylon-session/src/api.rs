//! Thin session API surface — delegates everything to [`SessionStore`].

use std::sync::Arc;

use serde::Serialize;

use crate::record::SessionId;
use crate::store::{SessionStore, StoreError};

/// What a session looks like from the outside. Key material never appears.
#[derive(Clone, Debug, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub dc_id: u8,
    pub user_id: Option<i64>,
    pub seq_no: u32,
    pub last_activity: u64,
}

/// Create/validate/delete/info actions keyed by hex session id.
#[derive(Clone)]
pub struct SessionApi {
    store: Arc<SessionStore>,
}

impl SessionApi {
    pub fn new(store: Arc<SessionStore>) -> Self {
        Self { store }
    }

    fn parse(id: &str) -> Result<SessionId, StoreError> {
        SessionId::from_hex(id).ok_or(StoreError::NotFound)
    }

    pub fn create(&self, dc_id: u8, user_id: Option<i64>) -> Result<SessionInfo, StoreError> {
        let session = self.store.create(dc_id, user_id)?;
        Ok(SessionInfo {
            session_id: session.session_id.to_hex(),
            dc_id: session.dc_id,
            user_id: session.user_id,
            seq_no: session.seq_no,
            last_activity: session.last_activity,
        })
    }

    pub fn validate(&self, id: &str) -> Result<bool, StoreError> {
        match Self::parse(id) {
            Ok(id) => self.store.validate(id),
            Err(_) => Ok(false),
        }
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        self.store.delete(Self::parse(id)?)
    }

    pub fn info(&self, id: &str) -> Result<SessionInfo, StoreError> {
        let session = self.store.get(Self::parse(id)?)?;
        Ok(SessionInfo {
            session_id: session.session_id.to_hex(),
            dc_id: session.dc_id,
            user_id: session.user_id,
            seq_no: session.seq_no,
            last_activity: session.last_activity,
        })
    }
}
