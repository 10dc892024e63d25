use crate::error::CoreError;
use haven_store::Datastore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Tokens authorizing this node against one cafe. One row per cafe; the
/// key encodes the cafe id, so a re-registration overwrites in place.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Session {
    pub cafe_id: String,
    pub access: String,
    pub refresh: String,
    pub expiry_ms: u64,
}

impl Session {
    pub fn is_expired(&self, now_ms: u64, skew_ms: u64) -> bool {
        now_ms.saturating_add(skew_ms) >= self.expiry_ms
    }
}

#[derive(Clone)]
pub struct SessionStore {
    store: Arc<Mutex<Datastore>>,
}

impl SessionStore {
    pub fn new(store: Arc<Mutex<Datastore>>) -> Self {
        Self { store }
    }

    pub async fn get(&self, cafe_id: &str) -> Result<Option<Session>, CoreError> {
        let guard = self.store.lock().await;
        let Some(bytes) = guard.get(&Self::key(cafe_id)) else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn put(&self, session: &Session) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(session).map_err(|_| CoreError::Storage)?;
        let mut guard = self.store.lock().await;
        guard
            .put(&Self::key(&session.cafe_id), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn delete(&self, cafe_id: &str) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        guard
            .delete(&Self::key(cafe_id))
            .map_err(|_| CoreError::Storage)
    }

    pub async fn list(&self) -> Result<Vec<Session>, CoreError> {
        let guard = self.store.lock().await;
        let mut sessions = Vec::new();
        for (_, bytes) in guard.scan_prefix("session:") {
            let session = serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
            sessions.push(session);
        }
        Ok(sessions)
    }

    fn key(cafe_id: &str) -> String {
        format!("session:{}", cafe_id)
    }
}

/// Challenge nonce issued for an account address, held between the
/// challenge and registration round trips.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NonceRow {
    pub value: String,
    pub address: String,
    pub date_ms: u64,
}

#[derive(Clone)]
pub struct NonceStore {
    store: Arc<Mutex<Datastore>>,
}

impl NonceStore {
    pub fn new(store: Arc<Mutex<Datastore>>) -> Self {
        Self { store }
    }

    pub async fn add(&self, row: &NonceRow) -> Result<(), CoreError> {
        let bytes = serde_json::to_vec(row).map_err(|_| CoreError::Storage)?;
        let mut guard = self.store.lock().await;
        guard
            .put(&Self::key(&row.value), &bytes)
            .map_err(|_| CoreError::Storage)
    }

    pub async fn consume(&self, value: &str) -> Result<Option<NonceRow>, CoreError> {
        let mut guard = self.store.lock().await;
        let Some(bytes) = guard.get(&Self::key(value)) else {
            return Ok(None);
        };
        let row = serde_json::from_slice(&bytes).map_err(|_| CoreError::Storage)?;
        guard
            .delete(&Self::key(value))
            .map_err(|_| CoreError::Storage)?;
        Ok(Some(row))
    }

    pub async fn purge_expired(&self, now_ms: u64, ttl_ms: u64) -> Result<(), CoreError> {
        let mut guard = self.store.lock().await;
        let expired: Vec<String> = guard
            .scan_prefix("nonce:")
            .into_iter()
            .filter_map(|(key, bytes)| {
                let row: NonceRow = serde_json::from_slice(&bytes).ok()?;
                if now_ms.saturating_sub(row.date_ms) > ttl_ms {
                    Some(key)
                } else {
                    None
                }
            })
            .collect();
        for key in expired {
            guard.delete(&key).map_err(|_| CoreError::Storage)?;
        }
        Ok(())
    }

    fn key(value: &str) -> String {
        format!("nonce:{}", value)
    }
}
