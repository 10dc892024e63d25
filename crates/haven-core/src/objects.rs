use crate::error::CoreError;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Read side of the content-addressed object store. The queue never owns
/// object lifecycles; it only reads bytes to upload and pins what the
/// mailbox delivers.
#[async_trait]
pub trait ObjectSource: Send + Sync {
    async fn get(&self, cid: &str) -> Result<Vec<u8>, CoreError>;
    async fn pin(&self, cid: &str) -> Result<(), CoreError>;
}

#[derive(Clone, Default)]
pub struct MemoryObjects {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
    pinned: Arc<Mutex<HashSet<String>>>,
}

impl MemoryObjects {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, cid: &str, data: Vec<u8>) {
        self.entries.lock().await.insert(cid.to_string(), data);
    }

    pub async fn is_pinned(&self, cid: &str) -> bool {
        self.pinned.lock().await.contains(cid)
    }
}

#[async_trait]
impl ObjectSource for MemoryObjects {
    async fn get(&self, cid: &str) -> Result<Vec<u8>, CoreError> {
        self.entries
            .lock()
            .await
            .get(cid)
            .cloned()
            .ok_or(CoreError::NotFound)
    }

    async fn pin(&self, cid: &str) -> Result<(), CoreError> {
        self.pinned.lock().await.insert(cid.to_string());
        Ok(())
    }
}
