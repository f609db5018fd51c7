//! In-process checkpoint storage.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Keeps checkpoints in memory for the lifetime of the process.
#[derive(Default)]
pub struct MemoryStore {
    checkpoints: Mutex<HashMap<CheckpointID, StoredCheckpoint>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.checkpoints.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.checkpoints.lock().await.is_empty()
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        let stored = StoredCheckpoint::new(id, checkpoint_data);
        self.checkpoints.lock().await.insert(id.clone(), stored);
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        Ok(self.checkpoints.lock().await.get(id).cloned())
    }

    async fn clear_scope(&self, scope: &str) -> Result<()> {
        self.checkpoints.lock().await.retain(|id, _| id.scope != scope);
        Ok(())
    }
}
