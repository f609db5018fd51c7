//! Filesystem-based checkpoint storage implementation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;

use crate::store::{CheckpointID, CheckpointStore, StoredCheckpoint};

/// Filesystem implementation of CheckpointStore trait.
///
/// Layout: `<dir>/<scope>/checkpoint_<database_type>_<phase>.json`. A newer
/// checkpoint for the same id replaces the file via write-then-rename, so a
/// crash mid-write leaves the previous checkpoint intact.
pub struct FilesystemStore {
    dir: PathBuf,
}

impl FilesystemStore {
    /// Create a new FilesystemStore with the given directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Get the directory path.
    pub fn dir(&self) -> &PathBuf {
        &self.dir
    }

    fn scope_dir(&self, scope: &str) -> PathBuf {
        self.dir.join(encode_component(scope))
    }

    fn path_for(&self, id: &CheckpointID) -> PathBuf {
        self.scope_dir(&id.scope).join(format!(
            "checkpoint_{}_{}.json",
            encode_component(&id.database_type),
            encode_component(&id.phase)
        ))
    }
}

/// Keep ASCII alphanumerics, `-` and `_`; percent-encode everything else so
/// distinct scopes never share a directory.
fn encode_component(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for b in s.bytes() {
        if b.is_ascii_alphanumeric() || b == b'-' || b == b'_' {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02X}"));
        }
    }
    out
}

#[async_trait]
impl CheckpointStore for FilesystemStore {
    async fn store_checkpoint(&self, id: &CheckpointID, checkpoint_data: String) -> Result<()> {
        let scope_dir = self.scope_dir(&id.scope);
        std::fs::create_dir_all(&scope_dir)
            .with_context(|| format!("Failed to create {}", scope_dir.display()))?;

        let stored = StoredCheckpoint::new(id, checkpoint_data);
        let filename = self.path_for(id);
        let tmp = filename.with_extension("json.tmp");

        std::fs::write(&tmp, serde_json::to_string_pretty(&stored)?)?;
        std::fs::rename(&tmp, &filename)?;
        tracing::debug!("Stored checkpoint to {}", filename.display());
        Ok(())
    }

    async fn read_checkpoint(&self, id: &CheckpointID) -> Result<Option<StoredCheckpoint>> {
        let path = self.path_for(id);
        if !path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn clear_scope(&self, scope: &str) -> Result<()> {
        let scope_dir = self.scope_dir(scope);
        if scope_dir.exists() {
            std::fs::remove_dir_all(&scope_dir)
                .with_context(|| format!("Failed to remove {}", scope_dir.display()))?;
            tracing::info!("Cleared checkpoints in {}", scope_dir.display());
        }
        Ok(())
    }
}
