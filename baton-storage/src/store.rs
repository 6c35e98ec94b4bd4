//! JSON-file snapshot store implementation

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use baton_core::snapshot::{OrchestratorSnapshot, SnapshotStore};
use tokio::fs;
use tracing::debug;

use crate::{Error, Result};

/// Snapshot store backed by a single JSON file.
///
/// Writes go through a sibling temp file followed by a rename, so a crash
/// mid-write leaves the previous snapshot intact instead of a torn file.
#[derive(Debug, Clone)]
pub struct JsonSnapshotStore {
    path: PathBuf,
}

impl JsonSnapshotStore {
    /// Create a store persisting to the given file path
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    /// Path of the snapshot file
    pub fn path(&self) -> &Path {
        &self.path
    }

    // Same directory as the target, so the rename stays on one filesystem.
    fn temp_path(&self) -> PathBuf {
        let mut raw: OsString = self.path.clone().into_os_string();
        raw.push(".tmp");
        PathBuf::from(raw)
    }

    async fn write_snapshot(&self, snapshot: &OrchestratorSnapshot) -> Result<()> {
        let body = serde_json::to_vec_pretty(snapshot)?;
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).await?;
            }
        }
        let temp = self.temp_path();
        fs::write(&temp, &body).await?;
        fs::rename(&temp, &self.path).await?;
        debug!(
            path = %self.path.display(),
            bytes = body.len(),
            agents = snapshot.agents.len(),
            tasks = snapshot.tasks.len(),
            "Snapshot written"
        );
        Ok(())
    }

    async fn read_snapshot(&self) -> Result<Option<OrchestratorSnapshot>> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "No snapshot on disk, fresh start");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        let snapshot: OrchestratorSnapshot = serde_json::from_str(&raw)
            .map_err(|e| Error::Corrupted(format!("snapshot at {}: {}", self.path.display(), e)))?;
        debug!(
            path = %self.path.display(),
            captured_at = %snapshot.captured_at,
            "Snapshot loaded"
        );
        Ok(Some(snapshot))
    }
}

#[async_trait]
impl SnapshotStore for JsonSnapshotStore {
    async fn save(&self, snapshot: &OrchestratorSnapshot) -> baton_core::Result<()> {
        self.write_snapshot(snapshot).await.map_err(Into::into)
    }

    async fn load(&self) -> baton_core::Result<Option<OrchestratorSnapshot>> {
        self.read_snapshot().await.map_err(Into::into)
    }
}
