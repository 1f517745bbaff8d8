//! Snapshot Store
//!
//! Reads and writes the registry snapshot file. Writes go to a sibling
//! temporary file which is synced and then renamed over the snapshot, so a
//! crash leaves either the old or the new snapshot on disk.

use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

use crate::error::Result;
use crate::snapshot::RegistrySnapshot;

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    /// Load the persisted snapshot. Returns `None` when no file exists or
    /// when its content cannot be parsed.
    pub async fn load(&self) -> Result<Option<RegistrySnapshot>> {
        if !self.path.exists() {
            debug!("No registry snapshot at {}", self.path.display());
            return Ok(None);
        }

        let content = fs::read_to_string(&self.path).await?;
        match serde_json::from_str(&content) {
            Ok(snapshot) => Ok(Some(snapshot)),
            Err(e) => {
                warn!(
                    path = %self.path.display(),
                    error = %e,
                    "Registry snapshot is unreadable, ignoring it"
                );
                Ok(None)
            }
        }
    }

    pub async fn save(&self, snapshot: &RegistrySnapshot) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            if !dir.as_os_str().is_empty() && !dir.exists() {
                fs::create_dir_all(dir).await?;
            }
        }

        let content = serde_json::to_vec_pretty(snapshot)?;
        let temp = self.temp_path();

        let mut file = fs::File::create(&temp).await?;
        file.write_all(&content).await?;
        file.sync_all().await?;
        drop(file);

        fs::rename(&temp, &self.path).await?;
        debug!(path = %self.path.display(), bytes = content.len(), "Saved registry snapshot");
        Ok(())
    }
}
