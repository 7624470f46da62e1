//! Snapshot persistence for the per-chain datasets.

use crate::error::PersistenceError;
use crate::models::ChainDataset;
use async_trait::async_trait;
use log::{debug, info};
use std::path::{Path, PathBuf};

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Ok(None)` when no snapshot has been written yet.
    async fn load(&self) -> Result<Option<Vec<ChainDataset>>, PersistenceError>;

    /// Replace the stored snapshot. A failed save leaves the previous one intact.
    async fn save(&self, datasets: &[ChainDataset]) -> Result<(), PersistenceError>;
}

/// JSON file written through a temp file and an atomic rename.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_else(|| "snapshot".into());
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn io_error(&self, path: &Path, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io { path: path.to_path_buf(), source }
    }
}

#[async_trait]
impl SnapshotStore for JsonFileStore {
    async fn load(&self) -> Result<Option<Vec<ChainDataset>>, PersistenceError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!("No snapshot at {}, starting from defaults", self.path.display());
                return Ok(None);
            }
            Err(e) => return Err(self.io_error(&self.path, e)),
        };
        let datasets: Vec<ChainDataset> = serde_json::from_slice(&bytes).map_err(|source| {
            PersistenceError::Decode { path: self.path.clone(), source }
        })?;
        info!("Loaded snapshot with {} chain datasets from {}", datasets.len(), self.path.display());
        Ok(Some(datasets))
    }

    async fn save(&self, datasets: &[ChainDataset]) -> Result<(), PersistenceError> {
        let encoded = serde_json::to_vec(datasets)?;
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| self.io_error(parent, e))?;
        }
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &encoded)
            .await
            .map_err(|e| self.io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| self.io_error(&self.path, e))?;
        debug!("Saved snapshot ({} bytes) to {}", encoded.len(), self.path.display());
        Ok(())
    }
}
