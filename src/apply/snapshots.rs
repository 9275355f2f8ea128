//! Config snapshot store.
//!
//! Every snapshot is a pair of files under one directory:
//! `<id>.config.json` (raw config bytes) and `<id>.meta.json` (metadata).
//! Ids are ISO timestamps with colons flattened to dashes plus a short
//! random suffix, so lexicographic order is creation order.

use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, warn};

/// Errors from the snapshot store.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot not found: {0}")]
    NotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("metadata error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("snapshot store error: {0}")]
    Other(String),
}

/// Sidecar metadata persisted next to the config bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub reason: String,
    /// Canonical path the bytes were captured from.
    pub config_path: PathBuf,
}

/// Atomically write data to a file using write-to-temp + fsync + rename.
pub async fn atomic_write(path: &Path, data: &[u8]) -> Result<(), std::io::Error> {
    let parent = path
        .parent()
        .ok_or_else(|| {
            std::io::Error::other("cannot atomic-write to a path with no parent")
        })?
        .to_path_buf();
    let path = path.to_path_buf();
    let data = data.to_vec();

    tokio::task::spawn_blocking(move || {
        let mut tmp = NamedTempFile::new_in(&parent)?;
        tmp.write_all(&data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(())
    })
    .await
    .map_err(|e| std::io::Error::other(format!("spawn_blocking join failed: {e}")))?
}

/// Retention-bounded snapshot directory.
pub struct SnapshotStore {
    dir: PathBuf,
    retention: usize,
}

impl SnapshotStore {
    /// Open (and create) the snapshot directory.
    pub async fn open(dir: PathBuf, retention: usize) -> Result<Self, SnapshotError> {
        fs::create_dir_all(&dir).await?;
        Ok(Self {
            dir,
            retention: retention.clamp(1, 500),
        })
    }

    fn new_id(now: DateTime<Utc>) -> String {
        let stamp = now.format("%Y-%m-%dT%H-%M-%S");
        let mut suffix = [0u8; 3];
        rand::thread_rng().fill_bytes(&mut suffix);
        format!("{stamp}-{}", hex::encode(suffix))
    }

    fn config_file(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.config.json"))
    }

    fn meta_file(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{id}.meta.json"))
    }

    /// Persist a snapshot, then prune to the retention bound (best-effort).
    pub async fn save(
        &self,
        reason: &str,
        config_bytes: &[u8],
        config_path: &Path,
    ) -> Result<SnapshotMeta, SnapshotError> {
        let now = Utc::now();
        let meta = SnapshotMeta {
            id: Self::new_id(now),
            created_at: now,
            reason: reason.to_string(),
            config_path: config_path.to_path_buf(),
        };

        atomic_write(&self.config_file(&meta.id), config_bytes).await?;
        let meta_bytes = serde_json::to_vec_pretty(&meta)?;
        atomic_write(&self.meta_file(&meta.id), &meta_bytes).await?;
        debug!(id = %meta.id, reason, "snapshot saved");

        if let Err(err) = self.prune().await {
            warn!(error = %err, "snapshot pruning failed");
        }
        Ok(meta)
    }

    /// All snapshots, newest first.
    pub async fn list(&self) -> Result<Vec<SnapshotMeta>, SnapshotError> {
        let mut metas = Vec::new();
        let mut entries = fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if let Some(id) = name.strip_suffix(".meta.json") {
                match fs::read(entry.path()).await {
                    Ok(bytes) => match serde_json::from_slice::<SnapshotMeta>(&bytes) {
                        Ok(meta) => metas.push(meta),
                        Err(err) => warn!(id, error = %err, "unreadable snapshot metadata"),
                    },
                    Err(err) => warn!(id, error = %err, "unreadable snapshot metadata file"),
                }
            }
        }
        metas.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(metas)
    }

    /// Raw config bytes of one snapshot.
    pub async fn load(&self, id: &str) -> Result<Vec<u8>, SnapshotError> {
        let path = self.config_file(id);
        fs::read(&path)
            .await
            .map_err(|_| SnapshotError::NotFound(id.to_string()))
    }

    /// Newest snapshot metadata, if any.
    pub async fn newest(&self) -> Result<Option<SnapshotMeta>, SnapshotError> {
        Ok(self.list().await?.into_iter().next())
    }

    /// Drop snapshots beyond the retention bound, oldest first. Failure to
    /// delete an individual pair is logged, not fatal.
    pub async fn prune(&self) -> Result<usize, SnapshotError> {
        let metas = self.list().await?;
        let mut removed = 0;
        for meta in metas.iter().skip(self.retention) {
            let config = self.config_file(&meta.id);
            let meta_path = self.meta_file(&meta.id);
            if let Err(err) = fs::remove_file(&config).await {
                warn!(id = %meta.id, error = %err, "failed to prune snapshot config");
                continue;
            }
            if let Err(err) = fs::remove_file(&meta_path).await {
                warn!(id = %meta.id, error = %err, "failed to prune snapshot metadata");
                continue;
            }
            removed += 1;
        }
        Ok(removed)
    }
}
