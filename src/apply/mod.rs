//! Apply engine: generate → write → validate → activate, with snapshot
//! rollback when anything past the write fails.

mod snapshots;

pub use snapshots::{atomic_write, SnapshotError, SnapshotMeta, SnapshotStore};

use crate::config::Config;
use crate::genconf::{self, GenerateError, GeneratorInputs};
use crate::metrics::Metrics;
use crate::runtime::{RuntimeError, RuntimeHandle, RuntimeInspector};
use crate::store::{Store, StoreError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// How the new config is activated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApplyMethod {
    /// Reload signal; existing connections survive (best-effort).
    Hot,
    /// Full restart of the detected runtime.
    Restart,
    /// Write and validate only.
    None,
}

/// Errors from the apply pipeline, tagged with the failing phase.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error(transparent)]
    Generate(#[from] GenerateError),

    #[error(transparent)]
    Snapshot(#[from] SnapshotError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("config write failed: {0}")]
    Write(#[from] std::io::Error),

    #[error("template unreadable: {0}")]
    Template(String),

    #[error("validation failed: {detail}")]
    Validate { detail: String },

    #[error("apply failed: {detail}")]
    Apply { detail: String },

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("apply cancelled")]
    Cancelled,
}

impl ApplyError {
    /// Short machine-readable kind for user-visible envelopes; the HTTP
    /// mapping is the collaborator's concern.
    pub fn code(&self) -> &'static str {
        match self {
            ApplyError::Generate(_) => "GENERATE_ERROR",
            ApplyError::Snapshot(_) => "SNAPSHOT_ERROR",
            ApplyError::Store(_) => "STORE_ERROR",
            ApplyError::Write(_) | ApplyError::Template(_) => "IO_ERROR",
            ApplyError::Validate { .. } => "VALIDATION_ERROR",
            ApplyError::Apply { .. } | ApplyError::Runtime(_) => "APPLY_ERROR",
            ApplyError::Cancelled => "CANCELLED",
        }
    }
}

/// Result of a completed apply.
#[derive(Debug, Clone)]
pub struct ApplyOutcome {
    pub requested: ApplyMethod,
    pub effective: ApplyMethod,
    pub fallback_used: bool,
    pub snapshot_id: Option<String>,
    pub conf_dir: Option<PathBuf>,
}

/// Owns the on-disk config file and the snapshot directory. All writes —
/// applies and rollbacks alike — serialize through one internal lock.
pub struct ApplyEngine {
    store: Arc<dyn Store>,
    inspector: Arc<RuntimeInspector>,
    snapshots: SnapshotStore,
    config: Config,
    metrics: Option<Arc<Metrics>>,
    write_lock: tokio::sync::Mutex<()>,
}

impl ApplyEngine {
    pub async fn new(
        store: Arc<dyn Store>,
        inspector: Arc<RuntimeInspector>,
        config: Config,
        metrics: Option<Arc<Metrics>>,
    ) -> Result<Self, ApplyError> {
        let snapshots = SnapshotStore::open(
            config.snapshots.dir.clone(),
            config.snapshots.retention_clamped(),
        )
        .await?;
        Ok(Self {
            store,
            inspector,
            snapshots,
            config,
            metrics,
            write_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn snapshots(&self) -> &SnapshotStore {
        &self.snapshots
    }

    async fn read_current(&self) -> Option<Vec<u8>> {
        tokio::fs::read(&self.config.data_plane.config_path)
            .await
            .ok()
    }

    async fn read_template(&self) -> Result<Option<serde_json::Value>, ApplyError> {
        let Some(path) = &self.config.data_plane.template_path else {
            return Ok(None);
        };
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| ApplyError::Template(format!("{}: {e}", path.display())))?;
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| ApplyError::Template(format!("{}: {e}", path.display())))?;
        Ok(Some(value))
    }

    /// Reconcile the domain model onto disk and into the running data
    /// plane. See the method-by-method failure policy in the error type.
    pub async fn apply(
        &self,
        method: ApplyMethod,
        create_snapshot: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ApplyError> {
        let _guard = self.write_lock.lock().await;
        let result = self.apply_locked(method, create_snapshot, cancel).await;
        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "ok" } else { "error" };
            metrics.apply_total.with_label_values(&[label]).inc();
        }
        result
    }

    async fn apply_locked(
        &self,
        method: ApplyMethod,
        create_snapshot: bool,
        cancel: &CancellationToken,
    ) -> Result<ApplyOutcome, ApplyError> {
        let config_path = &self.config.data_plane.config_path;

        // 1. Current on-disk config (None on first apply).
        let previous = self.read_current().await;

        // 2. Snapshot it before anything changes.
        let snapshot_id = match (&previous, create_snapshot) {
            (Some(bytes), true) => Some(
                self.snapshots
                    .save("before-apply", bytes, config_path)
                    .await?
                    .id,
            ),
            _ => None,
        };

        // 3. Generate and write atomically.
        let domain = self.store.domain_snapshot().await?;
        let template = self.read_template().await?;
        let generated = genconf::generate(&GeneratorInputs::from_config(
            &domain,
            &self.config,
            template.as_ref(),
            chrono::Utc::now(),
        ))?;
        let rendered = generated.render()?;

        if let Some(parent) = config_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        atomic_write(config_path, rendered.as_bytes()).await?;

        let conf_dir = match &self.config.data_plane.fragment_dir {
            Some(dir) => {
                tokio::fs::create_dir_all(dir).await?;
                for (name, body) in generated.fragments()? {
                    atomic_write(&dir.join(name), body.as_bytes()).await?;
                }
                Some(dir.clone())
            }
            None => None,
        };

        if cancel.is_cancelled() {
            self.rollback_files(&previous).await;
            return Err(ApplyError::Cancelled);
        }

        // 4. Validate inside the active runtime. A validation failure
        // restores the previous bytes and leaves the runtime untouched.
        let handle = self.inspector.handle().await;
        let outcome = handle.test(config_path).await?;
        if !outcome.ok {
            warn!(detail = %outcome.detail, "generated config failed validation; restoring previous");
            self.rollback_files(&previous).await;
            return Err(ApplyError::Validate {
                detail: outcome.detail,
            });
        }

        // 5. Activate.
        let effective_request = match method {
            // Hot applies degrade to restart when hot reload is disabled.
            ApplyMethod::Hot if !self.config.data_plane.hot_reload => ApplyMethod::Restart,
            other => other,
        };

        let (effective, fallback_used) = match effective_request {
            ApplyMethod::None => (ApplyMethod::None, false),
            ApplyMethod::Hot => match self.activate_hot(&handle, cancel).await {
                Ok(()) => (ApplyMethod::Hot, false),
                Err(err) => {
                    warn!(error = %err, "hot reload unhealthy; falling back to restart");
                    match self.activate_restart(&handle, cancel).await {
                        Ok(()) => (ApplyMethod::Restart, true),
                        Err(err) => {
                            self.rollback_runtime(&previous, &handle, cancel).await;
                            return Err(err);
                        }
                    }
                }
            },
            ApplyMethod::Restart => match self.activate_restart(&handle, cancel).await {
                Ok(()) => (ApplyMethod::Restart, false),
                Err(err) => {
                    self.rollback_runtime(&previous, &handle, cancel).await;
                    return Err(err);
                }
            },
        };

        info!(
            requested = ?method,
            effective = ?effective,
            fallback_used,
            snapshot = snapshot_id.as_deref().unwrap_or("-"),
            "config applied"
        );

        Ok(ApplyOutcome {
            requested: method,
            effective,
            fallback_used,
            snapshot_id,
            conf_dir,
        })
    }

    async fn activate_hot(
        &self,
        handle: &RuntimeHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        handle.reload().await?;
        self.verify_running(cancel).await
    }

    async fn activate_restart(
        &self,
        handle: &RuntimeHandle,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        handle.restart().await?;
        self.verify_running(cancel).await
    }

    /// Bounded health poll through the inspector.
    pub async fn verify_running(&self, cancel: &CancellationToken) -> Result<(), ApplyError> {
        let retries = self.config.data_plane.verify_retries.max(1);
        let pause = self.config.data_plane.verify_pause;
        for attempt in 1..=retries {
            if self.inspector.inspect().await.running {
                return Ok(());
            }
            if attempt < retries {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(ApplyError::Cancelled),
                    _ = tokio::time::sleep(pause) => {}
                }
            }
        }
        Err(ApplyError::Apply {
            detail: format!("data plane not healthy after {retries} checks"),
        })
    }

    /// Restore the previous bytes only (validation failures).
    async fn rollback_files(&self, previous: &Option<Vec<u8>>) {
        if let Some(bytes) = previous {
            if let Err(err) =
                atomic_write(&self.config.data_plane.config_path, bytes).await
            {
                error!(error = %err, "rollback write failed");
            }
        }
    }

    /// Restore the previous bytes and restart the runtime (apply
    /// failures). Rollback failures are logged, never surfaced, so the
    /// original error stays visible.
    async fn rollback_runtime(
        &self,
        previous: &Option<Vec<u8>>,
        handle: &RuntimeHandle,
        cancel: &CancellationToken,
    ) {
        if previous.is_none() {
            return;
        }
        self.rollback_files(previous).await;
        if let Err(err) = handle.restart().await {
            error!(error = %err, "rollback restart failed");
            return;
        }
        if let Err(err) = self.verify_running(cancel).await {
            error!(error = %err, "data plane unhealthy after rollback");
        }
    }

    /// Restore a stored snapshot. The current config is snapshotted first
    /// under `before-rollback`, then the stored bytes are written and the
    /// runtime restarted.
    pub async fn rollback_to_snapshot(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), ApplyError> {
        let _guard = self.write_lock.lock().await;

        let bytes = self.snapshots.load(id).await?;
        let config_path = &self.config.data_plane.config_path;

        if let Some(current) = self.read_current().await {
            self.snapshots
                .save("before-rollback", &current, config_path)
                .await?;
        }

        atomic_write(config_path, &bytes).await?;
        let handle = self.inspector.handle().await;
        handle.restart().await?;
        self.verify_running(cancel).await?;
        info!(snapshot = id, "rolled back to snapshot");
        Ok(())
    }
}
