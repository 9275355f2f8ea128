//! Update coordinator: locked canary/full upgrades of the data plane with
//! backup tags, preflight gating, health verification, rollback, and an
//! append-only history.

mod preflight;

pub use preflight::{PreflightCheck, PreflightReport};

use crate::apply::atomic_write;
use crate::config::{Config, UpdateChannel};
use crate::metrics::Metrics;
use crate::process::{CommandError, CommandRunner, CommandSpec};
use crate::runtime::{RuntimeError, RuntimeInspector, RuntimeMode};
use crate::store::{Store, StoreError};
use crate::types::{HistoryLevel, UpdateHistoryEntry, UpdateLock};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

const BACKUP_TAG_PREFIX: &str = "oneui-backup-";

/// Extra life on the lock beyond the action timeout, so a wedged action
/// goes observably stale instead of expiring mid-flight.
const LOCK_MARGIN: Duration = Duration::from_secs(60);

/// Errors from update coordination.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("updates are disabled by configuration")]
    Disabled,

    #[error("update lock held by {owner_id} until {expires_at}", owner_id = .0.owner_id, expires_at = .0.expires_at)]
    LockHeld(UpdateLock),

    #[error("preflight blocked: {summary}")]
    PreflightBlocked {
        summary: String,
        report: Box<PreflightReport>,
    },

    #[error("no backup tag available for rollback")]
    NoBackup,

    #[error("update script failed: {detail}")]
    Script { detail: String },

    #[error("data plane unhealthy after update: {detail}")]
    Health { detail: String },

    #[error("update action exceeded its time budget")]
    Timeout,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    #[error("update state error: {0}")]
    Io(#[from] std::io::Error),
}

impl UpdateError {
    /// Short machine-readable kind for user-visible envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            UpdateError::Disabled => "UPDATES_DISABLED",
            UpdateError::LockHeld(_) => "LOCK_HELD",
            UpdateError::PreflightBlocked { .. } => "PREFLIGHT_BLOCKED",
            UpdateError::NoBackup => "NO_BACKUP",
            UpdateError::Script { .. } => "UPDATE_SCRIPT_FAILED",
            UpdateError::Health { .. } => "DATA_PLANE_UNHEALTHY",
            UpdateError::Timeout => "UPDATE_TIMEOUT",
            UpdateError::Store(_) => "STORE_ERROR",
            UpdateError::Command(_) | UpdateError::Runtime(_) => "RUNTIME_ERROR",
            UpdateError::Io(_) => "IO_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateAction {
    Canary,
    Full,
    Rollback,
}

impl UpdateAction {
    fn as_str(&self) -> &'static str {
        match self {
            UpdateAction::Canary => "canary",
            UpdateAction::Full => "full",
            UpdateAction::Rollback => "rollback",
        }
    }
}

/// Options shared by canary and full runs.
#[derive(Debug, Clone, Default)]
pub struct UpdateOptions {
    pub channel: Option<UpdateChannel>,
    pub image: Option<String>,
    pub no_rollback: bool,
    pub force: bool,
}

/// Successful action summary.
#[derive(Debug, Clone, Serialize)]
pub struct UpdateReport {
    pub action: UpdateAction,
    pub channel: UpdateChannel,
    pub image: Option<String>,
    pub backup_tag: Option<String>,
    pub duration_ms: u64,
}

/// Operator-facing policy snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct UpdatePolicy {
    pub mode: RuntimeMode,
    pub updates_enabled: bool,
    pub require_canary_before_full: bool,
    pub canary_window_minutes: u64,
    pub default_channel: UpdateChannel,
    pub update_timeout_ms: u64,
    pub canary_ready: bool,
    pub last_successful_canary_at: Option<DateTime<Utc>>,
}

/// Result of an unlock request.
#[derive(Debug, Clone, Serialize)]
pub struct UnlockOutcome {
    pub unlocked: bool,
    pub had_lock: bool,
    pub forced: bool,
    pub stale: bool,
    pub previous_owner_id: Option<String>,
    pub previous_expires_at: Option<DateTime<Utc>>,
}

/// One recorded backup tag.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupTag {
    pub tag: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct CoordinatorState {
    last_successful_canary_at: Option<DateTime<Utc>>,
}

/// Owns the single named update lock and every upgrade action.
pub struct UpdateCoordinator {
    store: Arc<dyn Store>,
    runner: Arc<dyn CommandRunner>,
    inspector: Arc<RuntimeInspector>,
    config: Config,
    metrics: Option<Arc<Metrics>>,
    /// Lock owner identity for this process instance.
    owner_id: String,
}

impl UpdateCoordinator {
    pub fn new(
        store: Arc<dyn Store>,
        runner: Arc<dyn CommandRunner>,
        inspector: Arc<RuntimeInspector>,
        config: Config,
        metrics: Option<Arc<Metrics>>,
    ) -> Self {
        Self {
            store,
            runner,
            inspector,
            config,
            metrics,
            owner_id: format!("oneui-{}", uuid::Uuid::new_v4()),
        }
    }

    pub fn owner_id(&self) -> &str {
        &self.owner_id
    }

    fn state_file(&self) -> PathBuf {
        self.config.update.state_dir.join("update-state.json")
    }

    fn backups_dir(&self) -> PathBuf {
        self.config.update.state_dir.join("backups")
    }

    async fn read_state(&self) -> CoordinatorState {
        match tokio::fs::read(self.state_file()).await {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_default(),
            Err(_) => CoordinatorState::default(),
        }
    }

    async fn write_state(&self, state: &CoordinatorState) -> Result<(), UpdateError> {
        tokio::fs::create_dir_all(&self.config.update.state_dir).await?;
        let bytes = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
        atomic_write(&self.state_file(), &bytes).await?;
        Ok(())
    }

    fn canary_ready(&self, state: &CoordinatorState, now: DateTime<Utc>) -> bool {
        state
            .last_successful_canary_at
            .map(|at| now - at <= ChronoDuration::minutes(self.config.update.canary_window_minutes as i64))
            .unwrap_or(false)
    }

    /// Current policy snapshot for operators.
    pub async fn policy(&self) -> UpdatePolicy {
        let state = self.read_state().await;
        let status = self.inspector.inspect().await;
        let now = Utc::now();
        UpdatePolicy {
            mode: status.mode,
            updates_enabled: self.config.update.enabled,
            require_canary_before_full: self.config.update.require_canary_before_full,
            canary_window_minutes: self.config.update.canary_window_minutes,
            default_channel: self.config.update.default_channel,
            update_timeout_ms: self.config.update.timeout.as_millis() as u64,
            canary_ready: self.canary_ready(&state, now),
            last_successful_canary_at: state.last_successful_canary_at,
        }
    }

    /// Run the check list without holding the lock.
    pub async fn preflight(&self) -> PreflightReport {
        preflight::run_preflight(&self.runner, &self.store, &self.inspector, &self.config, None)
            .await
    }

    /// Newest-first page of the coordinator history.
    pub async fn history(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UpdateHistoryEntry>, StoreError> {
        self.store.update_history(offset, limit).await
    }

    // === Backup tags ===

    async fn current_image(&self) -> Result<String, UpdateError> {
        let output = self
            .runner
            .run(CommandSpec::new(
                "docker",
                &[
                    "inspect",
                    "--format",
                    "{{.Config.Image}}",
                    &self.config.data_plane.container_name,
                ],
                Duration::from_secs(30),
            ))
            .await?;
        if !output.success() {
            return Err(UpdateError::Script {
                detail: format!("cannot read current image: {}", output.stderr.trim()),
            });
        }
        Ok(output.stdout.trim().to_string())
    }

    /// Tag the current image as a rollback point and record it on disk.
    async fn create_backup(&self) -> Result<BackupTag, UpdateError> {
        let image = self.current_image().await?;
        let tag = format!("{BACKUP_TAG_PREFIX}{}", Utc::now().format("%Y%m%d-%H%M%S"));

        let output = self
            .runner
            .run(CommandSpec::new(
                "docker",
                &["tag", &image, &tag],
                Duration::from_secs(30),
            ))
            .await?;
        if !output.success() {
            return Err(UpdateError::Script {
                detail: format!("backup tag failed: {}", output.stderr.trim()),
            });
        }

        let backup = BackupTag {
            tag: tag.clone(),
            image,
            created_at: Utc::now(),
        };
        tokio::fs::create_dir_all(self.backups_dir()).await?;
        let bytes = serde_json::to_vec_pretty(&backup).map_err(std::io::Error::other)?;
        atomic_write(&self.backups_dir().join(format!("{tag}.json")), &bytes).await?;

        if let Err(err) = self.prune_backups().await {
            warn!(error = %err, "backup pruning failed");
        }
        Ok(backup)
    }

    /// Recorded backups, newest first.
    pub async fn list_backups(&self) -> Result<Vec<BackupTag>, UpdateError> {
        let dir = self.backups_dir();
        let mut backups = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(_) => return Ok(backups),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().ends_with(".json") {
                if let Ok(bytes) = tokio::fs::read(entry.path()).await {
                    if let Ok(backup) = serde_json::from_slice::<BackupTag>(&bytes) {
                        backups.push(backup);
                    }
                }
            }
        }
        backups.sort_by(|a, b| b.tag.cmp(&a.tag));
        Ok(backups)
    }

    async fn prune_backups(&self) -> Result<(), UpdateError> {
        let backups = self.list_backups().await?;
        for stale in backups.iter().skip(self.config.update.backup_retention.max(1)) {
            let path = self.backups_dir().join(format!("{}.json", stale.tag));
            if let Err(err) = tokio::fs::remove_file(&path).await {
                warn!(tag = %stale.tag, error = %err, "failed to drop backup record");
                continue;
            }
            // Untag the image too; failure here only wastes disk.
            let _ = self
                .runner
                .run(CommandSpec::new(
                    "docker",
                    &["rmi", &stale.tag],
                    Duration::from_secs(30),
                ))
                .await;
        }
        Ok(())
    }

    /// Retag a backup over the live image reference and restart.
    async fn restore_backup(&self, backup: &BackupTag) -> Result<(), UpdateError> {
        let output = self
            .runner
            .run(CommandSpec::new(
                "docker",
                &["tag", &backup.tag, &backup.image],
                Duration::from_secs(30),
            ))
            .await?;
        if !output.success() {
            return Err(UpdateError::Script {
                detail: format!("restore retag failed: {}", output.stderr.trim()),
            });
        }
        let handle = self.inspector.handle().await;
        handle.restart().await?;
        self.verify_health().await
    }

    /// Same bounded retry discipline as the apply engine.
    async fn verify_health(&self) -> Result<(), UpdateError> {
        let retries = self.config.data_plane.verify_retries.max(1);
        let pause = self.config.data_plane.verify_pause;
        for attempt in 1..=retries {
            if self.inspector.inspect().await.running {
                return Ok(());
            }
            if attempt < retries {
                tokio::time::sleep(pause).await;
            }
        }
        Err(UpdateError::Health {
            detail: format!("not running after {retries} checks"),
        })
    }

    // === Actions ===

    pub async fn run_canary(&self, opts: UpdateOptions) -> Result<UpdateReport, UpdateError> {
        self.run_action(UpdateAction::Canary, opts).await
    }

    pub async fn run_full(&self, opts: UpdateOptions) -> Result<UpdateReport, UpdateError> {
        self.run_action(UpdateAction::Full, opts).await
    }

    /// Restore a backup tag (newest when unspecified) under the lock.
    pub async fn rollback(&self, tag: Option<String>) -> Result<UpdateReport, UpdateError> {
        if !self.config.update.enabled {
            return Err(UpdateError::Disabled);
        }
        let lock = self.acquire_lock().await?;
        let started = Instant::now();

        let result = async {
            let backups = self.list_backups().await?;
            let backup = match &tag {
                Some(tag) => backups
                    .into_iter()
                    .find(|b| &b.tag == tag)
                    .ok_or(UpdateError::NoBackup)?,
                None => backups.into_iter().next().ok_or(UpdateError::NoBackup)?,
            };
            self.restore_backup(&backup).await?;
            Ok(UpdateReport {
                action: UpdateAction::Rollback,
                channel: self.config.update.default_channel,
                image: Some(backup.image.clone()),
                backup_tag: Some(backup.tag.clone()),
                duration_ms: started.elapsed().as_millis() as u64,
            })
        }
        .await;

        self.release_lock(&lock).await;
        self.record_outcome(UpdateAction::Rollback, &result).await;
        result
    }

    async fn run_action(
        &self,
        action: UpdateAction,
        opts: UpdateOptions,
    ) -> Result<UpdateReport, UpdateError> {
        if !self.config.update.enabled {
            return Err(UpdateError::Disabled);
        }

        let lock = self.acquire_lock().await?;
        let result = match tokio::time::timeout(
            self.config.update.timeout,
            self.execute(action, &opts),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(UpdateError::Timeout),
        };

        self.release_lock(&lock).await;
        self.record_outcome(action, &result).await;

        if action == UpdateAction::Canary && result.is_ok() {
            let mut state = self.read_state().await;
            state.last_successful_canary_at = Some(Utc::now());
            if let Err(err) = self.write_state(&state).await {
                warn!(error = %err, "failed to persist canary state");
            }
        }

        result
    }

    async fn execute(
        &self,
        action: UpdateAction,
        opts: &UpdateOptions,
    ) -> Result<UpdateReport, UpdateError> {
        let started = Instant::now();

        // Preflight gate, bypassed only by force. The lock check tolerates
        // our own freshly-acquired lock.
        if !opts.force {
            let report = preflight::run_preflight(
                &self.runner,
                &self.store,
                &self.inspector,
                &self.config,
                Some(&self.owner_id),
            )
            .await;
            if !report.ready {
                let summary = report
                    .blockers()
                    .iter()
                    .map(|c| c.id)
                    .collect::<Vec<_>>()
                    .join(", ");
                return Err(UpdateError::PreflightBlocked {
                    summary,
                    report: Box::new(report),
                });
            }
        }

        // Full requires a recent canary success unless forced.
        if action == UpdateAction::Full
            && self.config.update.require_canary_before_full
            && !opts.force
        {
            let state = self.read_state().await;
            if !self.canary_ready(&state, Utc::now()) {
                let check = PreflightCheck {
                    id: "canary-required",
                    label: "Recent successful canary required".into(),
                    ok: false,
                    blocking: true,
                    detail: format!(
                        "no canary success within the last {} minutes",
                        self.config.update.canary_window_minutes
                    ),
                    metadata: serde_json::Value::Null,
                };
                return Err(UpdateError::PreflightBlocked {
                    summary: "canary-required".into(),
                    report: Box::new(PreflightReport {
                        checks: vec![check],
                        ready: false,
                    }),
                });
            }
        }

        let backup = self.create_backup().await?;

        let channel = opts.channel.unwrap_or(self.config.update.default_channel);
        let script = self.config.update.script_path.display().to_string();
        let mut args: Vec<String> = Vec::new();
        match &opts.image {
            Some(image) => {
                args.push("--image".into());
                args.push(image.clone());
            }
            None => args.push(channel.flag().into()),
        }
        if action == UpdateAction::Canary {
            args.push("--canary".into());
            args.push("--no-restart".into());
        }
        args.push("--yes".into());

        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        let output = self
            .runner
            .run(CommandSpec::new(
                script,
                &arg_refs,
                self.config.update.timeout,
            ))
            .await?;

        if !output.success() {
            let detail = format!("exit {}: {}", output.exit_code, output.stderr.trim());
            self.maybe_rollback(opts, &backup).await;
            return Err(UpdateError::Script { detail });
        }

        if let Err(err) = self.verify_health().await {
            self.maybe_rollback(opts, &backup).await;
            return Err(err);
        }

        Ok(UpdateReport {
            action,
            channel,
            image: opts.image.clone(),
            backup_tag: Some(backup.tag),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    /// Rollback on failure unless the operator opted out. A rollback
    /// failure is logged, never surfaced, so the original error stays
    /// visible.
    async fn maybe_rollback(&self, opts: &UpdateOptions, backup: &BackupTag) {
        if opts.no_rollback {
            warn!(tag = %backup.tag, "update failed; rollback disabled by request");
            return;
        }
        info!(tag = %backup.tag, "update failed; restoring backup");
        if let Err(err) = self.restore_backup(backup).await {
            error!(error = %err, tag = %backup.tag, "rollback failed");
        }
    }

    // === Lock management ===

    async fn acquire_lock(&self) -> Result<UpdateLock, UpdateError> {
        let ttl = ChronoDuration::from_std(self.config.update.timeout + LOCK_MARGIN)
            .unwrap_or_else(|_| ChronoDuration::minutes(21));
        match self
            .store
            .acquire_update_lock(&self.config.update.lock_name, &self.owner_id, ttl)
            .await
        {
            Ok(lock) => Ok(lock),
            Err(StoreError::LockHeld(lock)) => Err(UpdateError::LockHeld(lock)),
            Err(err) => Err(err.into()),
        }
    }

    async fn release_lock(&self, lock: &UpdateLock) {
        match self
            .store
            .release_update_lock(&lock.name, &self.owner_id)
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!("update lock was not ours to release"),
            Err(err) => error!(error = %err, "failed to release update lock"),
        }
    }

    /// Clear a stale lock (always permitted) or any lock (requires
    /// `force`; the privilege check for forcing lives in the collaborator
    /// layer). The unlock itself is audited in the history.
    pub async fn unlock(&self, reason: &str, force: bool) -> Result<UnlockOutcome, UpdateError> {
        let name = &self.config.update.lock_name;
        let existing = self.store.read_update_lock(name).await?;

        let outcome = match existing {
            None => UnlockOutcome {
                unlocked: false,
                had_lock: false,
                forced: false,
                stale: false,
                previous_owner_id: None,
                previous_expires_at: None,
            },
            Some(lock) => {
                let stale = lock.is_stale(Utc::now());
                if !stale && !force {
                    return Err(UpdateError::LockHeld(lock));
                }
                self.store.clear_update_lock(name).await?;
                UnlockOutcome {
                    unlocked: true,
                    had_lock: true,
                    forced: !stale && force,
                    stale,
                    previous_owner_id: Some(lock.owner_id),
                    previous_expires_at: Some(lock.expires_at),
                }
            }
        };

        if outcome.unlocked {
            let entry = UpdateHistoryEntry {
                level: if outcome.forced {
                    HistoryLevel::Warning
                } else {
                    HistoryLevel::Info
                },
                message: format!("update lock cleared: {reason}"),
                metadata: json!({
                    "forced": outcome.forced,
                    "stale": outcome.stale,
                    "previousOwnerId": outcome.previous_owner_id,
                }),
                timestamp: Utc::now(),
            };
            if let Err(err) = self.store.append_update_history(entry).await {
                warn!(error = %err, "failed to record unlock in history");
            }
        }
        Ok(outcome)
    }

    async fn record_outcome(
        &self,
        action: UpdateAction,
        result: &Result<UpdateReport, UpdateError>,
    ) {
        let entry = match result {
            Ok(report) => UpdateHistoryEntry {
                level: HistoryLevel::Info,
                message: format!("{} succeeded", action.as_str()),
                metadata: json!({
                    "action": action.as_str(),
                    "backupTag": report.backup_tag,
                    "image": report.image,
                    "durationMs": report.duration_ms,
                }),
                timestamp: Utc::now(),
            },
            Err(err) => UpdateHistoryEntry {
                level: match err {
                    UpdateError::PreflightBlocked { .. } | UpdateError::LockHeld(_) => {
                        HistoryLevel::Warning
                    }
                    _ => HistoryLevel::Error,
                },
                message: format!("{} failed: {err}", action.as_str()),
                metadata: json!({ "action": action.as_str() }),
                timestamp: Utc::now(),
            },
        };
        if let Some(metrics) = &self.metrics {
            let label = if result.is_ok() { "ok" } else { "error" };
            metrics
                .update_actions_total
                .with_label_values(&[action.as_str(), label])
                .inc();
        }
        if let Err(err) = self.store.append_update_history(entry).await {
            warn!(error = %err, "failed to append update history");
        }
    }
}
