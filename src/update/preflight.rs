//! Preflight checks gating update actions.

use crate::config::Config;
use crate::process::{CommandRunner, CommandSpec};
use crate::runtime::RuntimeInspector;
use crate::store::Store;
use chrono::Utc;
use serde::Serialize;
use std::os::unix::fs::PermissionsExt;
use std::sync::Arc;
use std::time::Duration;

const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// One named check, ordered as executed.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightCheck {
    pub id: &'static str,
    pub label: String,
    pub ok: bool,
    pub blocking: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "serde_json::Value::is_null")]
    pub metadata: serde_json::Value,
}

/// The full ordered check list. `ready` iff every blocking check passed.
#[derive(Debug, Clone, Serialize)]
pub struct PreflightReport {
    pub checks: Vec<PreflightCheck>,
    pub ready: bool,
}

impl PreflightReport {
    fn from_checks(checks: Vec<PreflightCheck>) -> Self {
        let ready = checks.iter().filter(|c| c.blocking).all(|c| c.ok);
        Self { checks, ready }
    }

    /// Blocking checks that failed, for error messages.
    pub fn blockers(&self) -> Vec<&PreflightCheck> {
        self.checks.iter().filter(|c| c.blocking && !c.ok).collect()
    }
}

async fn script_check(config: &Config) -> PreflightCheck {
    let path = &config.update.script_path;
    let (ok, detail) = match tokio::fs::metadata(path).await {
        Ok(meta) => {
            let executable = meta.permissions().mode() & 0o111 != 0;
            if executable {
                (true, path.display().to_string())
            } else {
                (false, format!("{} is not executable", path.display()))
            }
        }
        Err(err) => (false, format!("{}: {err}", path.display())),
    };
    PreflightCheck {
        id: "update-script",
        label: "Update script present and executable".into(),
        ok,
        blocking: true,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn compose_check(config: &Config) -> PreflightCheck {
    let path = &config.update.compose_file;
    let (ok, detail) = match tokio::fs::metadata(path).await {
        Ok(_) => (true, path.display().to_string()),
        Err(err) => (false, format!("{}: {err}", path.display())),
    };
    PreflightCheck {
        id: "compose-file",
        label: "Compose file present".into(),
        ok,
        blocking: true,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn runtime_reachable_check(runner: &Arc<dyn CommandRunner>) -> PreflightCheck {
    let spec = CommandSpec::new(
        "docker",
        &["version", "--format", "{{.Server.Version}}"],
        CHECK_TIMEOUT,
    );
    let (ok, detail) = match runner.run(spec).await {
        Ok(output) if output.success() => (true, output.stdout.trim().to_string()),
        Ok(output) => (false, output.stderr.trim().to_string()),
        Err(err) => (false, err.to_string()),
    };
    PreflightCheck {
        id: "container-runtime",
        label: "Container runtime reachable".into(),
        ok,
        blocking: true,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn container_present_check(
    runner: &Arc<dyn CommandRunner>,
    config: &Config,
) -> PreflightCheck {
    let name = &config.data_plane.container_name;
    let spec = CommandSpec::new(
        "docker",
        &["inspect", "--format", "{{.Id}}", name],
        CHECK_TIMEOUT,
    );
    let (ok, detail) = match runner.run(spec).await {
        Ok(output) if output.success() => (true, format!("container {name} present")),
        Ok(output) => (false, output.stderr.trim().to_string()),
        Err(err) => (false, err.to_string()),
    };
    PreflightCheck {
        id: "target-container",
        label: "Target container present".into(),
        ok,
        blocking: true,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn version_check(inspector: &RuntimeInspector) -> PreflightCheck {
    let handle = inspector.handle().await;
    let (ok, detail) = match handle.version().await {
        Ok(version) => (true, version),
        Err(err) => (false, err.to_string()),
    };
    PreflightCheck {
        id: "version-readable",
        label: "Data-plane version readable".into(),
        ok,
        // Informational: a missing version string should not block an
        // otherwise healthy update path.
        blocking: false,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn dry_run_check(runner: &Arc<dyn CommandRunner>, config: &Config) -> PreflightCheck {
    let script = config.update.script_path.display().to_string();
    let spec = CommandSpec::new(script, &["--dry-run", "--yes"], CHECK_TIMEOUT);
    let (ok, detail) = match runner.run(spec).await {
        Ok(output) if output.success() => (true, "dry run succeeded".to_string()),
        Ok(output) => (
            false,
            format!("exit {}: {}", output.exit_code, output.stderr.trim()),
        ),
        Err(err) => (false, err.to_string()),
    };
    PreflightCheck {
        id: "script-dry-run",
        label: "Update script dry run".into(),
        ok,
        blocking: true,
        detail,
        metadata: serde_json::Value::Null,
    }
}

async fn lock_check(
    store: &Arc<dyn Store>,
    config: &Config,
    ignore_owner: Option<&str>,
) -> PreflightCheck {
    let now = Utc::now();
    let (ok, detail, metadata) = match store.read_update_lock(&config.update.lock_name).await {
        Ok(None) => (true, "no update lock".to_string(), serde_json::Value::Null),
        Ok(Some(lock)) if lock.is_stale(now) => (
            true,
            format!("stale lock from {} ignored", lock.owner_id),
            serde_json::to_value(&lock).unwrap_or_default(),
        ),
        Ok(Some(lock)) if Some(lock.owner_id.as_str()) == ignore_owner => (
            true,
            "lock held by this operation".to_string(),
            serde_json::to_value(&lock).unwrap_or_default(),
        ),
        Ok(Some(lock)) => (
            false,
            format!("lock held by {} until {}", lock.owner_id, lock.expires_at),
            serde_json::to_value(&lock).unwrap_or_default(),
        ),
        Err(err) => (false, err.to_string(), serde_json::Value::Null),
    };
    PreflightCheck {
        id: "update-lock",
        label: "No active update lock".into(),
        ok,
        blocking: true,
        detail,
        metadata,
    }
}

/// Run all checks in order and derive readiness. A lock held by
/// `ignore_owner` does not count as a blocker; update actions pass their
/// own owner id after acquisition.
pub async fn run_preflight(
    runner: &Arc<dyn CommandRunner>,
    store: &Arc<dyn Store>,
    inspector: &RuntimeInspector,
    config: &Config,
    ignore_owner: Option<&str>,
) -> PreflightReport {
    let checks = vec![
        script_check(config).await,
        compose_check(config).await,
        runtime_reachable_check(runner).await,
        container_present_check(runner, config).await,
        version_check(inspector).await,
        dry_run_check(runner, config).await,
        lock_check(store, config, ignore_owner).await,
    ];
    PreflightReport::from_checks(checks)
}
