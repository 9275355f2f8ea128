//! Data-plane runtime detection and control.
//!
//! Three possible runtime sources — container, service manager, local
//! process — share one reload/restart/stop/start/test contract. The
//! inspector probes all three concurrently and picks the active one by
//! deployment-hint priority; a [`RuntimeHandle`] maps the control verbs to
//! the selected source for the duration of one operation.

use crate::config::{DataPlaneConfig, DeploymentHint};
use crate::process::{CommandError, CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Budget for a single control verb.
const VERB_TIMEOUT: Duration = Duration::from_secs(30);

/// Budget for a config validation run.
const TEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from runtime inspection and control.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("{verb} failed for {mode:?}: {detail}")]
    Verb {
        verb: &'static str,
        mode: RuntimeMode,
        detail: String,
    },

    #[error("pid file unusable: {0}")]
    PidFile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeMode {
    Container,
    Service,
    Local,
}

/// `docker inspect` result, reduced.
#[derive(Debug, Clone, Default)]
pub struct ContainerDetails {
    pub available: bool,
    pub exists: bool,
    pub running: bool,
    pub state: String,
    pub started_at: Option<String>,
}

/// `is-active` result, reduced.
#[derive(Debug, Clone, Default)]
pub struct ServiceDetails {
    pub available: bool,
    pub running: bool,
    pub state: String,
}

/// PID-file + `ps` probe result.
#[derive(Debug, Clone, Default)]
pub struct ProcessDetails {
    pub available: bool,
    pub running: bool,
    pub pid: Option<i32>,
}

/// Selection outcome for one inspection.
#[derive(Debug, Clone)]
pub struct RuntimeStatus {
    pub mode: RuntimeMode,
    pub running: bool,
    pub state: String,
    pub deployment_hint: DeploymentHint,
    pub hint_mismatch: bool,
    pub container: ContainerDetails,
    pub service: ServiceDetails,
    pub process: ProcessDetails,
}

/// Probes runtime sources and dispenses control handles.
pub struct RuntimeInspector {
    runner: Arc<dyn CommandRunner>,
    config: DataPlaneConfig,
}

impl RuntimeInspector {
    pub fn new(runner: Arc<dyn CommandRunner>, config: DataPlaneConfig) -> Self {
        Self { runner, config }
    }

    async fn probe_container(&self) -> ContainerDetails {
        let spec = CommandSpec::new(
            "docker",
            &[
                "inspect",
                "--format",
                "{{json .State}}",
                &self.config.container_name,
            ],
            VERB_TIMEOUT,
        );
        match self.runner.run(spec).await {
            Ok(output) if output.success() => {
                let state: serde_json::Value =
                    serde_json::from_str(output.stdout.trim()).unwrap_or_default();
                ContainerDetails {
                    available: true,
                    exists: true,
                    running: state["Running"].as_bool().unwrap_or(false),
                    state: state["Status"].as_str().unwrap_or("unknown").to_string(),
                    started_at: state["StartedAt"].as_str().map(|s| s.to_string()),
                }
            }
            Ok(_) => ContainerDetails {
                available: true,
                ..ContainerDetails::default()
            },
            Err(err) => {
                debug!(error = %err, "container runtime unavailable");
                ContainerDetails::default()
            }
        }
    }

    async fn probe_service(&self) -> ServiceDetails {
        let spec = CommandSpec::new(
            "systemctl",
            &["is-active", &self.config.service_name],
            VERB_TIMEOUT,
        );
        match self.runner.run(spec).await {
            Ok(output) => {
                let state = output.stdout.trim().to_string();
                let state = if state.is_empty() {
                    "unknown".to_string()
                } else {
                    state
                };
                ServiceDetails {
                    available: true,
                    running: state == "active",
                    state,
                }
            }
            Err(err) => {
                debug!(error = %err, "service manager unavailable");
                ServiceDetails::default()
            }
        }
    }

    async fn probe_process(&self) -> ProcessDetails {
        let raw = match tokio::fs::read_to_string(&self.config.pid_file).await {
            Ok(raw) => raw,
            Err(_) => return ProcessDetails::default(),
        };
        let pid: i32 = match raw.trim().parse() {
            Ok(pid) => pid,
            Err(_) => {
                warn!(path = %self.config.pid_file.display(), "pid file does not contain an integer");
                return ProcessDetails::default();
            }
        };
        let expected = self
            .config
            .binary_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
        let spec = CommandSpec::new(
            "ps",
            &["-p", &pid.to_string(), "-o", "comm="],
            VERB_TIMEOUT,
        );
        match self.runner.run(spec).await {
            Ok(output) if output.success() => {
                let comm = output.stdout.trim();
                ProcessDetails {
                    available: true,
                    running: !comm.is_empty() && comm.contains(&expected),
                    pid: Some(pid),
                }
            }
            _ => ProcessDetails {
                available: true,
                running: false,
                pid: Some(pid),
            },
        }
    }

    /// Probe all three sources concurrently and select by hint priority:
    /// the first source reporting `running || exists` wins; local is the
    /// fallback.
    pub async fn inspect(&self) -> RuntimeStatus {
        let (container, service, process) = tokio::join!(
            self.probe_container(),
            self.probe_service(),
            self.probe_process()
        );

        let hint = self.config.deployment_hint;
        let priority: [RuntimeMode; 3] = match hint {
            DeploymentHint::Service => {
                [RuntimeMode::Service, RuntimeMode::Container, RuntimeMode::Local]
            }
            DeploymentHint::Local => {
                [RuntimeMode::Local, RuntimeMode::Container, RuntimeMode::Service]
            }
            DeploymentHint::Container | DeploymentHint::Auto => {
                [RuntimeMode::Container, RuntimeMode::Service, RuntimeMode::Local]
            }
        };

        // First source claiming the data plane wins; local is the fallback.
        let mut selected = RuntimeMode::Local;
        for mode in priority {
            let claims = match mode {
                RuntimeMode::Container => container.running || container.exists,
                RuntimeMode::Service => service.running,
                RuntimeMode::Local => process.running,
            };
            if claims {
                selected = mode;
                break;
            }
        }

        let (running, state) = match selected {
            RuntimeMode::Container => (container.running, container.state.clone()),
            RuntimeMode::Service => (service.running, service.state.clone()),
            RuntimeMode::Local => (
                process.running,
                if process.running { "running" } else { "stopped" }.to_string(),
            ),
        };

        let hint_mismatch = match hint {
            DeploymentHint::Auto => false,
            DeploymentHint::Container => selected != RuntimeMode::Container,
            DeploymentHint::Service => selected != RuntimeMode::Service,
            DeploymentHint::Local => selected != RuntimeMode::Local,
        };

        RuntimeStatus {
            mode: selected,
            running,
            state,
            deployment_hint: hint,
            hint_mismatch,
            container,
            service,
            process,
        }
    }

    /// Control handle for the currently detected mode. Cached only for the
    /// duration of one operation; re-inspect for the next.
    pub async fn handle(&self) -> RuntimeHandle {
        let status = self.inspect().await;
        RuntimeHandle {
            mode: status.mode,
            runner: self.runner.clone(),
            config: self.config.clone(),
        }
    }

    pub fn handle_for(&self, mode: RuntimeMode) -> RuntimeHandle {
        RuntimeHandle {
            mode,
            runner: self.runner.clone(),
            config: self.config.clone(),
        }
    }
}

/// Validation outcome of `-test -config`.
#[derive(Debug, Clone)]
pub struct TestOutcome {
    pub ok: bool,
    pub detail: String,
}

/// Control verbs bound to one runtime mode.
pub struct RuntimeHandle {
    pub mode: RuntimeMode,
    runner: Arc<dyn CommandRunner>,
    config: DataPlaneConfig,
}

impl RuntimeHandle {
    async fn expect_success(
        &self,
        verb: &'static str,
        spec: CommandSpec,
    ) -> Result<(), RuntimeError> {
        let output = self.runner.run(spec).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RuntimeError::Verb {
                verb,
                mode: self.mode,
                detail: format!("exit {}: {}", output.exit_code, output.stderr.trim()),
            })
        }
    }

    async fn local_pid(&self) -> Result<i32, RuntimeError> {
        let raw = tokio::fs::read_to_string(&self.config.pid_file)
            .await
            .map_err(|e| RuntimeError::PidFile(e.to_string()))?;
        raw.trim()
            .parse()
            .map_err(|_| RuntimeError::PidFile(format!("not an integer: {}", raw.trim())))
    }

    fn signal_pid(&self, pid: i32, signal: i32, verb: &'static str) -> Result<(), RuntimeError> {
        let rc = unsafe { libc::kill(pid, signal) };
        if rc == 0 {
            Ok(())
        } else {
            Err(RuntimeError::Verb {
                verb,
                mode: self.mode,
                detail: std::io::Error::last_os_error().to_string(),
            })
        }
    }

    /// Hot reload: SIGHUP to the container, `reload` on the service, or
    /// SIGHUP to the PID from the PID file.
    pub async fn reload(&self) -> Result<(), RuntimeError> {
        match self.mode {
            RuntimeMode::Container => {
                self.expect_success(
                    "reload",
                    CommandSpec::new(
                        "docker",
                        &["kill", "--signal", "HUP", &self.config.container_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Service => {
                self.expect_success(
                    "reload",
                    CommandSpec::new(
                        "systemctl",
                        &["reload", &self.config.service_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Local => {
                let pid = self.local_pid().await?;
                self.signal_pid(pid, libc::SIGHUP, "reload")
            }
        }
    }

    pub async fn restart(&self) -> Result<(), RuntimeError> {
        match self.mode {
            RuntimeMode::Container => {
                self.expect_success(
                    "restart",
                    CommandSpec::new(
                        "docker",
                        &["restart", &self.config.container_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Service => {
                self.expect_success(
                    "restart",
                    CommandSpec::new(
                        "systemctl",
                        &["restart", &self.config.service_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Local => {
                // Stop-then-start via the PID file.
                if let Ok(pid) = self.local_pid().await {
                    let _ = self.signal_pid(pid, libc::SIGTERM, "restart");
                }
                self.start().await
            }
        }
    }

    pub async fn stop(&self) -> Result<(), RuntimeError> {
        match self.mode {
            RuntimeMode::Container => {
                self.expect_success(
                    "stop",
                    CommandSpec::new("docker", &["stop", &self.config.container_name], VERB_TIMEOUT),
                )
                .await
            }
            RuntimeMode::Service => {
                self.expect_success(
                    "stop",
                    CommandSpec::new(
                        "systemctl",
                        &["stop", &self.config.service_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Local => {
                let pid = self.local_pid().await?;
                self.signal_pid(pid, libc::SIGTERM, "stop")
            }
        }
    }

    pub async fn start(&self) -> Result<(), RuntimeError> {
        match self.mode {
            RuntimeMode::Container => {
                self.expect_success(
                    "start",
                    CommandSpec::new(
                        "docker",
                        &["start", &self.config.container_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Service => {
                self.expect_success(
                    "start",
                    CommandSpec::new(
                        "systemctl",
                        &["start", &self.config.service_name],
                        VERB_TIMEOUT,
                    ),
                )
                .await
            }
            RuntimeMode::Local => {
                // Detach the data plane and record its PID.
                let line = format!(
                    "nohup {} run -config {} >/dev/null 2>&1 & echo $! > {}",
                    self.config.binary_path.display(),
                    self.config.config_path.display(),
                    self.config.pid_file.display(),
                );
                self.expect_success(
                    "start",
                    CommandSpec::new("sh", &["-c", &line], VERB_TIMEOUT),
                )
                .await
            }
        }
    }

    /// Validate a config inside the active runtime. A non-zero exit or a
    /// stderr containing `failed` marks it invalid.
    pub async fn test(&self, config_path: &std::path::Path) -> Result<TestOutcome, RuntimeError> {
        let path = config_path.display().to_string();
        let binary = self.config.binary_path.display().to_string();
        let spec = match self.mode {
            RuntimeMode::Container => CommandSpec::new(
                "docker",
                &[
                    "exec",
                    &self.config.container_name,
                    &binary,
                    "-test",
                    "-config",
                    &path,
                ],
                TEST_TIMEOUT,
            ),
            RuntimeMode::Service | RuntimeMode::Local => {
                CommandSpec::new(binary, &["-test", "-config", &path], TEST_TIMEOUT)
            }
        };
        let output = self.runner.run(spec).await?;
        let stderr_failed = output.stderr.to_lowercase().contains("failed");
        let ok = output.success() && !stderr_failed;
        let detail = if ok {
            output.stdout.trim().to_string()
        } else {
            let mut detail = output.stderr.trim().to_string();
            if detail.is_empty() {
                detail = format!("exit {}", output.exit_code);
            }
            detail
        };
        Ok(TestOutcome { ok, detail })
    }

    /// Data-plane version string, best-effort.
    pub async fn version(&self) -> Result<String, RuntimeError> {
        let binary = self.config.binary_path.display().to_string();
        let spec = match self.mode {
            RuntimeMode::Container => CommandSpec::new(
                "docker",
                &["exec", &self.config.container_name, &binary, "version"],
                VERB_TIMEOUT,
            ),
            RuntimeMode::Service | RuntimeMode::Local => {
                CommandSpec::new(binary, &["version"], VERB_TIMEOUT)
            }
        };
        let output = self.runner.run(spec).await?;
        if !output.success() {
            return Err(RuntimeError::Verb {
                verb: "version",
                mode: self.mode,
                detail: format!("exit {}", output.exit_code),
            });
        }
        Ok(output
            .stdout
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }
}
