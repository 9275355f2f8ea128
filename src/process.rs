//! Sub-process execution choke point.
//!
//! Every external invocation the control plane makes — container runtime
//! verbs, service manager verbs, `ps`, the data-plane binary, the update
//! script — goes through [`CommandRunner`] so tests can script outcomes
//! without a real system underneath.

use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tracing::debug;

/// Errors from sub-process execution.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    TimedOut { program: String, timeout: Duration },

    #[error("IO error running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// A command to run, with a hard wall-clock budget.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str], timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|s| s.to_string()).collect(),
            timeout,
        }
    }

    /// Rendered command line for logs and history metadata.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Abstract command execution. Object-safe so components hold
/// `Arc<dyn CommandRunner>`.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion, capturing stdout/stderr. A non-zero exit is NOT an
    /// error at this layer; callers interpret `exit_code`.
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError>;
}

/// Real implementation over `tokio::process`.
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        debug!(command = %spec.display(), timeout = ?spec.timeout, "running command");

        let mut child = tokio::process::Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let mut stdout_pipe = child.stdout.take();
        let mut stderr_pipe = child.stderr.take();

        let wait = async {
            // Drain both pipes concurrently; a sequential read can deadlock
            // against a child blocked on a full stderr buffer.
            let mut stdout = String::new();
            let mut stderr = String::new();
            let stdout_read = async {
                match stdout_pipe.as_mut() {
                    Some(pipe) => pipe.read_to_string(&mut stdout).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let stderr_read = async {
                match stderr_pipe.as_mut() {
                    Some(pipe) => pipe.read_to_string(&mut stderr).await.map(|_| ()),
                    None => Ok(()),
                }
            };
            let (out_res, err_res) = tokio::join!(stdout_read, stderr_read);
            out_res.map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?;
            err_res.map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?;
            let status = child.wait().await.map_err(|source| CommandError::Io {
                program: spec.program.clone(),
                source,
            })?;
            Ok(CommandOutput {
                exit_code: status.code().unwrap_or(-1),
                stdout,
                stderr,
            })
        };

        match tokio::time::timeout(spec.timeout, wait).await {
            Ok(result) => result,
            Err(_) => Err(CommandError::TimedOut {
                program: spec.program.clone(),
                timeout: spec.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout_and_exit() {
        let out = SystemRunner
            .run(CommandSpec::new(
                "sh",
                &["-c", "echo hello; exit 3"],
                Duration::from_secs(5),
            ))
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert_eq!(out.stdout.trim(), "hello");
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_run_times_out() {
        let err = SystemRunner
            .run(CommandSpec::new(
                "sh",
                &["-c", "sleep 5"],
                Duration::from_millis(100),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_spawn_failure() {
        let err = SystemRunner
            .run(CommandSpec::new(
                "/nonexistent/binary-for-test",
                &[],
                Duration::from_secs(1),
            ))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn test_display_renders_args() {
        let spec = CommandSpec::new("docker", &["inspect", "xray"], Duration::from_secs(1));
        assert_eq!(spec.display(), "docker inspect xray");
    }
}
