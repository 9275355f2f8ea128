//! Stat transport: one RPC, `query_stat(pattern, reset)`, over two
//! interchangeable carriers — HTTP JSON against the data plane's stats
//! endpoint, and the data-plane CLI as a sub-process. A sticky preference
//! remembers which carrier answered last.

use crate::process::{CommandError, CommandRunner, CommandSpec};
use crate::types::normalize_counter;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors from stat transports.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("HTTP stat query failed: {0}")]
    Http(String),

    #[error("CLI stat query failed: {0}")]
    Cli(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("no stat transport configured")]
    NotConfigured,
}

/// Result of a stat query. `found` is true iff some transport returned an
/// explicit value field, regardless of the numeric value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatAnswer {
    pub value: u64,
    pub found: bool,
}

/// One stat query carrier.
#[async_trait]
pub trait StatTransport: Send + Sync {
    async fn query_stat(&self, pattern: &str, reset: bool) -> Result<StatAnswer, TransportError>;

    /// Short name for logs and the sticky preference.
    fn name(&self) -> &'static str;
}

#[derive(Serialize)]
struct QueryBody<'a> {
    pattern: &'a str,
    reset: bool,
}

/// Extract `{value, found}` from a stats response document. The `stat`
/// member may be a single object or an array of `{name, value}`; when an
/// array, an entry whose name equals the pattern wins, else the first entry
/// carrying a value.
fn answer_from_stat_doc(doc: &serde_json::Value, pattern: &str) -> StatAnswer {
    let stat = &doc["stat"];
    match stat {
        serde_json::Value::Array(entries) => {
            let matching = entries
                .iter()
                .find(|e| e["name"].as_str() == Some(pattern))
                .or_else(|| entries.iter().find(|e| !e["value"].is_null()));
            match matching {
                Some(entry) if !entry["value"].is_null() => StatAnswer {
                    value: normalize_counter(&entry["value"]),
                    found: true,
                },
                _ => StatAnswer::default(),
            }
        }
        serde_json::Value::Object(_) if !stat["value"].is_null() => StatAnswer {
            value: normalize_counter(&stat["value"]),
            found: true,
        },
        _ => StatAnswer::default(),
    }
}

/// HTTP JSON transport: `POST <base>/stats/query` with `{pattern, reset}`.
pub struct HttpStatTransport {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatTransport {
    pub fn new(base_url: String, timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(e.to_string()))?;
        Ok(Self { client, base_url })
    }
}

#[async_trait]
impl StatTransport for HttpStatTransport {
    async fn query_stat(&self, pattern: &str, reset: bool) -> Result<StatAnswer, TransportError> {
        let url = format!("{}/stats/query", self.base_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .json(&QueryBody { pattern, reset })
            .send()
            .await
            .map_err(|e| TransportError::Http(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Http(format!("{url} returned {status}")));
        }

        let doc: serde_json::Value = response
            .json()
            .await
            .map_err(|e| TransportError::Http(format!("invalid response body: {e}")))?;

        Ok(answer_from_stat_doc(&doc, pattern))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// CLI transport: `<binary> api statsquery --server=<host:port> -pattern
/// <pat> [--reset]`, JSON stdout preferred, relaxed text fallback accepted.
pub struct CliStatTransport {
    runner: Arc<dyn CommandRunner>,
    binary: String,
    server: String,
    timeout: Duration,
    value_re: regex::Regex,
}

impl CliStatTransport {
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        binary: String,
        server: String,
        timeout: Duration,
    ) -> Self {
        Self {
            runner,
            binary,
            server,
            // Relaxed fallback for non-JSON CLI builds: `value: 1234`.
            value_re: regex::Regex::new(r"value\s*:\s*([0-9]+)").unwrap(),
            timeout: timeout.max(Duration::from_secs(3)),
        }
    }

    fn parse_stdout(&self, stdout: &str, pattern: &str) -> StatAnswer {
        if let Ok(doc) = serde_json::from_str::<serde_json::Value>(stdout) {
            let answer = answer_from_stat_doc(&doc, pattern);
            if answer.found {
                return answer;
            }
        }
        if let Some(caps) = self.value_re.captures(stdout) {
            return StatAnswer {
                value: caps[1].parse::<u64>().unwrap_or(0),
                found: true,
            };
        }
        StatAnswer::default()
    }
}

#[async_trait]
impl StatTransport for CliStatTransport {
    async fn query_stat(&self, pattern: &str, reset: bool) -> Result<StatAnswer, TransportError> {
        let server_flag = format!("--server={}", self.server);
        let mut args = vec![
            "api",
            "statsquery",
            server_flag.as_str(),
            "-pattern",
            pattern,
        ];
        if reset {
            args.push("--reset");
        }
        let output = self
            .runner
            .run(CommandSpec::new(self.binary.clone(), &args, self.timeout))
            .await?;

        if !output.success() {
            return Err(TransportError::Cli(format!(
                "exit {}: {}",
                output.exit_code,
                output.stderr.trim()
            )));
        }

        Ok(self.parse_stdout(&output.stdout, pattern))
    }

    fn name(&self) -> &'static str {
        "cli"
    }
}

const PREFER_FIRST: u8 = 0;
const PREFER_SECOND: u8 = 1;

/// Two transports with a sticky preference: the carrier that answered last
/// is tried first on the next call; on its failure the other gets one
/// attempt, and the last error propagates when both fail.
pub struct DualStatTransport {
    transports: Vec<Arc<dyn StatTransport>>,
    preference: AtomicU8,
}

impl DualStatTransport {
    pub fn new(primary: Arc<dyn StatTransport>, secondary: Arc<dyn StatTransport>) -> Self {
        Self {
            transports: vec![primary, secondary],
            preference: AtomicU8::new(PREFER_FIRST),
        }
    }

    /// Single-transport construction, for deployments without an HTTP API.
    pub fn single(only: Arc<dyn StatTransport>) -> Self {
        Self {
            transports: vec![only],
            preference: AtomicU8::new(PREFER_FIRST),
        }
    }

    /// Name of the currently preferred transport.
    pub fn preferred(&self) -> &'static str {
        let idx = self.preference.load(Ordering::Relaxed) as usize;
        self.transports[idx.min(self.transports.len() - 1)].name()
    }
}

#[async_trait]
impl StatTransport for DualStatTransport {
    async fn query_stat(&self, pattern: &str, reset: bool) -> Result<StatAnswer, TransportError> {
        if self.transports.is_empty() {
            return Err(TransportError::NotConfigured);
        }

        let first = self.preference.load(Ordering::Relaxed) as usize;
        let first = first.min(self.transports.len() - 1);
        let order: Vec<usize> = if self.transports.len() == 1 {
            vec![0]
        } else {
            vec![first, 1 - first]
        };

        let mut last_err = TransportError::NotConfigured;
        for idx in order {
            let transport = &self.transports[idx];
            match transport.query_stat(pattern, reset).await {
                Ok(answer) => {
                    let sticky = if idx == 0 { PREFER_FIRST } else { PREFER_SECOND };
                    self.preference.store(sticky, Ordering::Relaxed);
                    debug!(
                        transport = transport.name(),
                        pattern, value = answer.value, found = answer.found,
                        "stat query answered"
                    );
                    return Ok(answer);
                }
                Err(err) => {
                    warn!(transport = transport.name(), pattern, error = %err, "stat transport failed");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    fn name(&self) -> &'static str {
        "dual"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::CommandOutput;
    use parking_lot::Mutex;

    struct ScriptedTransport {
        name: &'static str,
        answers: Mutex<Vec<Result<StatAnswer, TransportError>>>,
        calls: Mutex<u32>,
    }

    impl ScriptedTransport {
        fn new(name: &'static str, answers: Vec<Result<StatAnswer, TransportError>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                answers: Mutex::new(answers),
                calls: Mutex::new(0),
            })
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl StatTransport for ScriptedTransport {
        async fn query_stat(&self, _: &str, _: bool) -> Result<StatAnswer, TransportError> {
            *self.calls.lock() += 1;
            let mut answers = self.answers.lock();
            if answers.is_empty() {
                return Err(TransportError::Cli("script exhausted".into()));
            }
            answers.remove(0)
        }

        fn name(&self) -> &'static str {
            self.name
        }
    }

    struct EchoRunner {
        stdout: String,
        exit_code: i32,
        last: Mutex<Option<CommandSpec>>,
    }

    #[async_trait]
    impl CommandRunner for EchoRunner {
        async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
            *self.last.lock() = Some(spec);
            Ok(CommandOutput {
                exit_code: self.exit_code,
                stdout: self.stdout.clone(),
                stderr: String::new(),
            })
        }
    }

    #[test]
    fn test_answer_from_object_doc() {
        let doc = serde_json::json!({"stat": {"name": "k", "value": "1000"}});
        assert_eq!(
            answer_from_stat_doc(&doc, "k"),
            StatAnswer {
                value: 1000,
                found: true
            }
        );
    }

    #[test]
    fn test_answer_from_array_prefers_matching_name() {
        let doc = serde_json::json!({"stat": [
            {"name": "other", "value": 5},
            {"name": "user>>>a>>>traffic>>>uplink", "value": 77},
        ]});
        let answer = answer_from_stat_doc(&doc, "user>>>a>>>traffic>>>uplink");
        assert_eq!(answer.value, 77);
        assert!(answer.found);
    }

    #[test]
    fn test_answer_missing_value_not_found() {
        let doc = serde_json::json!({"stat": [{"name": "x"}]});
        let answer = answer_from_stat_doc(&doc, "x");
        assert!(!answer.found);
        assert_eq!(answer.value, 0);

        let empty = serde_json::json!({});
        assert!(!answer_from_stat_doc(&empty, "x").found);
    }

    #[test]
    fn test_answer_found_with_zero_value() {
        // found=true even when the counter is 0 — the field was explicit.
        let doc = serde_json::json!({"stat": {"value": 0}});
        let answer = answer_from_stat_doc(&doc, "x");
        assert!(answer.found);
        assert_eq!(answer.value, 0);
    }

    #[tokio::test]
    async fn test_cli_transport_args_and_json_parse() {
        let runner = Arc::new(EchoRunner {
            stdout: r#"{"stat": [{"name": "p", "value": "42"}]}"#.to_string(),
            exit_code: 0,
            last: Mutex::new(None),
        });
        let cli = CliStatTransport::new(
            runner.clone(),
            "/usr/local/bin/xray".into(),
            "127.0.0.1:10085".into(),
            Duration::from_secs(7),
        );
        let answer = cli.query_stat("p", true).await.unwrap();
        assert_eq!(answer.value, 42);

        let spec = runner.last.lock().clone().unwrap();
        assert_eq!(spec.program, "/usr/local/bin/xray");
        assert_eq!(
            spec.args,
            vec![
                "api",
                "statsquery",
                "--server=127.0.0.1:10085",
                "-pattern",
                "p",
                "--reset"
            ]
        );
    }

    #[tokio::test]
    async fn test_cli_transport_text_fallback() {
        let runner = Arc::new(EchoRunner {
            stdout: "stat:\n  name: p\n  value: 1234\n".to_string(),
            exit_code: 0,
            last: Mutex::new(None),
        });
        let cli = CliStatTransport::new(
            runner,
            "xray".into(),
            "127.0.0.1:10085".into(),
            Duration::from_secs(7),
        );
        let answer = cli.query_stat("p", false).await.unwrap();
        assert_eq!(answer.value, 1234);
        assert!(answer.found);
    }

    #[tokio::test]
    async fn test_cli_transport_nonzero_exit_is_error() {
        let runner = Arc::new(EchoRunner {
            stdout: String::new(),
            exit_code: 1,
            last: Mutex::new(None),
        });
        let cli = CliStatTransport::new(
            runner,
            "xray".into(),
            "127.0.0.1:10085".into(),
            Duration::from_secs(7),
        );
        assert!(matches!(
            cli.query_stat("p", false).await,
            Err(TransportError::Cli(_))
        ));
    }

    #[tokio::test]
    async fn test_dual_fallback_and_sticky_preference() {
        let http = ScriptedTransport::new(
            "http",
            vec![
                Err(TransportError::Http("down".into())),
                // Exhausted afterwards — must not be called again.
            ],
        );
        let cli = ScriptedTransport::new(
            "cli",
            vec![
                Ok(StatAnswer {
                    value: 10,
                    found: true,
                }),
                Ok(StatAnswer {
                    value: 20,
                    found: true,
                }),
            ],
        );
        let dual = DualStatTransport::new(http.clone(), cli.clone());

        // First call: http fails, cli answers — preference flips to cli.
        let a = dual.query_stat("p", false).await.unwrap();
        assert_eq!(a.value, 10);
        assert_eq!(dual.preferred(), "cli");

        // Second call goes straight to cli.
        let b = dual.query_stat("p", false).await.unwrap();
        assert_eq!(b.value, 20);
        assert_eq!(http.calls(), 1);
        assert_eq!(cli.calls(), 2);
    }

    #[tokio::test]
    async fn test_dual_propagates_last_error_when_both_fail() {
        let http = ScriptedTransport::new("http", vec![Err(TransportError::Http("h".into()))]);
        let cli = ScriptedTransport::new("cli", vec![Err(TransportError::Cli("c".into()))]);
        let dual = DualStatTransport::new(http, cli);
        let err = dual.query_stat("p", false).await.unwrap_err();
        assert!(matches!(err, TransportError::Cli(_)));
    }
}
