//! One-UI control plane entry point: composition root and operator CLI.

use clap::{Parser, Subcommand};
use oneui::apply::{ApplyEngine, ApplyMethod};
use oneui::config::{Config, UpdateChannel};
use oneui::devices::DeviceTracker;
use oneui::metrics::Metrics;
use oneui::online::OnlineTracker;
use oneui::process::{CommandRunner, SystemRunner};
use oneui::runtime::RuntimeInspector;
use oneui::stats::{
    CliStatTransport, DualStatTransport, HttpStatTransport, StatTransport, StatsCollector,
};
use oneui::store::{MemoryStore, Store};
use oneui::update::{UpdateCoordinator, UpdateOptions};
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Version string including build timestamp for --version output
fn version_long() -> &'static str {
    static V: std::sync::OnceLock<String> = std::sync::OnceLock::new();
    V.get_or_init(|| {
        format!(
            "{} (built {})",
            env!("CARGO_PKG_VERSION"),
            env!("ONEUI_BUILD_TIME"),
        )
    })
}

/// One-UI — control plane for a multi-protocol proxy data plane
#[derive(Parser, Debug)]
#[command(name = "oneui")]
#[command(version = version_long())]
#[command(author, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the control plane (collector and trackers) until signalled
    Run,
    /// Reconcile the domain model into the data plane once
    Apply {
        /// Activation method
        #[arg(long, value_enum, default_value = "hot")]
        method: CliApplyMethod,
        /// Skip the before-apply snapshot
        #[arg(long)]
        no_snapshot: bool,
    },
    /// Print runtime status and update policy
    Status,
    /// Run the update preflight checks
    Preflight,
    /// Data-plane update actions
    Update {
        #[command(subcommand)]
        action: UpdateCommand,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliApplyMethod {
    Hot,
    Restart,
    None,
}

impl From<CliApplyMethod> for ApplyMethod {
    fn from(value: CliApplyMethod) -> Self {
        match value {
            CliApplyMethod::Hot => ApplyMethod::Hot,
            CliApplyMethod::Restart => ApplyMethod::Restart,
            CliApplyMethod::None => ApplyMethod::None,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum CliChannel {
    Stable,
    Latest,
}

impl From<CliChannel> for UpdateChannel {
    fn from(value: CliChannel) -> Self {
        match value {
            CliChannel::Stable => UpdateChannel::Stable,
            CliChannel::Latest => UpdateChannel::Latest,
        }
    }
}

#[derive(Subcommand, Debug)]
enum UpdateCommand {
    /// No-restart rehearsal of the update procedure
    Canary {
        #[arg(long, value_enum)]
        channel: Option<CliChannel>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        no_rollback: bool,
        #[arg(long)]
        force: bool,
    },
    /// Full update; requires a recent canary unless forced
    Full {
        #[arg(long, value_enum)]
        channel: Option<CliChannel>,
        #[arg(long)]
        image: Option<String>,
        #[arg(long)]
        no_rollback: bool,
        #[arg(long)]
        force: bool,
    },
    /// Restore a backup tag (newest when unspecified)
    Rollback {
        #[arg(long)]
        tag: Option<String>,
    },
    /// Clear the update lock
    Unlock {
        #[arg(long, default_value = "operator request")]
        reason: String,
        #[arg(long)]
        force: bool,
    },
}

/// Everything the subcommands operate on, built once in dependency order.
struct App {
    store: Arc<dyn Store>,
    metrics: Arc<Metrics>,
    inspector: Arc<RuntimeInspector>,
    transport: Arc<dyn StatTransport>,
    engine: ApplyEngine,
    coordinator: UpdateCoordinator,
    config: Config,
}

impl App {
    async fn build(config: Config) -> Result<Self, Box<dyn std::error::Error>> {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());

        let metrics = Arc::new(Metrics::new());
        metrics.process_start_time_seconds.set(
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs_f64(),
        );
        metrics
            .build_info
            .with_label_values(&[env!("CARGO_PKG_VERSION")])
            .set(1.0);

        let inspector = Arc::new(RuntimeInspector::new(
            runner.clone(),
            config.data_plane.clone(),
        ));

        let cli_transport: Arc<dyn StatTransport> = Arc::new(CliStatTransport::new(
            runner.clone(),
            config.data_plane.binary_path.display().to_string(),
            config.stats.cli_server.clone(),
            config.stats.cli_timeout_clamped(),
        ));
        let transport: Arc<dyn StatTransport> = match &config.stats.http_base_url {
            Some(base) => {
                let http = Arc::new(HttpStatTransport::new(
                    base.clone(),
                    config.stats.http_timeout,
                )?);
                Arc::new(DualStatTransport::new(http, cli_transport))
            }
            None => Arc::new(DualStatTransport::single(cli_transport)),
        };

        let engine = ApplyEngine::new(
            store.clone(),
            inspector.clone(),
            config.clone(),
            Some(metrics.clone()),
        )
        .await?;

        let coordinator = UpdateCoordinator::new(
            store.clone(),
            runner,
            inspector.clone(),
            config.clone(),
            Some(metrics.clone()),
        );

        Ok(Self {
            store,
            metrics,
            inspector,
            transport,
            engine,
            coordinator,
            config,
        })
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Priority: RUST_LOG > ONEUI_LOG_LEVEL > --verbose > config default
    let config = if let Some(ref path) = cli.config {
        let mut config = Config::from_file(path)?;
        config.apply_env();
        config
    } else {
        Config::load()
    };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| std::env::var("ONEUI_LOG_LEVEL").map(EnvFilter::new))
        .unwrap_or_else(|_| {
            if cli.verbose {
                EnvFilter::new("oneui=trace")
            } else {
                EnvFilter::new(config.log_level.clone())
            }
        });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!(
        "One-UI v{} (built {})",
        env!("CARGO_PKG_VERSION"),
        env!("ONEUI_BUILD_TIME"),
    );

    let app = App::build(config).await?;

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => run_control_plane(app).await,
        Command::Apply { method, no_snapshot } => {
            let cancel = CancellationToken::new();
            let outcome = app
                .engine
                .apply(method.into(), !no_snapshot, &cancel)
                .await?;
            println!(
                "applied: requested={:?} effective={:?} fallback={} snapshot={}",
                outcome.requested,
                outcome.effective,
                outcome.fallback_used,
                outcome.snapshot_id.as_deref().unwrap_or("-"),
            );
            Ok(())
        }
        Command::Status => {
            let status = app.inspector.inspect().await;
            let policy = app.coordinator.policy().await;
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "runtime": {
                    "mode": status.mode,
                    "running": status.running,
                    "state": status.state,
                    "hintMismatch": status.hint_mismatch,
                },
                "updatePolicy": policy,
            }))?);
            Ok(())
        }
        Command::Preflight => {
            let report = app.coordinator.preflight().await;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.ready {
                Ok(())
            } else {
                std::process::exit(1);
            }
        }
        Command::Update { action } => run_update(app, action).await,
    }
}

async fn run_update(app: App, action: UpdateCommand) -> Result<(), Box<dyn std::error::Error>> {
    match action {
        UpdateCommand::Canary {
            channel,
            image,
            no_rollback,
            force,
        } => {
            let report = app
                .coordinator
                .run_canary(UpdateOptions {
                    channel: channel.map(Into::into),
                    image,
                    no_rollback,
                    force,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        UpdateCommand::Full {
            channel,
            image,
            no_rollback,
            force,
        } => {
            let report = app
                .coordinator
                .run_full(UpdateOptions {
                    channel: channel.map(Into::into),
                    image,
                    no_rollback,
                    force,
                })
                .await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        UpdateCommand::Rollback { tag } => {
            let report = app.coordinator.rollback(tag).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        UpdateCommand::Unlock { reason, force } => {
            let outcome = app.coordinator.unlock(&reason, force).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }
    Ok(())
}

async fn run_control_plane(app: App) -> Result<(), Box<dyn std::error::Error>> {
    let cancel = CancellationToken::new();

    let devices = Arc::new(DeviceTracker::new(
        app.config.tracking.device_tracking_ttl_clamped(),
    ));
    let online = Arc::new(OnlineTracker::new(
        app.store.clone(),
        devices.clone(),
        app.transport.clone(),
        app.config.tracking.clone(),
    ));
    // The session stream hands this tracker out to push consumers; the
    // outer surface wiring belongs to the HTTP collaborator.
    let _stream = oneui::stream::SessionStream::new(online.clone(), cancel.clone());

    let collector = Arc::new(StatsCollector::new(
        app.store.clone(),
        app.transport.clone(),
        Some(app.metrics.clone()),
        app.config.stats.interval_clamped(),
    ));
    let collector_task = tokio::spawn(collector.clone().run(cancel.clone()));

    info!("control plane running; waiting for shutdown signal");
    shutdown_signal().await;

    // Shutdown reverses construction order.
    cancel.cancel();
    if let Err(err) = collector_task.await {
        warn!(error = %err, "collector task join failed");
    }
    info!("shutdown complete");
    Ok(())
}

/// Handle shutdown signals (SIGINT, SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            warn!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            warn!("Received SIGTERM, initiating graceful shutdown...");
        }
    }
}
