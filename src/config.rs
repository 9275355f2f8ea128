//! Configuration for the One-UI control plane.

use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Serialize/deserialize `Duration` as humantime strings ("60s", "20m").
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(v: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&humantime::format_duration(*v).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

/// Where the data plane is expected to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentHint {
    Auto,
    Container,
    Service,
    Local,
}

/// Update release channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateChannel {
    Stable,
    Latest,
}

impl UpdateChannel {
    pub fn flag(&self) -> &'static str {
        match self {
            UpdateChannel::Stable => "--stable",
            UpdateChannel::Latest => "--latest",
        }
    }
}

/// Smart routing mode for the generated routing section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoutingMode {
    Smart,
    Filtered,
    Strict,
    Open,
}

/// Data-plane runtime and file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataPlaneConfig {
    /// Deployment hint for the runtime inspector.
    #[serde(default = "default_hint")]
    pub deployment_hint: DeploymentHint,

    /// Container name when running under a container runtime.
    #[serde(default = "default_container")]
    pub container_name: String,

    /// Service unit name when running under a service manager.
    #[serde(default = "default_service")]
    pub service_name: String,

    /// Path to the data-plane binary (validation, CLI stat transport,
    /// local-process start).
    #[serde(default = "default_binary")]
    pub binary_path: PathBuf,

    /// PID file for local-process deployments.
    #[serde(default = "default_pid_file")]
    pub pid_file: PathBuf,

    /// Canonical generated config path consumed by the data plane.
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,

    /// Optional base template merged under generated sections.
    #[serde(default)]
    pub template_path: Option<PathBuf>,

    /// Opt-in fragmented config directory.
    #[serde(default)]
    pub fragment_dir: Option<PathBuf>,

    /// Whether hot reload is attempted before a full restart.
    #[serde(default = "default_true")]
    pub hot_reload: bool,

    /// Post-apply health check retries and pause.
    #[serde(default = "default_verify_retries")]
    pub verify_retries: u32,
    #[serde(default = "default_verify_pause", with = "duration_str")]
    pub verify_pause: Duration,

    /// Loopback listener the generated `api` inbound binds to.
    #[serde(default = "default_api_listen")]
    pub api_listen: SocketAddr,

    /// Extra gRPC services exposed on the api inbound besides StatsService.
    #[serde(default)]
    pub api_services: Vec<String>,

    /// TLS certificate paths handed to TLS-secured inbounds.
    #[serde(default)]
    pub tls_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub tls_key_file: Option<PathBuf>,

    /// Data-plane log level written into the generated config.
    #[serde(default = "default_dp_log_level")]
    pub log_level: String,
}

/// Stat transport endpoints and timeouts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsConfig {
    /// HTTP transport base URL; disabled when unset.
    #[serde(default)]
    pub http_base_url: Option<String>,
    #[serde(default = "default_http_timeout", with = "duration_str")]
    pub http_timeout: Duration,

    /// CLI transport target (`--server=<host:port>`).
    #[serde(default = "default_cli_server")]
    pub cli_server: String,
    #[serde(default = "default_cli_timeout", with = "duration_str")]
    pub cli_timeout: Duration,

    /// Collector tick interval; floored at 5 s.
    #[serde(default = "default_stats_interval", with = "duration_str")]
    pub interval: Duration,
}

/// Online/device tracking windows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackingConfig {
    /// Connect-log freshness window; floored at 5 s.
    #[serde(default = "default_online_ttl", with = "duration_str")]
    pub online_ttl: Duration,

    /// Open-connection idle window; floored at 30 s.
    #[serde(default = "default_idle_ttl", with = "duration_str")]
    pub idle_ttl: Duration,

    /// Device freshness window used for online classification; floored at 30 s.
    #[serde(default = "default_device_online_ttl", with = "duration_str")]
    pub device_online_ttl: Duration,

    /// Device record lifetime in the tracker; floored at 300 s.
    #[serde(default = "default_device_tracking_ttl", with = "duration_str")]
    pub device_tracking_ttl: Duration,

    /// Heartbeat cache refresh throttle; floored at 1 s.
    #[serde(default = "default_refresh_interval", with = "duration_str")]
    pub refresh_interval: Duration,
}

/// Apply-engine snapshot store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_dir")]
    pub dir: PathBuf,
    /// Newest snapshots kept; clamped to 1–500.
    #[serde(default = "default_snapshot_retention")]
    pub retention: usize,
}

/// Update coordinator policy and file locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Fixed name of the global update lock record.
    #[serde(default = "default_lock_name")]
    pub lock_name: String,

    /// Wall-clock budget for one update action.
    #[serde(default = "default_update_timeout", with = "duration_str")]
    pub timeout: Duration,

    #[serde(default = "default_true")]
    pub require_canary_before_full: bool,

    /// How long a canary success authorizes a full update.
    #[serde(default = "default_canary_window_minutes")]
    pub canary_window_minutes: u64,

    #[serde(default = "default_channel")]
    pub default_channel: UpdateChannel,

    /// External update procedure script.
    #[serde(default = "default_update_script")]
    pub script_path: PathBuf,

    /// Compose file the update script operates on.
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Directory holding backup tag metadata and coordinator state.
    #[serde(default = "default_update_dir")]
    pub state_dir: PathBuf,

    /// Backup tags kept; oldest pruned beyond this.
    #[serde(default = "default_backup_retention")]
    pub backup_retention: usize,
}

/// Smart-routing profile for the generated routing section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default = "default_routing_mode")]
    pub mode: RoutingMode,
    /// Domestic CIDR blocks bypassed in smart mode.
    #[serde(default)]
    pub domestic_ips: Vec<IpNet>,
    /// Domestic domain suffixes bypassed in smart mode.
    #[serde(default)]
    pub domestic_domains: Vec<String>,
}

/// Optional observatory (outbound probing) block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservatoryConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_probe_url")]
    pub probe_url: String,
    #[serde(default = "default_probe_interval")]
    pub probe_interval: String,
}

/// Optional outbound balancer block.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_balancer_tag")]
    pub tag: String,
    #[serde(default)]
    pub selector: Vec<String>,
    #[serde(default = "default_balancer_strategy")]
    pub strategy: String,
}

/// Optional WARP outbound.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WarpConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub private_key: String,
    #[serde(default = "default_warp_endpoint")]
    pub endpoint: String,
}

/// Control-plane configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Control-plane log filter (overridden by RUST_LOG / ONEUI_LOG_LEVEL).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub data_plane: DataPlaneConfig,

    #[serde(default)]
    pub stats: StatsConfig,

    #[serde(default)]
    pub tracking: TrackingConfig,

    #[serde(default)]
    pub snapshots: SnapshotConfig,

    #[serde(default)]
    pub update: UpdateConfig,

    #[serde(default)]
    pub routing: RoutingConfig,

    #[serde(default)]
    pub observatory: ObservatoryConfig,

    #[serde(default)]
    pub balancer: BalancerConfig,

    #[serde(default)]
    pub warp: WarpConfig,
}

// Default value functions for serde
fn default_hint() -> DeploymentHint {
    DeploymentHint::Auto
}

fn default_container() -> String {
    "xray".to_string()
}

fn default_service() -> String {
    "xray".to_string()
}

fn default_binary() -> PathBuf {
    PathBuf::from("/usr/local/bin/xray")
}

fn default_pid_file() -> PathBuf {
    PathBuf::from("/var/run/xray.pid")
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/usr/local/etc/xray/config.json")
}

fn default_true() -> bool {
    true
}

fn default_verify_retries() -> u32 {
    6
}

fn default_verify_pause() -> Duration {
    Duration::from_secs(1)
}

fn default_api_listen() -> SocketAddr {
    "127.0.0.1:10085".parse().unwrap()
}

fn default_dp_log_level() -> String {
    "warning".to_string()
}

fn default_http_timeout() -> Duration {
    Duration::from_secs(5)
}

fn default_cli_server() -> String {
    "127.0.0.1:10085".to_string()
}

fn default_cli_timeout() -> Duration {
    Duration::from_secs(7)
}

fn default_stats_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_online_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_idle_ttl() -> Duration {
    Duration::from_secs(75)
}

fn default_device_online_ttl() -> Duration {
    Duration::from_secs(60)
}

fn default_device_tracking_ttl() -> Duration {
    Duration::from_secs(1800)
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_snapshot_dir() -> PathBuf {
    PathBuf::from("/var/lib/oneui/snapshots")
}

fn default_snapshot_retention() -> usize {
    20
}

fn default_lock_name() -> String {
    "oneui-dataplane-update".to_string()
}

fn default_update_timeout() -> Duration {
    Duration::from_secs(20 * 60)
}

fn default_canary_window_minutes() -> u64 {
    240
}

fn default_channel() -> UpdateChannel {
    UpdateChannel::Stable
}

fn default_update_script() -> PathBuf {
    PathBuf::from("/usr/local/bin/oneui-update.sh")
}

fn default_compose_file() -> PathBuf {
    PathBuf::from("/etc/oneui/docker-compose.yml")
}

fn default_update_dir() -> PathBuf {
    PathBuf::from("/var/lib/oneui/update")
}

fn default_backup_retention() -> usize {
    10
}

fn default_routing_mode() -> RoutingMode {
    RoutingMode::Smart
}

fn default_probe_url() -> String {
    "https://www.google.com/generate_204".to_string()
}

fn default_probe_interval() -> String {
    "3m".to_string()
}

fn default_balancer_tag() -> String {
    "balancer".to_string()
}

fn default_balancer_strategy() -> String {
    "leastPing".to_string()
}

fn default_warp_endpoint() -> String {
    "engage.cloudflareclient.com:2408".to_string()
}

fn default_log_level() -> String {
    "oneui=info".to_string()
}

impl Default for DataPlaneConfig {
    fn default() -> Self {
        Self {
            deployment_hint: default_hint(),
            container_name: default_container(),
            service_name: default_service(),
            binary_path: default_binary(),
            pid_file: default_pid_file(),
            config_path: default_config_path(),
            template_path: None,
            fragment_dir: None,
            hot_reload: true,
            verify_retries: default_verify_retries(),
            verify_pause: default_verify_pause(),
            api_listen: default_api_listen(),
            api_services: Vec::new(),
            tls_cert_file: None,
            tls_key_file: None,
            log_level: default_dp_log_level(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            http_base_url: None,
            http_timeout: default_http_timeout(),
            cli_server: default_cli_server(),
            cli_timeout: default_cli_timeout(),
            interval: default_stats_interval(),
        }
    }
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            online_ttl: default_online_ttl(),
            idle_ttl: default_idle_ttl(),
            device_online_ttl: default_device_online_ttl(),
            device_tracking_ttl: default_device_tracking_ttl(),
            refresh_interval: default_refresh_interval(),
        }
    }
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            dir: default_snapshot_dir(),
            retention: default_snapshot_retention(),
        }
    }
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lock_name: default_lock_name(),
            timeout: default_update_timeout(),
            require_canary_before_full: true,
            canary_window_minutes: default_canary_window_minutes(),
            default_channel: default_channel(),
            script_path: default_update_script(),
            compose_file: default_compose_file(),
            state_dir: default_update_dir(),
            backup_retention: default_backup_retention(),
        }
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            mode: default_routing_mode(),
            domestic_ips: Vec::new(),
            domestic_domains: Vec::new(),
        }
    }
}

impl Default for ObservatoryConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            probe_url: default_probe_url(),
            probe_interval: default_probe_interval(),
        }
    }
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            tag: default_balancer_tag(),
            selector: Vec::new(),
            strategy: default_balancer_strategy(),
        }
    }
}

impl Default for WarpConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            private_key: String::new(),
            endpoint: default_warp_endpoint(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            data_plane: DataPlaneConfig::default(),
            stats: StatsConfig::default(),
            tracking: TrackingConfig::default(),
            snapshots: SnapshotConfig::default(),
            update: UpdateConfig::default(),
            routing: RoutingConfig::default(),
            observatory: ObservatoryConfig::default(),
            balancer: BalancerConfig::default(),
            warp: WarpConfig::default(),
        }
    }
}

impl StatsConfig {
    /// Collector tick interval, floored at 5 s.
    pub fn interval_clamped(&self) -> Duration {
        self.interval.max(Duration::from_secs(5))
    }

    /// CLI transport timeout, floored at 3 s.
    pub fn cli_timeout_clamped(&self) -> Duration {
        self.cli_timeout.max(Duration::from_secs(3))
    }
}

impl TrackingConfig {
    pub fn online_ttl_clamped(&self) -> Duration {
        self.online_ttl.max(Duration::from_secs(5))
    }

    pub fn idle_ttl_clamped(&self) -> Duration {
        self.idle_ttl.max(Duration::from_secs(30))
    }

    pub fn device_online_ttl_clamped(&self) -> Duration {
        self.device_online_ttl.max(Duration::from_secs(30))
    }

    pub fn device_tracking_ttl_clamped(&self) -> Duration {
        self.device_tracking_ttl.max(Duration::from_secs(300))
    }

    pub fn refresh_interval_clamped(&self) -> Duration {
        self.refresh_interval.max(Duration::from_secs(1))
    }
}

impl SnapshotConfig {
    pub fn retention_clamped(&self) -> usize {
        self.retention.clamp(1, 500)
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(config)
    }

    /// Overlay environment variables on an existing config.
    pub fn apply_env(&mut self) {
        if let Ok(v) = std::env::var("ONEUI_LOG_LEVEL") {
            self.log_level = v;
        }
        if let Ok(v) = std::env::var("ONEUI_DEPLOYMENT_HINT") {
            match v.as_str() {
                "container" => self.data_plane.deployment_hint = DeploymentHint::Container,
                "service" => self.data_plane.deployment_hint = DeploymentHint::Service,
                "local" => self.data_plane.deployment_hint = DeploymentHint::Local,
                "auto" => self.data_plane.deployment_hint = DeploymentHint::Auto,
                _ => {}
            }
        }
        if let Ok(v) = std::env::var("ONEUI_CONTAINER_NAME") {
            self.data_plane.container_name = v;
        }
        if let Ok(v) = std::env::var("ONEUI_SERVICE_NAME") {
            self.data_plane.service_name = v;
        }
        if let Ok(v) = std::env::var("ONEUI_XRAY_BINARY") {
            self.data_plane.binary_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ONEUI_CONFIG_PATH") {
            self.data_plane.config_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ONEUI_FRAGMENT_DIR") {
            self.data_plane.fragment_dir = Some(PathBuf::from(v));
        }
        if let Ok(v) = std::env::var("ONEUI_STATS_HTTP_URL") {
            self.stats.http_base_url = Some(v);
        }
        if let Ok(v) = std::env::var("ONEUI_STATS_CLI_SERVER") {
            self.stats.cli_server = v;
        }
        if let Ok(v) = std::env::var("ONEUI_STATS_INTERVAL") {
            if let Ok(parsed) = humantime::parse_duration(&v) {
                self.stats.interval = parsed;
            }
        }
        if let Ok(v) = std::env::var("ONEUI_SNAPSHOT_DIR") {
            self.snapshots.dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ONEUI_SNAPSHOT_RETENTION") {
            if let Ok(parsed) = v.parse() {
                self.snapshots.retention = parsed;
            }
        }
        if let Ok(v) = std::env::var("ONEUI_UPDATE_SCRIPT") {
            self.update.script_path = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ONEUI_UPDATE_STATE_DIR") {
            self.update.state_dir = PathBuf::from(v);
        }
    }

    /// Load configuration from file if it exists, otherwise defaults;
    /// environment variables overlay either source.
    pub fn load() -> Self {
        let mut config = if let Ok(path) = std::env::var("ONEUI_CONFIG") {
            Self::from_file(&path).unwrap_or_default()
        } else {
            let mut found = None;
            for path in &["oneui.toml", "/etc/oneui/config.toml"] {
                if std::path::Path::new(path).exists() {
                    if let Ok(config) = Self::from_file(path) {
                        found = Some(config);
                        break;
                    }
                }
            }
            found.unwrap_or_default()
        };
        config.apply_env();
        config
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
