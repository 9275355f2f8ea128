//! Core domain types for the One-UI control plane.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Tool version identifier — uses crate name and version from Cargo.toml
pub const ONEUI_TOOL: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

/// Traffic direction for data-plane stat counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Uplink,
    Downlink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Uplink => f.write_str("uplink"),
            Direction::Downlink => f.write_str("downlink"),
        }
    }
}

/// Stat key for a user-scoped counter: `user>>><key>>>>traffic>>>uplink`
/// where `<key>` is the user's email or uuid.
pub fn user_stat_key(key: &str, direction: Direction) -> String {
    format!("user>>>{key}>>>traffic>>>{direction}")
}

/// Stat key for an inbound-scoped counter: `inbound>>><tag>>>>traffic>>>downlink`.
pub fn inbound_stat_key(tag: &str, direction: Direction) -> String {
    format!("inbound>>>{tag}>>>traffic>>>{direction}")
}

/// Normalize a counter value from a wire payload.
///
/// The data plane reports unsigned 64-bit counters, but transports deliver
/// them as JSON numbers, decimal strings, or bigint-ish strings ("123n").
/// Anything non-parseable, negative, or non-finite is 0.
pub fn normalize_counter(value: &serde_json::Value) -> u64 {
    match value {
        serde_json::Value::Number(n) => {
            if let Some(u) = n.as_u64() {
                u
            } else if let Some(f) = n.as_f64() {
                if f.is_finite() && f >= 0.0 {
                    f as u64
                } else {
                    0
                }
            } else {
                0
            }
        }
        serde_json::Value::String(s) => {
            let s = s.trim().trim_end_matches('n');
            s.parse::<u64>().unwrap_or(0)
        }
        _ => 0,
    }
}

/// Serialize u64 counters as decimal strings so they survive JSON consumers
/// that truncate to f64; deserialization accepts either form.
pub mod string_u64 {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(v: &u64, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&v.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<u64, D::Error> {
        let raw = serde_json::Value::deserialize(d)?;
        Ok(super::normalize_counter(&raw))
    }
}

/// Wire protocols terminated by the data plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    Socks,
    Http,
    #[serde(rename = "dokodemo-door")]
    DokodemoDoor,
    Wireguard,
    Mtproto,
}

impl Protocol {
    /// Protocols that authenticate individual clients. Inbounds for these
    /// are omitted from the generated config when no user is assigned.
    pub fn requires_clients(&self) -> bool {
        matches!(
            self,
            Protocol::Vless | Protocol::Vmess | Protocol::Trojan | Protocol::Shadowsocks
        )
    }

    /// Data-plane config name for this protocol.
    pub fn wire_name(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Vmess => "vmess",
            Protocol::Trojan => "trojan",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Socks => "socks",
            Protocol::Http => "http",
            Protocol::DokodemoDoor => "dokodemo-door",
            Protocol::Wireguard => "wireguard",
            Protocol::Mtproto => "mtproto",
        }
    }
}

/// Stream transport for an inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Ws,
    Grpc,
    Http,
    Httpupgrade,
    Xhttp,
}

impl Network {
    pub fn wire_name(&self) -> &'static str {
        match self {
            Network::Tcp => "tcp",
            Network::Ws => "ws",
            Network::Grpc => "grpc",
            Network::Http => "http",
            Network::Httpupgrade => "httpupgrade",
            Network::Xhttp => "xhttp",
        }
    }
}

/// Security layer for an inbound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Security {
    None,
    Tls,
    Reality,
}

/// The 2022 AEAD Shadowsocks family needs a server-level PSK and omits the
/// per-client method; the legacy family carries the method on every client.
pub fn is_ss2022_cipher(method: &str) -> bool {
    method.starts_with("2022-")
}

/// A protocol listener exposed by the data plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Inbound {
    pub id: i64,
    /// Unique, non-empty tag used in stats keys and routing rules.
    pub tag: String,
    /// Free-text operator label.
    #[serde(default)]
    pub remark: String,
    pub protocol: Protocol,
    pub network: Network,
    pub security: Security,
    pub port: u16,
    pub enabled: bool,

    // Transport-specific fields. Only the ones relevant for the inbound's
    // network/security are consulted by the generator.
    #[serde(default)]
    pub ws_path: Option<String>,
    #[serde(default)]
    pub ws_host: Option<String>,
    #[serde(default)]
    pub grpc_service_name: Option<String>,
    #[serde(default)]
    pub xhttp_mode: Option<String>,

    // TLS
    #[serde(default)]
    pub tls_server_name: Option<String>,

    // REALITY (valid only with VLESS)
    #[serde(default)]
    pub reality_private_key: Option<String>,
    #[serde(default)]
    pub reality_public_key: Option<String>,
    #[serde(default)]
    pub reality_server_names: Vec<String>,
    #[serde(default)]
    pub reality_short_ids: Vec<String>,
    #[serde(default)]
    pub reality_dest: Option<String>,

    // WireGuard
    #[serde(default)]
    pub wg_private_key: Option<String>,
    #[serde(default)]
    pub wg_peer_public_key: Option<String>,
    #[serde(default)]
    pub wg_addresses: Vec<String>,
    #[serde(default)]
    pub wg_endpoint: Option<String>,
    #[serde(default)]
    pub wg_mtu: Option<u16>,

    // Shadowsocks
    #[serde(default)]
    pub ss_method: Option<String>,

    // Dokodemo
    #[serde(default)]
    pub dokodemo_target: Option<String>,
    #[serde(default)]
    pub dokodemo_port: Option<u16>,

    /// Ordered fallback list (VLESS/Trojan), passed through to the data plane.
    #[serde(default)]
    pub fallbacks: Vec<serde_json::Value>,
}

impl Inbound {
    /// Minimal enabled inbound; transport-specific fields start unset.
    pub fn new(
        id: i64,
        tag: impl Into<String>,
        protocol: Protocol,
        network: Network,
        security: Security,
        port: u16,
    ) -> Self {
        Self {
            id,
            tag: tag.into(),
            remark: String::new(),
            protocol,
            network,
            security,
            port,
            enabled: true,
            ws_path: None,
            ws_host: None,
            grpc_service_name: None,
            xhttp_mode: None,
            tls_server_name: None,
            reality_private_key: None,
            reality_public_key: None,
            reality_server_names: Vec::new(),
            reality_short_ids: Vec::new(),
            reality_dest: None,
            wg_private_key: None,
            wg_peer_public_key: None,
            wg_addresses: Vec::new(),
            wg_endpoint: None,
            wg_mtu: None,
            ss_method: None,
            dokodemo_target: None,
            dokodemo_port: None,
            fallbacks: Vec::new(),
        }
    }
}

/// Account lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UserStatus {
    Active,
    Limited,
    Expired,
    Disabled,
}

/// A proxy account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub id: i64,
    /// Unique; primary stat key candidate.
    pub email: String,
    /// Unique; secondary stat key candidate and heartbeat cache key.
    pub uuid: uuid::Uuid,
    /// Credential for password-based protocols (Trojan, Shadowsocks).
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub subscription_token: String,
    pub status: UserStatus,
    /// Byte cap; 0 means unlimited.
    #[serde(with = "string_u64")]
    pub data_limit: u64,
    #[serde(with = "string_u64")]
    pub upload_used: u64,
    #[serde(with = "string_u64")]
    pub download_used: u64,
    #[serde(default)]
    pub expire_date: Option<DateTime<Utc>>,
    /// 0 means unlimited.
    #[serde(default)]
    pub ip_limit: u32,
    /// 0 means unlimited.
    #[serde(default)]
    pub device_limit: u32,
    #[serde(default)]
    pub note: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Derive the status this user should be in at `now`. The stored status
    /// only wins when it is DISABLED (an explicit operator action).
    pub fn effective_status(&self, now: DateTime<Utc>) -> UserStatus {
        if self.status == UserStatus::Disabled {
            return UserStatus::Disabled;
        }
        if let Some(expire) = self.expire_date {
            if now > expire {
                return UserStatus::Expired;
            }
        }
        if self.data_limit > 0
            && self.upload_used.saturating_add(self.download_used) >= self.data_limit
        {
            return UserStatus::Limited;
        }
        self.status
    }

    /// Stat key candidates, tried in order by the collector.
    pub fn stat_key_candidates(&self) -> Vec<String> {
        let mut keys = vec![self.email.clone()];
        let uuid = self.uuid.to_string();
        if uuid != self.email {
            keys.push(uuid);
        }
        keys
    }
}

/// Direct user↔inbound assignment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserInbound {
    pub user_id: i64,
    pub inbound_id: i64,
    pub enabled: bool,
    /// Ordering weight in generated subscriptions, 1–9999.
    pub priority: u16,
}

/// Named collection of inbounds with shared defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Group {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroupInbound {
    pub group_id: i64,
    pub inbound_id: i64,
    pub enabled: bool,
    pub priority: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
    pub user_id: i64,
    pub group_id: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionAction {
    Connect,
    Disconnect,
}

/// Append-only record of a data-plane connection event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionLog {
    pub user_id: i64,
    pub inbound_id: i64,
    pub action: ConnectionAction,
    pub client_ip: String,
    pub timestamp: DateTime<Utc>,
}

/// Append-only record of a traffic delta attributed to a user.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrafficLog {
    pub user_id: i64,
    #[serde(with = "string_u64")]
    pub upload: u64,
    #[serde(with = "string_u64")]
    pub download: u64,
    pub timestamp: DateTime<Utc>,
}

/// Severity of an update coordinator history entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HistoryLevel {
    Info,
    Warning,
    Error,
    Critical,
}

/// Append-only audit record of an update coordinator action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateHistoryEntry {
    pub level: HistoryLevel,
    pub message: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

/// Persisted global mutual-exclusion record for data-plane upgrades.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateLock {
    pub name: String,
    pub owner_id: String,
    pub expires_at: DateTime<Utc>,
}

impl UpdateLock {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// Reference to an inbound inside a user projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundRef {
    pub id: i64,
    pub tag: String,
}

/// Compact projection of an active user with their enabled inbounds,
/// as consumed by the stats collector and online tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveUser {
    pub id: i64,
    pub email: String,
    pub uuid: uuid::Uuid,
    pub inbounds: Vec<InboundRef>,
}

impl ActiveUser {
    pub fn stat_key_candidates(&self) -> Vec<String> {
        let mut keys = vec![self.email.clone()];
        let uuid = self.uuid.to_string();
        if uuid != self.email {
            keys.push(uuid);
        }
        keys
    }
}
