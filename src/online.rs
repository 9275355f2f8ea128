//! Online tracker: one heartbeat view per user, merged from recent
//! connection logs, recent traffic logs, and tracked devices.
//!
//! The cache swaps in atomically; readers see either the previous or the
//! new map, never a partial one. Refreshes are throttled and coalesced to
//! a single in-flight invocation.

use crate::devices::{DeviceRecord, DeviceTracker};
use crate::stats::transport::StatTransport;
use crate::store::{Store, StoreError};
use crate::types::{
    user_stat_key, ActiveUser, ConnectionAction, ConnectionLog, Direction, TrafficLog,
};
use arc_swap::ArcSwap;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// Classified user presence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnlineState {
    Online,
    Idle,
    Offline,
}

/// Derived per-user online record.
#[derive(Debug, Clone, Serialize)]
pub struct HeartbeatEntry {
    pub user_id: i64,
    pub user_uuid: Uuid,
    pub email: String,
    pub online: bool,
    pub state: OnlineState,
    /// The window that classified this entry, in milliseconds.
    pub online_window_ms: u64,
    /// Inbound ids with a fresh connect.
    pub active_inbounds: Vec<i64>,
    /// Inbound of the newest connect, fresh or not.
    pub current_inbound: Option<i64>,
    /// Distinct client IPs across fresh connects and devices.
    pub client_ips: Vec<String>,
    pub active_devices: usize,
    pub traffic_active: bool,
    pub open_connect: bool,
    pub last_connect_at: Option<DateTime<Utc>>,
    /// Live absolute counters for UI throughput; zero when unavailable.
    #[serde(with = "crate::types::string_u64")]
    pub live_uplink: u64,
    #[serde(with = "crate::types::string_u64")]
    pub live_downlink: u64,
}

/// The classification windows, precomputed from tracking config.
#[derive(Debug, Clone, Copy)]
struct Windows {
    ttl: Duration,
    idle_ttl: Duration,
    traffic_ttl: Duration,
    device_ttl: Duration,
}

impl Windows {
    fn from_tracking(tracking: &crate::config::TrackingConfig) -> Self {
        let ttl = Duration::from_std(tracking.online_ttl_clamped()).unwrap();
        let idle_ttl = Duration::from_std(tracking.idle_ttl_clamped()).unwrap();
        let device_raw = Duration::from_std(tracking.device_online_ttl_clamped()).unwrap();
        Self {
            ttl,
            idle_ttl,
            // Traffic stays meaningful a bit longer than a single connect,
            // but never longer than five minutes.
            traffic_ttl: ttl.max(idle_ttl.min(Duration::minutes(5))),
            device_ttl: device_raw.clamp(ttl, idle_ttl.max(ttl)),
        }
    }

    fn lookback(&self) -> Duration {
        (self.ttl * 4).max(Duration::minutes(15))
    }
}

/// Pure heartbeat derivation for one user.
fn derive_entry(
    user: &ActiveUser,
    connections: &[&ConnectionLog],
    traffic: &[&TrafficLog],
    devices: &[DeviceRecord],
    windows: &Windows,
    now: DateTime<Utc>,
) -> HeartbeatEntry {
    // Active inbound set: distinct inbounds with a connect younger than
    // ttl, deduplicated by (user, inbound, ip).
    let mut seen_connects: HashSet<(i64, String)> = HashSet::new();
    let mut active_inbounds: Vec<i64> = Vec::new();
    let mut client_ips: Vec<String> = Vec::new();
    let mut newest_connect: Option<&ConnectionLog> = None;
    let mut newest_disconnect: Option<&ConnectionLog> = None;

    for log in connections {
        match log.action {
            ConnectionAction::Connect => {
                if newest_connect.map(|c| log.timestamp > c.timestamp).unwrap_or(true) {
                    newest_connect = Some(log);
                }
                if now - log.timestamp <= windows.ttl
                    && seen_connects.insert((log.inbound_id, log.client_ip.clone()))
                {
                    if !active_inbounds.contains(&log.inbound_id) {
                        active_inbounds.push(log.inbound_id);
                    }
                    if !client_ips.contains(&log.client_ip) {
                        client_ips.push(log.client_ip.clone());
                    }
                }
            }
            ConnectionAction::Disconnect => {
                if newest_disconnect
                    .map(|d| log.timestamp > d.timestamp)
                    .unwrap_or(true)
                {
                    newest_disconnect = Some(log);
                }
            }
        }
    }

    let traffic_active = traffic
        .iter()
        .map(|t| t.timestamp)
        .max()
        .map(|newest| now - newest <= windows.traffic_ttl)
        .unwrap_or(false);

    let open_connect = match newest_connect {
        Some(connect) => {
            now - connect.timestamp <= windows.idle_ttl
                && newest_disconnect
                    .map(|d| connect.timestamp > d.timestamp)
                    .unwrap_or(true)
        }
        None => false,
    };

    let active_devices: Vec<&DeviceRecord> = devices
        .iter()
        .filter(|d| now - d.last_seen_at <= windows.device_ttl)
        .collect();
    for device in &active_devices {
        if let Some(inbound) = device.inbound_id {
            if !active_inbounds.contains(&inbound) {
                active_inbounds.push(inbound);
            }
        }
        if let Some(ip) = &device.client_ip {
            if !client_ips.contains(ip) {
                client_ips.push(ip.clone());
            }
        }
    }

    let online = !active_inbounds.is_empty()
        || traffic_active
        || open_connect
        || !active_devices.is_empty();

    let state = if online {
        OnlineState::Online
    } else if newest_connect
        .map(|c| {
            newest_disconnect
                .map(|d| c.timestamp > d.timestamp)
                .unwrap_or(true)
        })
        .unwrap_or(false)
    {
        OnlineState::Idle
    } else {
        OnlineState::Offline
    };

    // The window that made the classification: the connect window when a
    // fresh connect did it, wider for traffic-only, widest for idle and
    // device-only presence.
    let window = if !seen_connects.is_empty() {
        windows.ttl
    } else if traffic_active {
        windows.traffic_ttl
    } else if open_connect {
        windows.idle_ttl
    } else if !active_devices.is_empty() {
        windows.device_ttl
    } else {
        windows.idle_ttl
    };

    HeartbeatEntry {
        user_id: user.id,
        user_uuid: user.uuid,
        email: user.email.clone(),
        online,
        state,
        online_window_ms: window.num_milliseconds().max(0) as u64,
        active_inbounds,
        current_inbound: newest_connect.map(|c| c.inbound_id),
        client_ips,
        active_devices: active_devices.len(),
        traffic_active,
        open_connect,
        last_connect_at: newest_connect.map(|c| c.timestamp),
        live_uplink: 0,
        live_downlink: 0,
    }
}

/// Heartbeat cache with throttled, single-flight refresh.
pub struct OnlineTracker {
    store: Arc<dyn Store>,
    devices: Arc<DeviceTracker>,
    transport: Arc<dyn StatTransport>,
    tracking: crate::config::TrackingConfig,
    cache: ArcSwap<HashMap<Uuid, HeartbeatEntry>>,
    last_refresh: parking_lot::Mutex<Option<Instant>>,
    refresh_gate: tokio::sync::Mutex<()>,
}

impl OnlineTracker {
    pub fn new(
        store: Arc<dyn Store>,
        devices: Arc<DeviceTracker>,
        transport: Arc<dyn StatTransport>,
        tracking: crate::config::TrackingConfig,
    ) -> Self {
        Self {
            store,
            devices,
            transport,
            tracking,
            cache: ArcSwap::from_pointee(HashMap::new()),
            last_refresh: parking_lot::Mutex::new(None),
            refresh_gate: tokio::sync::Mutex::new(()),
        }
    }

    fn is_fresh(&self) -> bool {
        let last = *self.last_refresh.lock();
        last.map(|at| at.elapsed() < self.tracking.refresh_interval_clamped())
            .unwrap_or(false)
    }

    /// Refresh unless the cache is younger than the refresh interval.
    /// Concurrent callers coalesce: one refresh runs, the rest await it and
    /// read its result.
    pub async fn ensure_fresh(&self) -> Result<(), StoreError> {
        if self.is_fresh() {
            return Ok(());
        }
        let _gate = self.refresh_gate.lock().await;
        if self.is_fresh() {
            // Someone else refreshed while this caller waited on the gate.
            return Ok(());
        }
        self.refresh().await?;
        *self.last_refresh.lock() = Some(Instant::now());
        Ok(())
    }

    /// Unconditional rebuild of the heartbeat map.
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let now = Utc::now();
        let windows = Windows::from_tracking(&self.tracking);
        let since = now - windows.lookback();

        let users = self.store.active_users().await?;
        let connections = self.store.connection_logs_since(since).await?;
        let traffic = self.store.traffic_logs_since(since).await?;

        let mut conns_by_user: HashMap<i64, Vec<&ConnectionLog>> = HashMap::new();
        for log in &connections {
            conns_by_user.entry(log.user_id).or_default().push(log);
        }
        let mut traffic_by_user: HashMap<i64, Vec<&TrafficLog>> = HashMap::new();
        for log in &traffic {
            traffic_by_user.entry(log.user_id).or_default().push(log);
        }

        let device_ttl = windows.device_ttl.to_std().unwrap_or_default();
        let mut map = HashMap::with_capacity(users.len());
        for user in &users {
            let devices = self.devices.list_active(user.id, device_ttl);
            let entry = derive_entry(
                user,
                conns_by_user.get(&user.id).map(|v| v.as_slice()).unwrap_or(&[]),
                traffic_by_user.get(&user.id).map(|v| v.as_slice()).unwrap_or(&[]),
                &devices,
                &windows,
                now,
            );
            map.insert(user.uuid, entry);
        }

        // Live counters for every online user, fetched concurrently.
        let online_users: Vec<&ActiveUser> = users
            .iter()
            .filter(|u| map.get(&u.uuid).map(|e| e.online).unwrap_or(false))
            .collect();
        let live = futures::future::join_all(
            online_users.iter().map(|user| self.read_live_counters(user)),
        )
        .await;
        for (user, (uplink, downlink)) in online_users.iter().zip(live) {
            if let Some(entry) = map.get_mut(&user.uuid) {
                entry.live_uplink = uplink;
                entry.live_downlink = downlink;
            }
        }

        self.cache.store(Arc::new(map));
        Ok(())
    }

    /// Live absolute counters for the UI; read failures degrade to zeroes.
    async fn read_live_counters(&self, user: &ActiveUser) -> (u64, u64) {
        for key in user.stat_key_candidates() {
            let up = self
                .transport
                .query_stat(&user_stat_key(&key, Direction::Uplink), false)
                .await;
            let down = self
                .transport
                .query_stat(&user_stat_key(&key, Direction::Downlink), false)
                .await;
            match (up, down) {
                (Ok(up), Ok(down)) if up.found || down.found => {
                    return (up.value, down.value);
                }
                (Err(err), _) | (_, Err(err)) => {
                    debug!(user = user.id, error = %err, "live counter read failed");
                    return (0, 0);
                }
                _ => {}
            }
        }
        (0, 0)
    }

    pub async fn heartbeat_by_uuid(
        &self,
        uuid: &Uuid,
    ) -> Result<Option<HeartbeatEntry>, StoreError> {
        self.ensure_fresh().await?;
        Ok(self.cache.load().get(uuid).cloned())
    }

    pub async fn heartbeats_for_users(
        &self,
        user_ids: &[i64],
    ) -> Result<HashMap<i64, HeartbeatEntry>, StoreError> {
        self.ensure_fresh().await?;
        let cache = self.cache.load();
        Ok(cache
            .values()
            .filter(|entry| user_ids.contains(&entry.user_id))
            .map(|entry| (entry.user_id, entry.clone()))
            .collect())
    }

    pub async fn online_users(&self) -> Result<Vec<HeartbeatEntry>, StoreError> {
        self.ensure_fresh().await?;
        let mut online: Vec<HeartbeatEntry> = self
            .cache
            .load()
            .values()
            .filter(|entry| entry.online)
            .cloned()
            .collect();
        online.sort_by_key(|e| e.user_id);
        Ok(online)
    }

    /// Every cached entry, online or not, sorted by user id.
    pub async fn all_heartbeats(&self) -> Result<Vec<HeartbeatEntry>, StoreError> {
        self.ensure_fresh().await?;
        let mut entries: Vec<HeartbeatEntry> = self.cache.load().values().cloned().collect();
        entries.sort_by_key(|e| e.user_id);
        Ok(entries)
    }
}
