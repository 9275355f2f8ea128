//! In-memory device tracker.
//!
//! Active (user, fingerprint) records with a freshness TTL, sharded by
//! user id. Writers are the data-plane event ingesters; readers are the
//! online tracker and admin operations. Stale records evict lazily on the
//! next read of that user's shard.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// One tracked device. Never persisted; the map is rebuilt from live
/// traffic after a restart.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceRecord {
    pub user_id: i64,
    pub fingerprint: String,
    pub inbound_id: Option<i64>,
    pub client_ip: Option<String>,
    pub first_seen_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
}

/// Counts removed by a forced disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DisconnectSummary {
    pub devices: usize,
    pub ips: usize,
}

/// Device and IP admission verdicts. The two limits are independent:
/// exceeding one never affects the other's verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionCheck {
    pub device_ok: bool,
    pub ip_ok: bool,
}

impl AdmissionCheck {
    pub fn admitted(&self) -> bool {
        self.device_ok && self.ip_ok
    }
}

/// Sharded map `user_id → { fingerprint → DeviceRecord }`.
pub struct DeviceTracker {
    devices: DashMap<i64, HashMap<String, DeviceRecord>>,
    default_ttl: Duration,
}

impl DeviceTracker {
    pub fn new(default_ttl: std::time::Duration) -> Self {
        Self {
            devices: DashMap::new(),
            default_ttl: Duration::from_std(default_ttl)
                .unwrap_or_else(|_| Duration::seconds(1800)),
        }
    }

    /// Upsert a sighting. `first_seen_at` survives re-touches.
    pub fn touch(
        &self,
        user_id: i64,
        fingerprint: &str,
        inbound_id: Option<i64>,
        client_ip: Option<String>,
    ) {
        let now = Utc::now();
        let mut shard = self.devices.entry(user_id).or_default();
        shard
            .entry(fingerprint.to_string())
            .and_modify(|record| {
                record.last_seen_at = now;
                if inbound_id.is_some() {
                    record.inbound_id = inbound_id;
                }
                if client_ip.is_some() {
                    record.client_ip = client_ip.clone();
                }
            })
            .or_insert_with(|| DeviceRecord {
                user_id,
                fingerprint: fingerprint.to_string(),
                inbound_id,
                client_ip,
                first_seen_at: now,
                last_seen_at: now,
            });
    }

    /// Records seen within `ttl`; stale ones are evicted on the way out.
    pub fn list_active(&self, user_id: i64, ttl: std::time::Duration) -> Vec<DeviceRecord> {
        let ttl = Duration::from_std(ttl).unwrap_or(self.default_ttl);
        let now = Utc::now();
        let Some(mut shard) = self.devices.get_mut(&user_id) else {
            return Vec::new();
        };
        shard.retain(|_, record| now - record.last_seen_at <= self.default_ttl.max(ttl));
        let mut active: Vec<DeviceRecord> = shard
            .values()
            .filter(|record| now - record.last_seen_at <= ttl)
            .cloned()
            .collect();
        active.sort_by(|a, b| a.fingerprint.cmp(&b.fingerprint));
        active
    }

    /// Records within the configured tracking TTL.
    pub fn list_active_default(&self, user_id: i64) -> Vec<DeviceRecord> {
        self.list_active(
            user_id,
            self.default_ttl.to_std().unwrap_or_default(),
        )
    }

    /// Remove one fingerprint. Returns whether a record was released.
    pub fn revoke(&self, user_id: i64, fingerprint: &str) -> bool {
        match self.devices.get_mut(&user_id) {
            Some(mut shard) => {
                let released = shard.remove(fingerprint).is_some();
                if released {
                    debug!(user_id, fingerprint, "device revoked");
                }
                released
            }
            None => false,
        }
    }

    /// Drop every record for the user; reports how many devices and
    /// distinct IPs were cut loose.
    pub fn disconnect_all(&self, user_id: i64) -> DisconnectSummary {
        match self.devices.remove(&user_id) {
            Some((_, shard)) => {
                let ips: HashSet<&String> =
                    shard.values().filter_map(|r| r.client_ip.as_ref()).collect();
                DisconnectSummary {
                    devices: shard.len(),
                    ips: ips.len(),
                }
            }
            None => DisconnectSummary { devices: 0, ips: 0 },
        }
    }

    /// Evaluate both limits for a prospective sighting. A limit of 0 means
    /// unlimited; a fingerprint or IP already active never counts against
    /// its own limit.
    pub fn check_admission(
        &self,
        user_id: i64,
        fingerprint: &str,
        client_ip: Option<&str>,
        device_limit: u32,
        ip_limit: u32,
        ttl: std::time::Duration,
    ) -> AdmissionCheck {
        let active = self.list_active(user_id, ttl);

        let device_ok = device_limit == 0
            || active.iter().any(|r| r.fingerprint == fingerprint)
            || active.len() < device_limit as usize;

        let ip_ok = match (ip_limit, client_ip) {
            (0, _) | (_, None) => true,
            (limit, Some(ip)) => {
                let ips: HashSet<&str> = active
                    .iter()
                    .filter_map(|r| r.client_ip.as_deref())
                    .collect();
                ips.contains(ip) || ips.len() < limit as usize
            }
        };

        AdmissionCheck { device_ok, ip_ok }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    fn tracker() -> DeviceTracker {
        DeviceTracker::new(StdDuration::from_secs(1800))
    }

    #[test]
    fn test_touch_preserves_first_seen() {
        let t = tracker();
        t.touch(1, "fpA", Some(10), Some("1.2.3.4".into()));
        let first = t.list_active_default(1)[0].first_seen_at;

        t.touch(1, "fpA", None, None);
        let records = t.list_active_default(1);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen_at, first);
        assert!(records[0].last_seen_at >= first);
        // Absent fields on re-touch keep the previous values.
        assert_eq!(records[0].inbound_id, Some(10));
        assert_eq!(records[0].client_ip.as_deref(), Some("1.2.3.4"));
    }

    #[test]
    fn test_stale_records_filtered_by_ttl() {
        let t = tracker();
        t.touch(1, "fpA", None, None);
        // Backdate the record past a tiny TTL.
        {
            let mut shard = t.devices.get_mut(&1).unwrap();
            shard.get_mut("fpA").unwrap().last_seen_at = Utc::now() - Duration::seconds(120);
        }
        assert!(t.list_active(1, StdDuration::from_secs(60)).is_empty());
        // Still within the tracking TTL, so a wider window finds it.
        assert_eq!(t.list_active(1, StdDuration::from_secs(300)).len(), 1);
    }

    #[test]
    fn test_lazy_eviction_beyond_tracking_ttl() {
        let t = DeviceTracker::new(StdDuration::from_secs(300));
        t.touch(1, "fpA", None, None);
        {
            let mut shard = t.devices.get_mut(&1).unwrap();
            shard.get_mut("fpA").unwrap().last_seen_at = Utc::now() - Duration::seconds(600);
        }
        assert!(t.list_active(1, StdDuration::from_secs(300)).is_empty());
        // The shard itself was purged, not just filtered.
        assert!(t.devices.get(&1).unwrap().is_empty());
    }

    #[test]
    fn test_revoke() {
        let t = tracker();
        t.touch(1, "fpA", None, None);
        assert!(t.revoke(1, "fpA"));
        assert!(!t.revoke(1, "fpA"));
        assert!(!t.revoke(2, "fpA"));
    }

    #[test]
    fn test_disconnect_all_counts_devices_and_ips() {
        let t = tracker();
        t.touch(1, "fpA", None, Some("1.1.1.1".into()));
        t.touch(1, "fpB", None, Some("1.1.1.1".into()));
        t.touch(1, "fpC", None, Some("2.2.2.2".into()));
        let summary = t.disconnect_all(1);
        assert_eq!(summary.devices, 3);
        assert_eq!(summary.ips, 2);
        assert!(t.list_active_default(1).is_empty());
    }

    #[test]
    fn test_device_limit_enforcement() {
        let t = tracker();
        let ttl = StdDuration::from_secs(60);
        t.touch(2, "fpA", None, None);
        t.touch(2, "fpB", None, None);

        // Third fingerprint is denied while the first two stay valid.
        let check = t.check_admission(2, "fpC", None, 2, 0, ttl);
        assert!(!check.device_ok);
        assert!(check.ip_ok);
        assert!(!check.admitted());
        assert_eq!(t.list_active(2, ttl).len(), 2);

        // A known fingerprint re-admits freely.
        assert!(t.check_admission(2, "fpA", None, 2, 0, ttl).device_ok);
    }

    #[test]
    fn test_ip_limit_independent_of_device_limit() {
        let t = tracker();
        let ttl = StdDuration::from_secs(60);
        t.touch(1, "fpA", None, Some("1.1.1.1".into()));

        // Device limit exceeded, IP fine: verdicts stay independent.
        let check = t.check_admission(1, "fpB", Some("1.1.1.1"), 1, 5, ttl);
        assert!(!check.device_ok);
        assert!(check.ip_ok);

        // IP limit exceeded, device fine.
        let check = t.check_admission(1, "fpB", Some("9.9.9.9"), 5, 1, ttl);
        assert!(check.device_ok);
        assert!(!check.ip_ok);
    }

    #[test]
    fn test_zero_limits_are_unlimited() {
        let t = tracker();
        let ttl = StdDuration::from_secs(60);
        for i in 0..50 {
            t.touch(1, &format!("fp{i}"), None, Some(format!("10.0.0.{i}")));
        }
        let check = t.check_admission(1, "fp-new", Some("10.9.9.9"), 0, 0, ttl);
        assert!(check.admitted());
    }
}
