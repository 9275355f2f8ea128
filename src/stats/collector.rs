//! Periodic stats collector: polls per-user counters off the data plane,
//! turns absolute readings into monotonic deltas, and persists them as
//! quota increments plus traffic log rows.

use crate::metrics::Metrics;
use crate::stats::transport::{StatAnswer, StatTransport, TransportError};
use crate::store::{Store, StoreError};
use crate::types::{inbound_stat_key, user_stat_key, ActiveUser, Direction};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Errors that abort a whole collector tick.
#[derive(Debug, Error)]
pub enum CollectorError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("stat reset failed: {0}")]
    Reset(#[from] TransportError),
}

/// Last observed absolute counters for one stat scope.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Baseline {
    uplink: u64,
    downlink: u64,
}

/// Monotonic delta law: counter regressions (data-plane restart or reset)
/// clamp to zero, and the caller rebases the baseline to the new absolute.
fn delta(baseline: u64, current: u64) -> u64 {
    current.saturating_sub(baseline)
}

/// Derived collector health.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectorHealth {
    Healthy,
    Starting,
    Stale,
    Degraded,
    Stopped,
}

/// Point-in-time collector status for operators.
#[derive(Debug, Clone)]
pub struct CollectorStatus {
    pub health: CollectorHealth,
    pub running: bool,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_users_scanned: usize,
    pub last_users_updated: usize,
    pub last_traffic_bytes: u64,
    pub last_duration_ms: u64,
}

#[derive(Debug, Default)]
struct RunState {
    running: bool,
    last_run_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_error_at: Option<DateTime<Utc>>,
    consecutive_failures: u32,
    last_users_scanned: usize,
    last_users_updated: usize,
    last_traffic_bytes: u64,
    last_duration_ms: u64,
}

/// Summary of one completed tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct TickSummary {
    pub users_scanned: usize,
    pub users_updated: usize,
    pub traffic_bytes: u64,
    pub online_users: usize,
}

struct PendingUpdate {
    user_id: i64,
    baseline_key: String,
    current: Baseline,
    delta_up: u64,
    delta_down: u64,
}

/// Periodic traffic attribution task.
pub struct StatsCollector {
    store: Arc<dyn Store>,
    transport: Arc<dyn StatTransport>,
    metrics: Option<Arc<Metrics>>,
    interval: Duration,
    baselines: Mutex<HashMap<String, Baseline>>,
    state: Mutex<RunState>,
}

impl StatsCollector {
    pub fn new(
        store: Arc<dyn Store>,
        transport: Arc<dyn StatTransport>,
        metrics: Option<Arc<Metrics>>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            transport,
            metrics,
            interval: interval.max(Duration::from_secs(5)),
            baselines: Mutex::new(HashMap::new()),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Self-scheduled loop; one logical task, cancelled cooperatively.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        self.state.lock().running = true;
        info!(interval = ?self.interval, "stats collector started");

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {}
            }
            match self.run_tick().await {
                Ok(summary) => {
                    debug!(
                        scanned = summary.users_scanned,
                        updated = summary.users_updated,
                        bytes = summary.traffic_bytes,
                        "stats tick complete"
                    );
                }
                Err(err) => {
                    warn!(error = %err, "stats tick failed");
                }
            }
        }

        self.state.lock().running = false;
        info!("stats collector stopped");
    }

    /// One attribution pass. Public so operators (and tests) can force a
    /// tick outside the schedule.
    pub async fn run_tick(&self) -> Result<TickSummary, CollectorError> {
        let started = Instant::now();
        let now = Utc::now();
        self.state.lock().last_run_at = Some(now);

        let users = match self.store.active_users().await {
            Ok(users) => users,
            Err(err) => {
                self.note_failure(now, started);
                return Err(err.into());
            }
        };

        // Phase 1: read counters. Baselines are only consulted here; they
        // are rebased in phase 2, after the DB write for that user lands.
        let mut pending: Vec<PendingUpdate> = Vec::with_capacity(users.len());
        let mut found_by_user: HashMap<i64, bool> = HashMap::new();

        for user in &users {
            match self.read_user_counters(user).await {
                Some((answer_up, answer_down)) => {
                    let found = answer_up.found || answer_down.found;
                    found_by_user.insert(user.id, found);
                    let key = format!("user:{}", user.id);
                    let current = Baseline {
                        uplink: answer_up.value,
                        downlink: answer_down.value,
                    };
                    let baseline = self.baselines.lock().get(&key).copied().unwrap_or_default();
                    pending.push(PendingUpdate {
                        user_id: user.id,
                        baseline_key: key,
                        current,
                        delta_up: delta(baseline.uplink, current.uplink),
                        delta_down: delta(baseline.downlink, current.downlink),
                    });
                }
                None => {
                    // Transport failed for every candidate key: skip the
                    // user without touching their baseline.
                    found_by_user.insert(user.id, false);
                }
            }
        }

        // Phase 2: per-inbound single-user fallback, for protocols that
        // meter per inbound rather than per user.
        for fallback in self.inbound_fallbacks(&users, &found_by_user).await {
            pending.push(fallback);
        }

        // Phase 3: persist non-zero deltas; each user's baseline is rebased
        // only after their DB write succeeds.
        let mut summary = TickSummary {
            users_scanned: users.len(),
            ..TickSummary::default()
        };
        let mut online = 0usize;

        for update in pending {
            let combined = update.delta_up.saturating_add(update.delta_down);
            if combined > 0 {
                if let Err(err) = self
                    .store
                    .apply_traffic_delta(update.user_id, update.delta_up, update.delta_down, now)
                    .await
                {
                    // Mutating failure: abort the tick, leaving this user's
                    // baseline at the previous absolute so the delta is
                    // re-attributed next tick.
                    self.note_failure(now, started);
                    return Err(err.into());
                }
                summary.users_updated += 1;
                summary.traffic_bytes += combined;
                online += 1;
                if let Some(metrics) = &self.metrics {
                    metrics
                        .traffic_bytes_total
                        .with_label_values(&["uplink"])
                        .inc_by(update.delta_up);
                    metrics
                        .traffic_bytes_total
                        .with_label_values(&["downlink"])
                        .inc_by(update.delta_down);
                }
            }
            self.baselines
                .lock()
                .insert(update.baseline_key, update.current);
        }

        summary.online_users = online;

        let duration_ms = started.elapsed().as_millis() as u64;
        {
            let mut state = self.state.lock();
            state.last_success_at = Some(now);
            state.consecutive_failures = 0;
            state.last_users_scanned = summary.users_scanned;
            state.last_users_updated = summary.users_updated;
            state.last_traffic_bytes = summary.traffic_bytes;
            state.last_duration_ms = duration_ms;
        }
        if let Some(metrics) = &self.metrics {
            metrics.online_users.set(online as i64);
            metrics
                .stats_ticks_total
                .with_label_values(&["ok"])
                .inc();
            metrics
                .stats_tick_duration_seconds
                .observe(started.elapsed().as_secs_f64());
        }

        Ok(summary)
    }

    /// Try candidate stat keys in order; the first key with an explicit
    /// value wins. When none is found, the first candidate's zero reading
    /// stands in so later deltas have a baseline. Returns None only when
    /// the transport failed for every candidate.
    async fn read_user_counters(&self, user: &ActiveUser) -> Option<(StatAnswer, StatAnswer)> {
        let mut fallback: Option<(StatAnswer, StatAnswer)> = None;
        for candidate in user.stat_key_candidates() {
            let up = self
                .transport
                .query_stat(&user_stat_key(&candidate, Direction::Uplink), false)
                .await;
            let down = self
                .transport
                .query_stat(&user_stat_key(&candidate, Direction::Downlink), false)
                .await;
            match (up, down) {
                (Ok(up), Ok(down)) => {
                    if up.found || down.found {
                        return Some((up, down));
                    }
                    fallback.get_or_insert((up, down));
                }
                (Err(err), _) | (_, Err(err)) => {
                    debug!(user = user.id, key = %candidate, error = %err, "stat query failed for candidate");
                }
            }
        }
        fallback
    }

    /// For each enabled inbound whose effective user set is exactly one
    /// user, and that user had no per-user stats this tick, attribute the
    /// inbound counter delta to them.
    async fn inbound_fallbacks(
        &self,
        users: &[ActiveUser],
        found_by_user: &HashMap<i64, bool>,
    ) -> Vec<PendingUpdate> {
        let mut users_by_tag: HashMap<&str, Vec<&ActiveUser>> = HashMap::new();
        for user in users {
            for inbound in &user.inbounds {
                users_by_tag.entry(inbound.tag.as_str()).or_default().push(user);
            }
        }

        let mut fallbacks = Vec::new();
        for (tag, tag_users) in users_by_tag {
            if tag_users.len() != 1 {
                continue;
            }
            let user = tag_users[0];
            if found_by_user.get(&user.id).copied().unwrap_or(false) {
                continue;
            }

            let up = self
                .transport
                .query_stat(&inbound_stat_key(tag, Direction::Uplink), false)
                .await;
            let down = self
                .transport
                .query_stat(&inbound_stat_key(tag, Direction::Downlink), false)
                .await;
            let (up, down) = match (up, down) {
                (Ok(u), Ok(d)) => (u, d),
                (Err(err), _) | (_, Err(err)) => {
                    debug!(tag, error = %err, "inbound fallback query failed");
                    continue;
                }
            };
            if !(up.found || down.found) {
                continue;
            }

            let key = format!("inbound:{tag}");
            let current = Baseline {
                uplink: up.value,
                downlink: down.value,
            };
            let baseline = self.baselines.lock().get(&key).copied().unwrap_or_default();
            fallbacks.push(PendingUpdate {
                user_id: user.id,
                baseline_key: key,
                current,
                delta_up: delta(baseline.uplink, current.uplink),
                delta_down: delta(baseline.downlink, current.downlink),
            });
        }
        fallbacks
    }

    fn note_failure(&self, now: DateTime<Utc>, started: Instant) {
        let mut state = self.state.lock();
        state.last_error_at = Some(now);
        state.consecutive_failures += 1;
        state.last_duration_ms = started.elapsed().as_millis() as u64;
        drop(state);
        if let Some(metrics) = &self.metrics {
            metrics
                .stats_ticks_total
                .with_label_values(&["error"])
                .inc();
        }
    }

    /// Reset a counter on the data plane and drop the whole baseline map.
    /// Stat keys are not reliably reversible to user ids, so a full clear
    /// is the safe invalidation.
    pub async fn reset(&self, pattern: &str) -> Result<(), CollectorError> {
        self.transport.query_stat(pattern, true).await?;
        self.baselines.lock().clear();
        info!(pattern, "stat counter reset; baselines cleared");
        Ok(())
    }

    #[cfg(test)]
    fn baseline(&self, key: &str) -> Option<(u64, u64)> {
        self.baselines
            .lock()
            .get(key)
            .map(|b| (b.uplink, b.downlink))
    }

    /// Current collector status with derived health.
    pub fn status(&self) -> CollectorStatus {
        let state = self.state.lock();
        let now = Utc::now();

        let stale_after = chrono::Duration::from_std(self.interval * 3)
            .unwrap_or_else(|_| chrono::Duration::seconds(180));
        let watchdog_ms = (self.interval.as_millis() as u64).saturating_mul(5);

        let health = if !state.running {
            CollectorHealth::Stopped
        } else if state.consecutive_failures > 0 || state.last_duration_ms > watchdog_ms {
            CollectorHealth::Degraded
        } else if state.last_success_at.is_none() {
            CollectorHealth::Starting
        } else if state
            .last_success_at
            .map(|t| now - t <= stale_after)
            .unwrap_or(false)
        {
            CollectorHealth::Healthy
        } else {
            CollectorHealth::Stale
        };

        CollectorStatus {
            health,
            running: state.running,
            last_run_at: state.last_run_at,
            last_success_at: state.last_success_at,
            last_error_at: state.last_error_at,
            consecutive_failures: state.consecutive_failures,
            last_users_scanned: state.last_users_scanned,
            last_users_updated: state.last_users_updated,
            last_traffic_bytes: state.last_traffic_bytes,
            last_duration_ms: state.last_duration_ms,
        }
    }
}
