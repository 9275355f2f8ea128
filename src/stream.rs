//! Session stream: push-style fan-out of heartbeat snapshots.
//!
//! Each subscriber gets its own producer task and a bounded broadcast
//! channel; a slow consumer lags and loses the oldest snapshots instead of
//! blocking the producer. Consumers that lose the stream are expected to
//! reconnect with exponential backoff starting at
//! [`RECONNECT_INITIAL`], doubling to [`RECONNECT_CAP`], giving up after
//! [`RECONNECT_MAX_ATTEMPTS`] — that contract lives on the wire, not in
//! this module.

use crate::online::{HeartbeatEntry, OnlineTracker};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Reconnect contract constants, for consumers on the other side of the
/// wire.
pub const RECONNECT_INITIAL: Duration = Duration::from_secs(1);
pub const RECONNECT_CAP: Duration = Duration::from_secs(15);
pub const RECONNECT_MAX_ATTEMPTS: u32 = 10;

/// Per-subscriber buffered snapshots before lagging kicks in.
const CHANNEL_CAPACITY: usize = 16;

/// Subscription parameters, clamped at construction.
#[derive(Debug, Clone)]
pub struct SessionStreamParams {
    pub user_ids: Option<Vec<i64>>,
    pub include_offline: bool,
    pub limit: usize,
    pub interval: Duration,
}

impl Default for SessionStreamParams {
    fn default() -> Self {
        Self {
            user_ids: None,
            include_offline: false,
            limit: 100,
            interval: Duration::from_millis(2000),
        }
    }
}

impl SessionStreamParams {
    /// Clamp to the contract bounds: limit 1–500, interval 500–10000 ms.
    pub fn clamped(mut self) -> Self {
        self.limit = self.limit.clamp(1, 500);
        self.interval = self
            .interval
            .clamp(Duration::from_millis(500), Duration::from_millis(10_000));
        self
    }
}

/// One emitted snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSnapshot {
    pub generated_at: DateTime<Utc>,
    /// Entries matching the filters, before the limit cut.
    pub total: usize,
    /// Online entries among them.
    pub online: usize,
    pub sessions: Vec<HeartbeatEntry>,
}

/// Stream events.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum SessionEvent {
    Snapshot(SessionSnapshot),
    Error { message: String },
}

/// Fans heartbeat snapshots out to any number of independent subscribers.
pub struct SessionStream {
    tracker: Arc<OnlineTracker>,
    cancel: CancellationToken,
}

impl SessionStream {
    pub fn new(tracker: Arc<OnlineTracker>, cancel: CancellationToken) -> Self {
        Self { tracker, cancel }
    }

    /// Spawn a producer for this subscriber. The producer emits at most one
    /// snapshot per interval and stops as soon as the subscription is
    /// dropped; other subscribers are unaffected.
    pub fn subscribe(&self, params: SessionStreamParams) -> SessionSubscription {
        let params = params.clamped();
        let (tx, rx) = broadcast::channel(CHANNEL_CAPACITY);
        let tracker = self.tracker.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let mut tick = tokio::time::interval(params.interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }
                let event = match build_snapshot(&tracker, &params).await {
                    Ok(snapshot) => SessionEvent::Snapshot(snapshot),
                    Err(err) => SessionEvent::Error {
                        message: err.to_string(),
                    },
                };
                // Send fails only when the receiver is gone; stop producing.
                if tx.send(event).is_err() {
                    debug!("session stream subscriber dropped; producer stopping");
                    break;
                }
            }
        });

        SessionSubscription { receiver: rx }
    }
}

async fn build_snapshot(
    tracker: &OnlineTracker,
    params: &SessionStreamParams,
) -> Result<SessionSnapshot, crate::store::StoreError> {
    let entries = tracker.all_heartbeats().await?;
    let mut matching: Vec<HeartbeatEntry> = entries
        .into_iter()
        .filter(|entry| {
            params
                .user_ids
                .as_ref()
                .map(|ids| ids.contains(&entry.user_id))
                .unwrap_or(true)
        })
        .filter(|entry| params.include_offline || entry.online)
        .collect();

    let total = matching.len();
    let online = matching.iter().filter(|e| e.online).count();
    matching.truncate(params.limit);

    Ok(SessionSnapshot {
        generated_at: Utc::now(),
        total,
        online,
        sessions: matching,
    })
}

/// A subscriber's end of the stream. Dropping it cancels production.
pub struct SessionSubscription {
    receiver: broadcast::Receiver<SessionEvent>,
}

impl SessionSubscription {
    /// Next event, skipping over lag gaps. `None` means the stream ended.
    pub async fn next(&mut self) -> Option<SessionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "session stream consumer lagged; snapshots dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}
