//! Domain store boundary.
//!
//! The relational store is an external collaborator; this module fixes the
//! operations and invariants the core depends on. [`MemoryStore`] is the
//! in-process implementation used for tests and single-node deployments.

mod memory;

pub use memory::MemoryStore;

use crate::types::{
    ActiveUser, ConnectionLog, Group, GroupInbound, Inbound, InboundRef, TrafficLog, UpdateHistoryEntry,
    UpdateLock, User, UserGroup, UserInbound, UserStatus,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use thiserror::Error;

/// Errors that can occur during store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("update lock held by {owner_id} until {expires_at}", owner_id = .0.owner_id, expires_at = .0.expires_at)]
    LockHeld(UpdateLock),

    #[error("store backend error: {0}")]
    Backend(String),
}

impl StoreError {
    /// Short machine-readable kind for user-visible envelopes.
    pub fn code(&self) -> &'static str {
        match self {
            StoreError::NotFound(_) => "NOT_FOUND",
            StoreError::Conflict(_) => "CONFLICT",
            StoreError::LockHeld(_) => "LOCK_HELD",
            StoreError::Backend(_) => "STORE_ERROR",
        }
    }
}

/// Everything the config generator needs, read in one consistent snapshot.
#[derive(Debug, Clone, Default)]
pub struct DomainSnapshot {
    pub users: Vec<User>,
    pub inbounds: Vec<Inbound>,
    pub user_inbounds: Vec<UserInbound>,
    pub groups: Vec<Group>,
    pub group_inbounds: Vec<GroupInbound>,
    pub user_groups: Vec<UserGroup>,
}

/// One resolved user→inbound assignment after group flattening.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EffectiveAssignment {
    pub inbound_id: i64,
    pub enabled: bool,
    pub priority: u16,
    pub via_group: bool,
}

/// Flatten direct and group-derived user→inbound relations into one
/// effective set per user, deduplicated by inbound id. A direct relation
/// wins over any group-derived one for the same (user, inbound); groups
/// fill the gaps. Group-derived assignments are enabled only while both
/// the group and the group↔inbound link are enabled.
pub fn effective_user_inbounds(snapshot: &DomainSnapshot) -> BTreeMap<i64, Vec<EffectiveAssignment>> {
    let mut resolved: BTreeMap<i64, BTreeMap<i64, EffectiveAssignment>> = BTreeMap::new();

    for rel in &snapshot.user_inbounds {
        resolved.entry(rel.user_id).or_default().insert(
            rel.inbound_id,
            EffectiveAssignment {
                inbound_id: rel.inbound_id,
                enabled: rel.enabled,
                priority: rel.priority,
                via_group: false,
            },
        );
    }

    let group_enabled: BTreeMap<i64, bool> =
        snapshot.groups.iter().map(|g| (g.id, g.enabled)).collect();

    for membership in &snapshot.user_groups {
        let g_enabled = group_enabled
            .get(&membership.group_id)
            .copied()
            .unwrap_or(false);
        for gi in snapshot
            .group_inbounds
            .iter()
            .filter(|gi| gi.group_id == membership.group_id)
        {
            let per_user = resolved.entry(membership.user_id).or_default();
            // Direct relations already present win on duplicate.
            per_user.entry(gi.inbound_id).or_insert(EffectiveAssignment {
                inbound_id: gi.inbound_id,
                enabled: g_enabled && gi.enabled,
                priority: gi.priority,
                via_group: true,
            });
        }
    }

    resolved
        .into_iter()
        .map(|(user_id, by_inbound)| {
            let mut assignments: Vec<EffectiveAssignment> = by_inbound.into_values().collect();
            assignments.sort_by_key(|a| (a.priority, a.inbound_id));
            (user_id, assignments)
        })
        .collect()
}

/// Build the compact active-user projection from a snapshot: users whose
/// effective status is ACTIVE, carrying their enabled inbounds.
pub fn project_active_users(snapshot: &DomainSnapshot, now: DateTime<Utc>) -> Vec<ActiveUser> {
    let assignments = effective_user_inbounds(snapshot);
    let inbound_by_id: BTreeMap<i64, &Inbound> =
        snapshot.inbounds.iter().map(|i| (i.id, i)).collect();

    snapshot
        .users
        .iter()
        .filter(|u| u.effective_status(now) == UserStatus::Active)
        .map(|u| ActiveUser {
            id: u.id,
            email: u.email.clone(),
            uuid: u.uuid,
            inbounds: assignments
                .get(&u.id)
                .map(|list| {
                    list.iter()
                        .filter(|a| a.enabled)
                        .filter_map(|a| inbound_by_id.get(&a.inbound_id))
                        .filter(|i| i.enabled)
                        .map(|i| InboundRef {
                            id: i.id,
                            tag: i.tag.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default(),
        })
        .collect()
}

/// Abstract domain store.
///
/// This trait is object-safe and used as `Arc<dyn Store>`.
#[async_trait]
pub trait Store: Send + Sync {
    // === Domain reads ===

    /// Read the full generator input in one consistent view.
    async fn domain_snapshot(&self) -> Result<DomainSnapshot, StoreError>;

    /// Active users with enabled inbounds (compact projection).
    async fn active_users(&self) -> Result<Vec<ActiveUser>, StoreError>;

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError>;

    // === Traffic attribution ===

    /// Atomically increment both usage counters AND append a TrafficLog row.
    /// Returns the updated (upload_used, download_used) totals.
    async fn apply_traffic_delta(
        &self,
        user_id: i64,
        upload: u64,
        download: u64,
        at: DateTime<Utc>,
    ) -> Result<(u64, u64), StoreError>;

    /// Explicit counter reset; the one permitted non-monotonic transition.
    async fn reset_user_traffic(&self, user_id: i64) -> Result<(), StoreError>;

    // === Append-only logs ===

    async fn record_connection(&self, entry: ConnectionLog) -> Result<(), StoreError>;

    async fn connection_logs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLog>, StoreError>;

    async fn traffic_logs_since(&self, since: DateTime<Utc>)
        -> Result<Vec<TrafficLog>, StoreError>;

    // === Update lock ===

    /// Atomic conditional write: succeeds when no lock exists or the
    /// existing one is stale; otherwise fails with [`StoreError::LockHeld`].
    async fn acquire_update_lock(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<UpdateLock, StoreError>;

    async fn read_update_lock(&self, name: &str) -> Result<Option<UpdateLock>, StoreError>;

    /// Release only when still owned by `owner_id`; returns whether a lock
    /// was removed.
    async fn release_update_lock(&self, name: &str, owner_id: &str) -> Result<bool, StoreError>;

    /// Unconditional removal (forced/stale unlock path). Returns the
    /// previous lock, if any.
    async fn clear_update_lock(&self, name: &str) -> Result<Option<UpdateLock>, StoreError>;

    // === Update history ===

    async fn append_update_history(&self, entry: UpdateHistoryEntry) -> Result<(), StoreError>;

    /// Newest-first page of history entries.
    async fn update_history(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UpdateHistoryEntry>, StoreError>;

    // === Admin mutators (used by collaborators and fixtures) ===

    async fn upsert_user(&self, user: User) -> Result<(), StoreError>;
    async fn upsert_inbound(&self, inbound: Inbound) -> Result<(), StoreError>;
    async fn link_user_inbound(&self, rel: UserInbound) -> Result<(), StoreError>;
    async fn upsert_group(&self, group: Group) -> Result<(), StoreError>;
    async fn link_group_inbound(&self, rel: GroupInbound) -> Result<(), StoreError>;
    async fn link_user_group(&self, rel: UserGroup) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot_with_group_overlap() -> DomainSnapshot {
        DomainSnapshot {
            users: Vec::new(),
            inbounds: Vec::new(),
            user_inbounds: vec![UserInbound {
                user_id: 1,
                inbound_id: 10,
                enabled: false,
                priority: 5,
            }],
            groups: vec![Group {
                id: 100,
                name: "g".into(),
                enabled: true,
            }],
            group_inbounds: vec![
                GroupInbound {
                    group_id: 100,
                    inbound_id: 10,
                    enabled: true,
                    priority: 1,
                },
                GroupInbound {
                    group_id: 100,
                    inbound_id: 11,
                    enabled: true,
                    priority: 2,
                },
            ],
            user_groups: vec![UserGroup {
                user_id: 1,
                group_id: 100,
            }],
        }
    }

    #[test]
    fn test_direct_wins_over_group() {
        let resolved = effective_user_inbounds(&snapshot_with_group_overlap());
        let assignments = &resolved[&1];
        let direct = assignments.iter().find(|a| a.inbound_id == 10).unwrap();
        // The direct relation (disabled) wins over the enabled group link.
        assert!(!direct.enabled);
        assert!(!direct.via_group);
        assert_eq!(direct.priority, 5);
    }

    #[test]
    fn test_groups_fill_gaps() {
        let resolved = effective_user_inbounds(&snapshot_with_group_overlap());
        let assignments = &resolved[&1];
        let filled = assignments.iter().find(|a| a.inbound_id == 11).unwrap();
        assert!(filled.enabled);
        assert!(filled.via_group);
    }

    #[test]
    fn test_disabled_group_disables_derived_assignments() {
        let mut snapshot = snapshot_with_group_overlap();
        snapshot.groups[0].enabled = false;
        let resolved = effective_user_inbounds(&snapshot);
        let filled = resolved[&1].iter().find(|a| a.inbound_id == 11).unwrap();
        assert!(!filled.enabled);
    }

    #[test]
    fn test_assignments_sorted_by_priority() {
        let snapshot = DomainSnapshot {
            user_inbounds: vec![
                UserInbound {
                    user_id: 1,
                    inbound_id: 20,
                    enabled: true,
                    priority: 9,
                },
                UserInbound {
                    user_id: 1,
                    inbound_id: 21,
                    enabled: true,
                    priority: 1,
                },
            ],
            ..Default::default()
        };
        let resolved = effective_user_inbounds(&snapshot);
        let ids: Vec<i64> = resolved[&1].iter().map(|a| a.inbound_id).collect();
        assert_eq!(ids, vec![21, 20]);
    }
}
