//! In-memory store implementation.
//!
//! Single mutex over the whole state keeps every multi-row operation
//! (traffic delta + log append, conditional lock writes) atomic without a
//! transaction layer. Fine for tests and single-node deployments.

use super::{project_active_users, DomainSnapshot, Store, StoreError};
use crate::types::{
    ActiveUser, ConnectionLog, Group, GroupInbound, Inbound, TrafficLog, UpdateHistoryEntry,
    UpdateLock, User, UserGroup, UserInbound,
};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

#[derive(Default)]
struct Inner {
    users: BTreeMap<i64, User>,
    inbounds: BTreeMap<i64, Inbound>,
    user_inbounds: Vec<UserInbound>,
    groups: BTreeMap<i64, Group>,
    group_inbounds: Vec<GroupInbound>,
    user_groups: Vec<UserGroup>,
    connection_logs: Vec<ConnectionLog>,
    traffic_logs: Vec<TrafficLog>,
    locks: HashMap<String, UpdateLock>,
    history: Vec<UpdateHistoryEntry>,
}

/// Thread-safe in-memory domain store.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn domain_snapshot(&self) -> Result<DomainSnapshot, StoreError> {
        let inner = self.inner.lock();
        Ok(DomainSnapshot {
            users: inner.users.values().cloned().collect(),
            inbounds: inner.inbounds.values().cloned().collect(),
            user_inbounds: inner.user_inbounds.clone(),
            groups: inner.groups.values().cloned().collect(),
            group_inbounds: inner.group_inbounds.clone(),
            user_groups: inner.user_groups.clone(),
        })
    }

    async fn active_users(&self) -> Result<Vec<ActiveUser>, StoreError> {
        let snapshot = self.domain_snapshot().await?;
        Ok(project_active_users(&snapshot, Utc::now()))
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, StoreError> {
        Ok(self.inner.lock().users.get(&user_id).cloned())
    }

    async fn apply_traffic_delta(
        &self,
        user_id: i64,
        upload: u64,
        download: u64,
        at: DateTime<Utc>,
    ) -> Result<(u64, u64), StoreError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.upload_used = user.upload_used.saturating_add(upload);
        user.download_used = user.download_used.saturating_add(download);
        user.updated_at = at;
        let totals = (user.upload_used, user.download_used);
        inner.traffic_logs.push(TrafficLog {
            user_id,
            upload,
            download,
            timestamp: at,
        });
        Ok(totals)
    }

    async fn reset_user_traffic(&self, user_id: i64) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        let user = inner
            .users
            .get_mut(&user_id)
            .ok_or_else(|| StoreError::NotFound(format!("user {user_id}")))?;
        user.upload_used = 0;
        user.download_used = 0;
        user.updated_at = Utc::now();
        Ok(())
    }

    async fn record_connection(&self, entry: ConnectionLog) -> Result<(), StoreError> {
        self.inner.lock().connection_logs.push(entry);
        Ok(())
    }

    async fn connection_logs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<ConnectionLog>, StoreError> {
        Ok(self
            .inner
            .lock()
            .connection_logs
            .iter()
            .filter(|l| l.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn traffic_logs_since(
        &self,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrafficLog>, StoreError> {
        Ok(self
            .inner
            .lock()
            .traffic_logs
            .iter()
            .filter(|l| l.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn acquire_update_lock(
        &self,
        name: &str,
        owner_id: &str,
        ttl: Duration,
    ) -> Result<UpdateLock, StoreError> {
        let mut inner = self.inner.lock();
        let now = Utc::now();
        if let Some(existing) = inner.locks.get(name) {
            if !existing.is_stale(now) {
                return Err(StoreError::LockHeld(existing.clone()));
            }
        }
        let lock = UpdateLock {
            name: name.to_string(),
            owner_id: owner_id.to_string(),
            expires_at: now + ttl,
        };
        inner.locks.insert(name.to_string(), lock.clone());
        Ok(lock)
    }

    async fn read_update_lock(&self, name: &str) -> Result<Option<UpdateLock>, StoreError> {
        Ok(self.inner.lock().locks.get(name).cloned())
    }

    async fn release_update_lock(&self, name: &str, owner_id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.lock();
        match inner.locks.get(name) {
            Some(lock) if lock.owner_id == owner_id => {
                inner.locks.remove(name);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn clear_update_lock(&self, name: &str) -> Result<Option<UpdateLock>, StoreError> {
        Ok(self.inner.lock().locks.remove(name))
    }

    async fn append_update_history(&self, entry: UpdateHistoryEntry) -> Result<(), StoreError> {
        self.inner.lock().history.push(entry);
        Ok(())
    }

    async fn update_history(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<UpdateHistoryEntry>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn upsert_user(&self, user: User) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if inner
            .users
            .values()
            .any(|u| u.id != user.id && (u.email == user.email || u.uuid == user.uuid))
        {
            return Err(StoreError::Conflict(format!(
                "email or uuid already taken: {}",
                user.email
            )));
        }
        inner.users.insert(user.id, user);
        Ok(())
    }

    async fn upsert_inbound(&self, inbound: Inbound) -> Result<(), StoreError> {
        if inbound.tag.is_empty() {
            return Err(StoreError::Conflict("inbound tag must not be empty".into()));
        }
        let mut inner = self.inner.lock();
        if inner
            .inbounds
            .values()
            .any(|i| i.id != inbound.id && i.tag == inbound.tag)
        {
            return Err(StoreError::Conflict(format!(
                "inbound tag already taken: {}",
                inbound.tag
            )));
        }
        inner.inbounds.insert(inbound.id, inbound);
        Ok(())
    }

    async fn link_user_inbound(&self, rel: UserInbound) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        // Unique per (user, inbound): replace an existing link in place.
        if let Some(existing) = inner
            .user_inbounds
            .iter_mut()
            .find(|r| r.user_id == rel.user_id && r.inbound_id == rel.inbound_id)
        {
            *existing = rel;
        } else {
            inner.user_inbounds.push(rel);
        }
        Ok(())
    }

    async fn upsert_group(&self, group: Group) -> Result<(), StoreError> {
        self.inner.lock().groups.insert(group.id, group);
        Ok(())
    }

    async fn link_group_inbound(&self, rel: GroupInbound) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner
            .group_inbounds
            .iter_mut()
            .find(|r| r.group_id == rel.group_id && r.inbound_id == rel.inbound_id)
        {
            *existing = rel;
        } else {
            inner.group_inbounds.push(rel);
        }
        Ok(())
    }

    async fn link_user_group(&self, rel: UserGroup) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        if !inner
            .user_groups
            .iter()
            .any(|r| r.user_id == rel.user_id && r.group_id == rel.group_id)
        {
            inner.user_groups.push(rel);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::UserStatus;

    fn test_user(id: i64, email: &str) -> User {
        User {
            id,
            email: email.to_string(),
            uuid: uuid::Uuid::new_v4(),
            password: String::new(),
            subscription_token: String::new(),
            status: UserStatus::Active,
            data_limit: 0,
            upload_used: 0,
            download_used: 0,
            expire_date: None,
            ip_limit: 0,
            device_limit: 0,
            note: String::new(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_traffic_delta_is_atomic_with_log() {
        let store = MemoryStore::new();
        store.upsert_user(test_user(1, "a@x.com")).await.unwrap();

        let at = Utc::now();
        let (up, down) = store.apply_traffic_delta(1, 300, 300, at).await.unwrap();
        assert_eq!((up, down), (300, 300));

        let logs = store
            .traffic_logs_since(at - Duration::seconds(1))
            .await
            .unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].upload, 300);
        assert_eq!(logs[0].download, 300);
    }

    #[tokio::test]
    async fn test_traffic_delta_unknown_user() {
        let store = MemoryStore::new();
        let err = store
            .apply_traffic_delta(99, 1, 1, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_counters_monotonic_until_reset() {
        let store = MemoryStore::new();
        store.upsert_user(test_user(1, "a@x.com")).await.unwrap();

        store
            .apply_traffic_delta(1, 100, 50, Utc::now())
            .await
            .unwrap();
        let (up1, down1) = store
            .apply_traffic_delta(1, 10, 20, Utc::now())
            .await
            .unwrap();
        assert_eq!((up1, down1), (110, 70));

        store.reset_user_traffic(1).await.unwrap();
        let user = store.get_user(1).await.unwrap().unwrap();
        assert_eq!(user.upload_used, 0);
        assert_eq!(user.download_used, 0);
    }

    #[tokio::test]
    async fn test_lock_mutual_exclusion() {
        let store = MemoryStore::new();
        let lock = store
            .acquire_update_lock("upd", "op-1", Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(lock.owner_id, "op-1");

        let err = store
            .acquire_update_lock("upd", "op-2", Duration::minutes(5))
            .await
            .unwrap_err();
        match err {
            StoreError::LockHeld(held) => assert_eq!(held.owner_id, "op-1"),
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stale_lock_is_stolen() {
        let store = MemoryStore::new();
        store
            .acquire_update_lock("upd", "op-1", Duration::seconds(-60))
            .await
            .unwrap();
        let stolen = store
            .acquire_update_lock("upd", "op-2", Duration::minutes(5))
            .await
            .unwrap();
        assert_eq!(stolen.owner_id, "op-2");
    }

    #[tokio::test]
    async fn test_release_requires_ownership() {
        let store = MemoryStore::new();
        store
            .acquire_update_lock("upd", "op-1", Duration::minutes(5))
            .await
            .unwrap();
        assert!(!store.release_update_lock("upd", "op-2").await.unwrap());
        assert!(store.release_update_lock("upd", "op-1").await.unwrap());
        assert!(store.read_update_lock("upd").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .append_update_history(UpdateHistoryEntry {
                    level: crate::types::HistoryLevel::Info,
                    message: format!("entry-{i}"),
                    metadata: serde_json::Value::Null,
                    timestamp: Utc::now(),
                })
                .await
                .unwrap();
        }
        let page = store.update_history(0, 2).await.unwrap();
        assert_eq!(page[0].message, "entry-4");
        assert_eq!(page[1].message, "entry-3");
        let next = store.update_history(2, 2).await.unwrap();
        assert_eq!(next[0].message, "entry-2");
    }

    #[tokio::test]
    async fn test_unique_email_conflict() {
        let store = MemoryStore::new();
        store.upsert_user(test_user(1, "a@x.com")).await.unwrap();
        let err = store.upsert_user(test_user(2, "a@x.com")).await.unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }
}
