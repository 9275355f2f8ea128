//! Shared fixtures for integration tests: domain seeding, a scripted
//! command runner, and a programmable stat transport.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use oneui::process::{CommandError, CommandOutput, CommandRunner, CommandSpec};
use oneui::stats::{StatAnswer, StatTransport, TransportError};
use oneui::store::{MemoryStore, Store};
use oneui::types::{Inbound, Network, Protocol, Security, User, UserInbound, UserStatus};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

pub fn test_user(id: i64, email: &str) -> User {
    User {
        id,
        email: email.to_string(),
        uuid: uuid::Uuid::new_v4(),
        password: format!("pw-{id}"),
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

pub fn test_inbound(id: i64, tag: &str, protocol: Protocol) -> Inbound {
    Inbound::new(id, tag, protocol, Network::Tcp, Security::None, 443)
}

/// Seed one active user linked to one enabled inbound.
pub async fn seed_linked(store: &MemoryStore, user_id: i64, email: &str, inbound_id: i64, tag: &str) {
    store.upsert_user(test_user(user_id, email)).await.unwrap();
    store
        .upsert_inbound(test_inbound(inbound_id, tag, Protocol::Vless))
        .await
        .unwrap();
    store
        .link_user_inbound(UserInbound {
            user_id,
            inbound_id,
            enabled: true,
            priority: 1,
        })
        .await
        .unwrap();
}

/// Command runner scripted by command-line prefix. Each prefix owns a
/// queue of outputs; the last queued output repeats once the queue drains.
/// Unmatched commands fail like a missing binary.
pub struct ScriptedRunner {
    scripts: Mutex<Vec<(String, VecDeque<CommandOutput>)>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRunner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
        })
    }

    pub fn ok(exit_code: i32, stdout: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: stdout.to_string(),
            stderr: String::new(),
        }
    }

    pub fn fail(exit_code: i32, stderr: &str) -> CommandOutput {
        CommandOutput {
            exit_code,
            stdout: String::new(),
            stderr: stderr.to_string(),
        }
    }

    /// Register a repeating response for every command starting with
    /// `prefix`.
    pub fn respond(&self, prefix: &str, output: CommandOutput) {
        self.scripts
            .lock()
            .push((prefix.to_string(), VecDeque::from([output])));
    }

    /// Register a sequence; the final element repeats.
    pub fn respond_seq(&self, prefix: &str, outputs: Vec<CommandOutput>) {
        self.scripts
            .lock()
            .push((prefix.to_string(), VecDeque::from(outputs)));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .count()
    }
}

#[async_trait]
impl CommandRunner for ScriptedRunner {
    async fn run(&self, spec: CommandSpec) -> Result<CommandOutput, CommandError> {
        let display = spec.display();
        self.calls.lock().push(display.clone());

        let mut scripts = self.scripts.lock();
        for (prefix, queue) in scripts.iter_mut() {
            if display.starts_with(prefix.as_str()) {
                let output = if queue.len() > 1 {
                    queue.pop_front().unwrap()
                } else {
                    queue.front().cloned().unwrap_or_default()
                };
                return Ok(output);
            }
        }
        Err(CommandError::Spawn {
            program: spec.program.clone(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, "not scripted"),
        })
    }
}

/// Stat transport answering from a pattern→value table.
pub struct TableTransport {
    answers: Mutex<HashMap<String, u64>>,
    pub fail_all: Mutex<bool>,
}

impl TableTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            answers: Mutex::new(HashMap::new()),
            fail_all: Mutex::new(false),
        })
    }

    pub fn set(&self, pattern: &str, value: u64) {
        self.answers.lock().insert(pattern.to_string(), value);
    }
}

#[async_trait]
impl StatTransport for TableTransport {
    async fn query_stat(&self, pattern: &str, _reset: bool) -> Result<StatAnswer, TransportError> {
        if *self.fail_all.lock() {
            return Err(TransportError::Http("unreachable".into()));
        }
        Ok(match self.answers.lock().get(pattern) {
            Some(v) => StatAnswer {
                value: *v,
                found: true,
            },
            None => StatAnswer::default(),
        })
    }

    fn name(&self) -> &'static str {
        "table"
    }
}

/// Store wrapper counting `active_users` reads, for single-flight tests.
pub struct CountingStore {
    pub inner: MemoryStore,
    pub active_user_reads: Mutex<usize>,
}

impl CountingStore {
    pub fn new(inner: MemoryStore) -> Self {
        Self {
            inner,
            active_user_reads: Mutex::new(0),
        }
    }

    pub fn reads(&self) -> usize {
        *self.active_user_reads.lock()
    }
}

#[async_trait]
impl Store for CountingStore {
    async fn domain_snapshot(
        &self,
    ) -> Result<oneui::store::DomainSnapshot, oneui::store::StoreError> {
        self.inner.domain_snapshot().await
    }

    async fn active_users(
        &self,
    ) -> Result<Vec<oneui::types::ActiveUser>, oneui::store::StoreError> {
        *self.active_user_reads.lock() += 1;
        self.inner.active_users().await
    }

    async fn get_user(&self, user_id: i64) -> Result<Option<User>, oneui::store::StoreError> {
        self.inner.get_user(user_id).await
    }

    async fn apply_traffic_delta(
        &self,
        user_id: i64,
        upload: u64,
        download: u64,
        at: chrono::DateTime<Utc>,
    ) -> Result<(u64, u64), oneui::store::StoreError> {
        self.inner
            .apply_traffic_delta(user_id, upload, download, at)
            .await
    }

    async fn reset_user_traffic(&self, user_id: i64) -> Result<(), oneui::store::StoreError> {
        self.inner.reset_user_traffic(user_id).await
    }

    async fn record_connection(
        &self,
        entry: oneui::types::ConnectionLog,
    ) -> Result<(), oneui::store::StoreError> {
        self.inner.record_connection(entry).await
    }

    async fn connection_logs_since(
        &self,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<oneui::types::ConnectionLog>, oneui::store::StoreError> {
        self.inner.connection_logs_since(since).await
    }

    async fn traffic_logs_since(
        &self,
        since: chrono::DateTime<Utc>,
    ) -> Result<Vec<oneui::types::TrafficLog>, oneui::store::StoreError> {
        self.inner.traffic_logs_since(since).await
    }

    async fn acquire_update_lock(
        &self,
        name: &str,
        owner_id: &str,
        ttl: chrono::Duration,
    ) -> Result<oneui::types::UpdateLock, oneui::store::StoreError> {
        self.inner.acquire_update_lock(name, owner_id, ttl).await
    }

    async fn read_update_lock(
        &self,
        name: &str,
    ) -> Result<Option<oneui::types::UpdateLock>, oneui::store::StoreError> {
        self.inner.read_update_lock(name).await
    }

    async fn release_update_lock(
        &self,
        name: &str,
        owner_id: &str,
    ) -> Result<bool, oneui::store::StoreError> {
        self.inner.release_update_lock(name, owner_id).await
    }

    async fn clear_update_lock(
        &self,
        name: &str,
    ) -> Result<Option<oneui::types::UpdateLock>, oneui::store::StoreError> {
        self.inner.clear_update_lock(name).await
    }

    async fn append_update_history(
        &self,
        entry: oneui::types::UpdateHistoryEntry,
    ) -> Result<(), oneui::store::StoreError> {
        self.inner.append_update_history(entry).await
    }

    async fn update_history(
        &self,
        offset: usize,
        limit: usize,
    ) -> Result<Vec<oneui::types::UpdateHistoryEntry>, oneui::store::StoreError> {
        self.inner.update_history(offset, limit).await
    }

    async fn upsert_user(&self, user: User) -> Result<(), oneui::store::StoreError> {
        self.inner.upsert_user(user).await
    }

    async fn upsert_inbound(&self, inbound: Inbound) -> Result<(), oneui::store::StoreError> {
        self.inner.upsert_inbound(inbound).await
    }

    async fn link_user_inbound(&self, rel: UserInbound) -> Result<(), oneui::store::StoreError> {
        self.inner.link_user_inbound(rel).await
    }

    async fn upsert_group(
        &self,
        group: oneui::types::Group,
    ) -> Result<(), oneui::store::StoreError> {
        self.inner.upsert_group(group).await
    }

    async fn link_group_inbound(
        &self,
        rel: oneui::types::GroupInbound,
    ) -> Result<(), oneui::store::StoreError> {
        self.inner.link_group_inbound(rel).await
    }

    async fn link_user_group(
        &self,
        rel: oneui::types::UserGroup,
    ) -> Result<(), oneui::store::StoreError> {
        self.inner.link_user_group(rel).await
    }
}
