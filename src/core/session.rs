//! Session registry: tenant lifecycle and credential checks.
//!
//! A session is a virtual broker. Create and drop for the same name are
//! mutually exclusive behind a per-name mutex; credentials are opaque
//! strings compared in constant time.

use std::sync::Arc;

use dashmap::DashMap;
use rand::RngCore;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::error::{BrokerError, BrokerResult};
use crate::core::protocol::ServerFrame;
use crate::core::retry::RetryEngine;
use crate::core::subscribers::SubscriberIndex;
use crate::storage::{SessionPatch, SessionRecord, Storage, StorageError};

pub const DEFAULT_RETRY_INTERVAL_MS: u64 = 5_000;
pub const DEFAULT_MAX_RETRY_LIMIT: u32 = 100;
const SECRET_KEY_LEN: usize = 32;

/// Optional knobs for `create_session`; unset fields take the defaults.
#[derive(Debug, Clone, Default)]
pub struct CreateSessionOpts {
    pub retry_interval: Option<u64>,
    pub max_retry_limit: Option<u32>,
    pub message_expiry_time: Option<u64>,
    pub session_expiry: Option<u64>,
    pub notifier: Option<serde_json::Value>,
}

/// Admin-facing result of a successful create: the one time the secret
/// key leaves the broker.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedSession {
    pub session_name: String,
    pub password: String,
    pub secret_key: String,
}

/// Session record without credentials, for `list_sessions`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_name: String,
    pub retry_interval: u64,
    pub max_retry_limit: u32,
    pub message_expiry_time: Option<u64>,
    pub session_expiry: Option<u64>,
    pub suspended: bool,
}

impl From<SessionRecord> for SessionInfo {
    fn from(record: SessionRecord) -> Self {
        SessionInfo {
            session_name: record.session_name,
            retry_interval: record.retry_interval,
            max_retry_limit: record.max_retry_limit,
            message_expiry_time: record.message_expiry_time,
            session_expiry: record.session_expiry,
            suspended: record.suspended,
        }
    }
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    storage: Arc<dyn Storage>,
    index: Arc<SubscriberIndex>,
    retry: RetryEngine,
    clock: Arc<dyn Clock>,
    name_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionRegistry {
    pub fn new(
        storage: Arc<dyn Storage>,
        index: Arc<SubscriberIndex>,
        retry: RetryEngine,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                storage,
                index,
                retry,
                clock,
                name_locks: DashMap::new(),
            }),
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.inner
            .name_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    pub async fn create_session(
        &self,
        name: &str,
        password: &str,
        opts: CreateSessionOpts,
    ) -> BrokerResult<CreatedSession> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if self.inner.storage.get_session(name).await?.is_some() {
            return Err(BrokerError::AlreadyExists);
        }

        let record = SessionRecord {
            session_name: name.to_string(),
            password: password.to_string(),
            secret_key: generate_secret_key(),
            retry_interval: opts.retry_interval.unwrap_or(DEFAULT_RETRY_INTERVAL_MS),
            max_retry_limit: opts.max_retry_limit.unwrap_or(DEFAULT_MAX_RETRY_LIMIT),
            message_expiry_time: opts.message_expiry_time,
            session_expiry: opts.session_expiry,
            suspended: false,
            notifier: opts.notifier,
        };
        match self.inner.storage.create_session(&record).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => return Err(BrokerError::AlreadyExists),
            Err(e) => return Err(e.into()),
        }

        info!(event = "session.created", session = name);
        Ok(CreatedSession {
            session_name: record.session_name,
            password: record.password,
            secret_key: record.secret_key,
        })
    }

    /// Validates `init` credentials for a new connection.
    pub async fn validate_init(&self, name: &str, password: &str) -> BrokerResult<SessionRecord> {
        let session = self
            .inner
            .storage
            .get_session(name)
            .await?
            .ok_or(BrokerError::Auth)?;
        if !constant_time_eq(session.password.as_bytes(), password.as_bytes()) {
            return Err(BrokerError::Auth);
        }
        if session.suspended {
            return Err(BrokerError::Suspended);
        }
        Ok(session)
    }

    async fn authorize(
        &self,
        name: &str,
        password: &str,
        secret_key: &str,
    ) -> BrokerResult<SessionRecord> {
        let session = self
            .inner
            .storage
            .get_session(name)
            .await?
            .ok_or(BrokerError::NotFound)?;
        let password_ok = constant_time_eq(session.password.as_bytes(), password.as_bytes());
        let secret_ok = constant_time_eq(session.secret_key.as_bytes(), secret_key.as_bytes());
        if !(password_ok && secret_ok) {
            return Err(BrokerError::Auth);
        }
        Ok(session)
    }

    /// Gates new publishes and redelivery; existing connections stay open.
    pub async fn suspend_session(
        &self,
        name: &str,
        password: &str,
        secret_key: &str,
        suspend: bool,
    ) -> BrokerResult<bool> {
        self.authorize(name, password, secret_key).await?;
        self.inner
            .storage
            .update_session(
                name,
                SessionPatch {
                    suspended: Some(suspend),
                    ..Default::default()
                },
            )
            .await?;
        info!(event = "session.suspended", session = name, suspend);
        Ok(suspend)
    }

    /// Destroys a tenant: closes its connections, clears routing state,
    /// cancels retry timers, and deletes persistent state. Idempotent:
    /// dropping an already-deleted session succeeds.
    pub async fn drop_session(
        &self,
        name: &str,
        password: &str,
        secret_key: &str,
    ) -> BrokerResult<()> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        if self.inner.storage.get_session(name).await?.is_none() {
            return Ok(());
        }
        self.authorize(name, password, secret_key).await?;
        self.force_drop(name).await
    }

    /// Drop without credential checks; used by `drop_session` once
    /// authorized and by the expiry sweeper.
    pub async fn force_drop(&self, name: &str) -> BrokerResult<()> {
        // Timers first, so no redelivery races the teardown.
        self.inner.retry.purge_session(name);

        let connections = self.inner.index.drop_session_state(name);
        let notice = ServerFrame::error("session dropped");
        for conn in &connections {
            conn.send_frame(&notice);
            conn.shutdown();
        }

        if let Err(e) = self.inner.storage.delete_session(name).await {
            warn!(session = name, error = %e, "deleting session state failed");
            return Err(e.into());
        }
        info!(
            event = "session.dropped",
            session = name,
            connections = connections.len(),
        );
        Ok(())
    }

    pub async fn list_sessions(&self) -> BrokerResult<Vec<SessionInfo>> {
        let sessions = self.inner.storage.list_sessions().await?;
        Ok(sessions.into_iter().map(SessionInfo::from).collect())
    }

    /// Drops sessions whose `sessionExpiry` has passed. Returns how many
    /// were dropped; the storage-level message sweep is separate.
    pub async fn drop_expired_sessions(&self) -> BrokerResult<u64> {
        let now = self.inner.clock.now_ms();
        let mut dropped = 0;
        for session in self.inner.storage.list_sessions().await? {
            if session.session_expiry.is_some_and(|at| at < now) {
                self.force_drop(&session.session_name).await?;
                dropped += 1;
            }
        }
        Ok(dropped)
    }
}

fn generate_secret_key() -> String {
    let mut bytes = [0u8; SECRET_KEY_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (left, right) in a.iter().zip(b.iter()) {
        diff |= left ^ right;
    }
    diff == 0
}
