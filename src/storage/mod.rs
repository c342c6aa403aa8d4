//! Storage port: session, cached-message, and device-token persistence.
//!
//! The broker core depends only on the [`Storage`] trait. Two conforming
//! backends ship with the crate:
//! - [`memory::MemoryStorage`]: HashMaps behind async locks, no durability;
//!   for tests and deployments that accept losing pending redeliveries.
//! - [`sqlite::SqliteStorage`]: durable across restarts via `sqlx`.
//!
//! The core never assumes durability, only the contract below. Backends must
//! be safe for concurrent callers and linearizable per primary key.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod memory;
pub mod sqlite;

/// Tenant root record. Field names are stable across backends.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub session_name: String,
    pub password: String,
    pub secret_key: String,
    /// Delay between redeliveries of an unacked message, in milliseconds.
    pub retry_interval: u64,
    /// Redelivery ceiling; 0 means deliver once and never retry.
    pub max_retry_limit: u32,
    /// Per-message time-to-live in milliseconds; `None` = no expiry.
    pub message_expiry_time: Option<u64>,
    /// Absolute expiry of the session itself (epoch ms); `None` = never.
    pub session_expiry: Option<u64>,
    pub suspended: bool,
    /// Opaque offline-notifier configuration; `None` disables the hook.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notifier: Option<serde_json::Value>,
}

/// An in-flight publish awaiting acknowledgement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedMessage {
    pub message_id: String,
    pub session_name: String,
    pub topic: String,
    /// Opaque client payload (encrypted end to end).
    pub data: String,
    /// Opaque integrity tag supplied by the publisher.
    pub hash: String,
    /// Client-supplied publish timestamp, relayed verbatim.
    pub timestamp: u64,
    /// Frame type re-sent on redelivery.
    #[serde(rename = "type")]
    pub frame_type: String,
    pub published_at: u64,
    pub retry_count: u32,
    /// Absolute expiry (epoch ms); `None` = bounded only by the retry limit.
    pub expiry_time: Option<u64>,
    /// Retry ceiling captured from the session at publish time.
    pub max_retry_limit: u32,
    /// Retry interval captured from the session at publish time.
    pub retry_interval: u64,
}

/// Push-notification token for an offline user, keyed
/// `(sessionName, userId, deviceId)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceToken {
    pub session_name: String,
    pub user_id: String,
    pub device_id: String,
    pub token: String,
    pub platform: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Fields mutable through `update_session`. Last write wins.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub suspended: Option<bool>,
    pub session_expiry: Option<Option<u64>>,
    pub notifier: Option<Option<serde_json::Value>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupCounts {
    pub messages: u64,
    pub sessions: u64,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

#[async_trait]
pub trait Storage: Send + Sync {
    /// Idempotent; creates schema if needed. Failure at boot is fatal.
    async fn init(&self) -> StorageResult<()>;

    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()>;
    async fn get_session(&self, name: &str) -> StorageResult<Option<SessionRecord>>;
    async fn update_session(&self, name: &str, patch: SessionPatch) -> StorageResult<()>;
    /// Also removes the session's cached messages. Idempotent.
    async fn delete_session(&self, name: &str) -> StorageResult<()>;
    async fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>>;

    /// Upsert by `message_id`.
    async fn save_message(&self, message: &CachedMessage) -> StorageResult<()>;
    async fn get_message(&self, message_id: &str) -> StorageResult<Option<CachedMessage>>;
    /// Idempotent.
    async fn remove_message(&self, message_id: &str) -> StorageResult<()>;
    /// Messages still awaiting acknowledgement for one session; used on recovery.
    async fn list_pending_messages(&self, session: &str) -> StorageResult<Vec<CachedMessage>>;

    /// Deletes messages with `expiry_time < now` and sessions with
    /// `session_expiry < now` (cascading their messages).
    async fn cleanup_expired(&self, now_ms: u64) -> StorageResult<CleanupCounts>;

    /// Upsert by `(session_name, user_id, device_id)`.
    async fn save_device_token(&self, token: &DeviceToken) -> StorageResult<()>;
    /// All tokens registered under one session.
    async fn get_device_tokens(&self, session: &str) -> StorageResult<Vec<DeviceToken>>;
    async fn delete_device_token(
        &self,
        session: &str,
        user_id: &str,
        device_id: &str,
    ) -> StorageResult<()>;
}
