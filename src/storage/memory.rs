//! In-memory storage backend.
//!
//! HashMaps behind `tokio::sync::RwLock`: reads are concurrent, writes are
//! serialized per map. All state is lost on restart; the broker treats
//! pending redeliveries on this backend as best-effort.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{
    CachedMessage, CleanupCounts, DeviceToken, SessionPatch, SessionRecord, Storage, StorageError,
    StorageResult,
};

type TokenKey = (String, String, String);

#[derive(Default)]
pub struct MemoryStorage {
    sessions: Arc<RwLock<HashMap<String, SessionRecord>>>,
    messages: Arc<RwLock<HashMap<String, CachedMessage>>>,
    tokens: Arc<RwLock<HashMap<TokenKey, DeviceToken>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn init(&self) -> StorageResult<()> {
        Ok(())
    }

    async fn create_session(&self, session: &SessionRecord) -> StorageResult<()> {
        let mut sessions = self.sessions.write().await;
        if sessions.contains_key(&session.session_name) {
            return Err(StorageError::AlreadyExists(session.session_name.clone()));
        }
        sessions.insert(session.session_name.clone(), session.clone());
        Ok(())
    }

    async fn get_session(&self, name: &str) -> StorageResult<Option<SessionRecord>> {
        Ok(self.sessions.read().await.get(name).cloned())
    }

    async fn update_session(&self, name: &str, patch: SessionPatch) -> StorageResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(name)
            .ok_or_else(|| StorageError::NotFound(name.to_string()))?;
        if let Some(suspended) = patch.suspended {
            session.suspended = suspended;
        }
        if let Some(expiry) = patch.session_expiry {
            session.session_expiry = expiry;
        }
        if let Some(notifier) = patch.notifier {
            session.notifier = notifier;
        }
        Ok(())
    }

    async fn delete_session(&self, name: &str) -> StorageResult<()> {
        self.sessions.write().await.remove(name);
        self.messages
            .write()
            .await
            .retain(|_, m| m.session_name != name);
        self.tokens
            .write()
            .await
            .retain(|(session, _, _), _| session != name);
        Ok(())
    }

    async fn list_sessions(&self) -> StorageResult<Vec<SessionRecord>> {
        Ok(self.sessions.read().await.values().cloned().collect())
    }

    async fn save_message(&self, message: &CachedMessage) -> StorageResult<()> {
        self.messages
            .write()
            .await
            .insert(message.message_id.clone(), message.clone());
        Ok(())
    }

    async fn get_message(&self, message_id: &str) -> StorageResult<Option<CachedMessage>> {
        Ok(self.messages.read().await.get(message_id).cloned())
    }

    async fn remove_message(&self, message_id: &str) -> StorageResult<()> {
        self.messages.write().await.remove(message_id);
        Ok(())
    }

    async fn list_pending_messages(&self, session: &str) -> StorageResult<Vec<CachedMessage>> {
        Ok(self
            .messages
            .read()
            .await
            .values()
            .filter(|m| m.session_name == session)
            .cloned()
            .collect())
    }

    async fn cleanup_expired(&self, now_ms: u64) -> StorageResult<CleanupCounts> {
        let mut counts = CleanupCounts::default();

        let expired_sessions: Vec<String> = {
            let sessions = self.sessions.read().await;
            sessions
                .values()
                .filter(|s| s.session_expiry.is_some_and(|at| at < now_ms))
                .map(|s| s.session_name.clone())
                .collect()
        };
        for name in &expired_sessions {
            self.delete_session(name).await?;
        }
        counts.sessions = expired_sessions.len() as u64;

        let mut messages = self.messages.write().await;
        let before = messages.len();
        messages.retain(|_, m| !m.expiry_time.is_some_and(|at| at < now_ms));
        counts.messages = (before - messages.len()) as u64;

        Ok(counts)
    }

    async fn save_device_token(&self, token: &DeviceToken) -> StorageResult<()> {
        let key = (
            token.session_name.clone(),
            token.user_id.clone(),
            token.device_id.clone(),
        );
        self.tokens.write().await.insert(key, token.clone());
        Ok(())
    }

    async fn get_device_tokens(&self, session: &str) -> StorageResult<Vec<DeviceToken>> {
        Ok(self
            .tokens
            .read()
            .await
            .values()
            .filter(|t| t.session_name == session)
            .cloned()
            .collect())
    }

    async fn delete_device_token(
        &self,
        session: &str,
        user_id: &str,
        device_id: &str,
    ) -> StorageResult<()> {
        let key = (
            session.to_string(),
            user_id.to_string(),
            device_id.to_string(),
        );
        self.tokens.write().await.remove(&key);
        Ok(())
    }
}
