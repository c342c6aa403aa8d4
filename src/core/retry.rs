//! Message cache and at-least-once retry engine.
//!
//! One cached message owns at most one live timer; that is the invariant
//! everything here is arranged around. Timer state lives in a map keyed by
//! `messageId`, per-message transitions serialize behind a per-id mutex,
//! and a firing callback defensively reloads the message from storage
//! instead of trusting captured state, so an ack that raced the timer wins.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::core::clock::{Clock, TimerHandle};
use crate::core::protocol::{server_frame_to_wire, ServerFrame};
use crate::core::subscribers::{ConnectionHandle, SubscriberIndex};
use crate::metrics;
use crate::storage::{CachedMessage, Storage, StorageResult};

struct TimerSlot {
    session: String,
    handle: TimerHandle,
}

/// Why a cached message reached its terminal state without an ack.
#[derive(Debug, Clone, Copy)]
enum DropReason {
    Expired,
    RetryLimit,
    SessionGone,
    NoSubscribers,
}

impl DropReason {
    fn as_str(self) -> &'static str {
        match self {
            DropReason::Expired => "expired",
            DropReason::RetryLimit => "retry limit reached",
            DropReason::SessionGone => "session gone or suspended",
            DropReason::NoSubscribers => "no live subscribers",
        }
    }

    fn count(self) {
        match self {
            DropReason::Expired => metrics::inc_dropped_expired(1),
            DropReason::RetryLimit => metrics::inc_dropped_retry_limit(1),
            DropReason::SessionGone | DropReason::NoSubscribers => {
                metrics::inc_dropped_orphaned(1)
            }
        }
    }
}

#[derive(Clone)]
pub struct RetryEngine {
    inner: Arc<RetryInner>,
}

struct RetryInner {
    storage: Arc<dyn Storage>,
    index: Arc<SubscriberIndex>,
    clock: Arc<dyn Clock>,
    /// Live timers, at most one per messageId.
    timers: DashMap<String, TimerSlot>,
    /// Per-message transition locks; never held across the timers map.
    locks: DashMap<String, Arc<Mutex<()>>>,
    /// Publisher connections awaiting `ack_received`, in-memory only.
    publishers: DashMap<String, ConnectionHandle>,
}

impl RetryEngine {
    pub fn new(
        storage: Arc<dyn Storage>,
        index: Arc<SubscriberIndex>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            inner: Arc::new(RetryInner {
                storage,
                index,
                clock,
                timers: DashMap::new(),
                locks: DashMap::new(),
                publishers: DashMap::new(),
            }),
        }
    }

    fn lock_for(&self, message_id: &str) -> Arc<Mutex<()>> {
        self.inner
            .locks
            .entry(message_id.to_string())
            .or_default()
            .clone()
    }

    /// Drops all in-memory state for one message and cancels its timer.
    fn forget(&self, message_id: &str) {
        if let Some((_, slot)) = self.inner.timers.remove(message_id) {
            slot.handle.cancel();
        }
        self.inner.locks.remove(message_id);
        self.inner.publishers.remove(message_id);
    }

    fn arm(&self, message_id: &str, session: &str, delay_ms: u64) {
        let engine = self.clone();
        let id = message_id.to_string();
        let handle = self.inner.clock.after(
            delay_ms,
            Box::new(move || {
                tokio::spawn(async move {
                    engine.on_timer_fired(&id).await;
                });
            }),
        );
        // Re-arming replaces (and cancels) any previous timer for this id.
        if let Some(prev) = self.inner.timers.insert(
            message_id.to_string(),
            TimerSlot {
                session: session.to_string(),
                handle,
            },
        ) {
            prev.handle.cancel();
        }
    }

    /// Persists a fresh publish (upsert by `messageId`) and remembers the
    /// publisher connection for the later `ack_received` notification.
    pub async fn cache(
        &self,
        message: &CachedMessage,
        publisher: Option<ConnectionHandle>,
    ) -> StorageResult<()> {
        self.inner.storage.save_message(message).await?;
        match publisher {
            Some(conn) => {
                self.inner
                    .publishers
                    .insert(message.message_id.clone(), conn);
            }
            None => {
                self.inner.publishers.remove(&message.message_id);
            }
        }
        Ok(())
    }

    /// Arms the retry timer for a cached message, if it is still alive.
    ///
    /// Absent message: no-op. Expired: terminal removal. Retry ceiling
    /// already reached (`maxRetryLimit = 0`): no timer; the message waits
    /// for its ack, its expiry, or its session's drop.
    pub async fn schedule_retry(&self, message_id: &str) {
        let lock = self.lock_for(message_id);
        let _guard = lock.lock().await;

        let message = match self.inner.storage.get_message(message_id).await {
            Ok(Some(m)) => m,
            Ok(None) => return,
            Err(e) => {
                warn!(message_id, error = %e, "schedule_retry: load failed");
                return;
            }
        };

        let now = self.inner.clock.now_ms();
        if message.expiry_time.is_some_and(|at| now >= at) {
            self.remove_terminal(&message, DropReason::Expired).await;
            return;
        }
        if message.retry_count >= message.max_retry_limit {
            return;
        }
        self.arm(message_id, &message.session_name, message.retry_interval);
    }

    async fn on_timer_fired(&self, message_id: &str) {
        let lock = self.lock_for(message_id);
        let _guard = lock.lock().await;

        // An ack may have raced the firing; storage is the truth.
        let message = match self.inner.storage.get_message(message_id).await {
            Ok(Some(m)) => m,
            Ok(None) => {
                self.forget(message_id);
                return;
            }
            Err(e) => {
                warn!(message_id, error = %e, "retry reload failed");
                self.forget(message_id);
                return;
            }
        };

        let session = match self.inner.storage.get_session(&message.session_name).await {
            Ok(s) => s,
            Err(e) => {
                warn!(message_id, error = %e, "retry session load failed");
                self.forget(message_id);
                return;
            }
        };
        let deliverable = session.as_ref().map(|s| !s.suspended).unwrap_or(false);
        if !deliverable {
            self.remove_terminal(&message, DropReason::SessionGone).await;
            return;
        }

        let now = self.inner.clock.now_ms();
        if message.expiry_time.is_some_and(|at| now >= at) {
            self.remove_terminal(&message, DropReason::Expired).await;
            return;
        }
        if message.retry_count >= message.max_retry_limit {
            self.remove_terminal(&message, DropReason::RetryLimit).await;
            return;
        }

        let subscribers: Vec<ConnectionHandle> = self
            .inner
            .index
            .subscribers_of(&message.session_name, &message.topic)
            .into_iter()
            .filter(|c| !c.is_closed())
            .collect();
        if subscribers.is_empty() {
            self.remove_terminal(&message, DropReason::NoSubscribers).await;
            return;
        }

        let mut updated = message.clone();
        updated.retry_count += 1;
        if let Err(e) = self.inner.storage.save_message(&updated).await {
            warn!(message_id, error = %e, "persisting retry count failed");
        }

        let wire = server_frame_to_wire(&ServerFrame::Message {
            topic: updated.topic.clone(),
            data: updated.data.clone(),
            hash: updated.hash.clone(),
            timestamp: updated.timestamp,
            message_id: updated.message_id.clone(),
        });
        for conn in &subscribers {
            conn.send_wire(wire.clone());
        }
        metrics::inc_retried(1);
        info!(
            event = "message.retried",
            message_id,
            session = %updated.session_name,
            topic = %updated.topic,
            retry_count = updated.retry_count,
            subscribers = subscribers.len(),
        );

        self.arm(message_id, &updated.session_name, updated.retry_interval);
    }

    async fn remove_terminal(&self, message: &CachedMessage, reason: DropReason) {
        if let Err(e) = self
            .inner
            .storage
            .remove_message(&message.message_id)
            .await
        {
            warn!(message_id = %message.message_id, error = %e, "terminal removal failed");
        }
        self.forget(&message.message_id);
        reason.count();
        info!(
            event = "message.dropped",
            message_id = %message.message_id,
            session = %message.session_name,
            reason = reason.as_str(),
        );
    }

    /// Acknowledges a message: cancels the timer, deletes storage state,
    /// and notifies the original publisher when it is still connected.
    /// Duplicate acks are silently ignored; cross-tenant acks are dropped.
    pub async fn ack(&self, session: &str, message_id: &str) {
        let lock = self.lock_for(message_id);
        let _guard = lock.lock().await;

        match self.inner.storage.get_message(message_id).await {
            Ok(Some(message)) if message.session_name == session => {
                if let Err(e) = self.inner.storage.remove_message(message_id).await {
                    warn!(message_id, error = %e, "ack removal failed");
                }
                metrics::inc_acked(1);
                if let Some(publisher) = self
                    .inner
                    .publishers
                    .get(message_id)
                    .map(|p| p.value().clone())
                {
                    if publisher.is_authenticated() && !publisher.is_closed() {
                        publisher.send_frame(&ServerFrame::AckReceived {
                            message_id: message_id.to_string(),
                        });
                    }
                }
                self.forget(message_id);
            }
            Ok(Some(_)) => {
                debug!(message_id, session, "ack for foreign session ignored");
            }
            Ok(None) => {
                // Already terminal; drop any leftover timer state.
                self.forget(message_id);
            }
            Err(e) => {
                warn!(message_id, error = %e, "ack load failed");
            }
        }
    }

    /// Cancels every retry timer belonging to one session. Storage cleanup
    /// is the caller's business (`delete_session` cascades messages).
    pub fn purge_session(&self, session: &str) {
        let ids: Vec<String> = self
            .inner
            .timers
            .iter()
            .filter(|entry| entry.value().session == session)
            .map(|entry| entry.key().clone())
            .collect();
        for id in ids {
            self.forget(&id);
        }
    }

    /// Re-arms timers for messages that survived a restart. The first
    /// deadline is biased to `publishedAt + retryInterval * (retryCount+1)`,
    /// clipped to now.
    pub async fn recover(&self) -> StorageResult<()> {
        let sessions = self.inner.storage.list_sessions().await?;
        let now = self.inner.clock.now_ms();
        let mut recovered = 0usize;
        for session in sessions {
            for message in self
                .inner
                .storage
                .list_pending_messages(&session.session_name)
                .await?
            {
                let deadline = message
                    .published_at
                    .saturating_add(message.retry_interval * (message.retry_count as u64 + 1));
                let delay = deadline.saturating_sub(now);
                self.arm(&message.message_id, &message.session_name, delay);
                recovered += 1;
            }
        }
        if recovered > 0 {
            info!(recovered, "re-armed pending message timers");
        }
        Ok(())
    }

    /// Whether a live timer exists for `messageId`. Test seam.
    pub fn has_timer(&self, message_id: &str) -> bool {
        self.inner
            .timers
            .get(message_id)
            .is_some_and(|slot| !slot.handle.is_cancelled())
    }
}
