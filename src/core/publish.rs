//! Publish pipeline: optimistic fan-out first, bookkeeping after.
//!
//! Delivery to live subscribers never waits on storage; persistence and
//! retry scheduling happen only when the fan-out actually reached someone,
//! and a storage failure downgrades to a warning rather than failing the
//! publish (the frames are already out).

use std::sync::Arc;
use std::time::Duration;

use tokio::time::timeout;
use tracing::{info, warn};

use crate::core::clock::Clock;
use crate::core::notifier::OfflineNotifier;
use crate::core::protocol::{server_frame_to_wire, ServerFrame};
use crate::core::retry::RetryEngine;
use crate::core::subscribers::{ConnectionHandle, SubscriberIndex};
use crate::metrics;
use crate::storage::{CachedMessage, Storage};

pub const MESSAGE_FRAME_TYPE: &str = "message";

#[derive(Clone)]
pub struct PublishPipeline {
    inner: Arc<PipelineInner>,
}

struct PipelineInner {
    storage: Arc<dyn Storage>,
    index: Arc<SubscriberIndex>,
    retry: RetryEngine,
    notifier: Arc<dyn OfflineNotifier>,
    clock: Arc<dyn Clock>,
    notifier_deadline: Duration,
}

pub struct PublishRequest {
    pub topic: String,
    pub data: String,
    pub hash: String,
    pub timestamp: u64,
    pub message_id: String,
}

impl PublishPipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        index: Arc<SubscriberIndex>,
        retry: RetryEngine,
        notifier: Arc<dyn OfflineNotifier>,
        clock: Arc<dyn Clock>,
        notifier_deadline: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PipelineInner {
                storage,
                index,
                retry,
                notifier,
                clock,
                notifier_deadline,
            }),
        }
    }

    /// Runs one publish end to end and returns the response frame for the
    /// sender.
    pub async fn publish(
        &self,
        sender: &ConnectionHandle,
        session_name: &str,
        request: PublishRequest,
    ) -> ServerFrame {
        // Tenancy gate.
        let session = match self.inner.storage.get_session(session_name).await {
            Ok(Some(s)) => s,
            Ok(None) => {
                return ServerFrame::PublishResponse {
                    success: false,
                    message_id: None,
                    delivered_to: None,
                    error: Some("unknown session".into()),
                };
            }
            Err(e) => {
                warn!(session = session_name, error = %e, "publish: session load failed");
                return ServerFrame::PublishResponse {
                    success: false,
                    message_id: None,
                    delivered_to: None,
                    error: Some("storage unavailable".into()),
                };
            }
        };
        if session.suspended {
            return ServerFrame::PublishResponse {
                success: false,
                message_id: None,
                delivered_to: None,
                error: Some("suspended".into()),
            };
        }

        // Optimistic fan-out over a snapshot, sender excluded.
        let subscribers: Vec<ConnectionHandle> = self
            .inner
            .index
            .subscribers_of(session_name, &request.topic)
            .into_iter()
            .filter(|c| c.id() != sender.id() && !c.is_closed())
            .collect();

        let wire = server_frame_to_wire(&ServerFrame::Message {
            topic: request.topic.clone(),
            data: request.data.clone(),
            hash: request.hash.clone(),
            timestamp: request.timestamp,
            message_id: request.message_id.clone(),
        });
        let mut delivered = 0u32;
        for conn in &subscribers {
            if conn.send_wire(wire.clone()) {
                delivered += 1;
            }
        }
        metrics::inc_published(1);
        metrics::inc_delivered(delivered as u64);
        info!(
            event = "publish.delivered",
            session = session_name,
            topic = %request.topic,
            message_id = %request.message_id,
            delivered,
        );

        // Cache and arm the retry timer only when someone was reached;
        // a no-audience topic must not churn timers.
        if delivered > 0 {
            let now = self.inner.clock.now_ms();
            let message = CachedMessage {
                message_id: request.message_id.clone(),
                session_name: session_name.to_string(),
                topic: request.topic.clone(),
                data: request.data,
                hash: request.hash,
                timestamp: request.timestamp,
                frame_type: MESSAGE_FRAME_TYPE.to_string(),
                published_at: now,
                retry_count: 0,
                expiry_time: session.message_expiry_time.map(|ttl| now + ttl),
                max_retry_limit: session.max_retry_limit,
                retry_interval: session.retry_interval,
            };
            match self.inner.retry.cache(&message, Some(sender.clone())).await {
                Ok(()) => self.inner.retry.schedule_retry(&message.message_id).await,
                // Best-effort durability: fan-out already happened.
                Err(e) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %e,
                        "caching publish failed; delivery is fire-and-forget"
                    );
                }
            }
        }

        // Offline-push hook, fire and forget.
        if session.notifier.is_some() {
            self.spawn_offline_push(session_name, &request.topic);
        }

        ServerFrame::PublishResponse {
            success: true,
            message_id: Some(request.message_id),
            delivered_to: Some(delivered),
            error: None,
        }
    }

    /// Pushes to users known through device tokens that have no live
    /// connection. Bounded by one total deadline; failures are swallowed.
    fn spawn_offline_push(&self, session_name: &str, topic: &str) {
        let inner = Arc::clone(&self.inner);
        let session = session_name.to_string();
        let preview = topic.to_string();
        tokio::spawn(async move {
            let push_all = async {
                let tokens = match inner.storage.get_device_tokens(&session).await {
                    Ok(tokens) => tokens,
                    Err(e) => {
                        warn!(session = %session, error = %e, "offline push: token load failed");
                        return;
                    }
                };
                let mut users: Vec<String> = tokens.into_iter().map(|t| t.user_id).collect();
                users.sort();
                users.dedup();
                for user in users {
                    if !inner.index.user_online(&session, &user) {
                        inner.notifier.push_offline(&session, &user, &preview).await;
                    }
                }
            };
            if timeout(inner.notifier_deadline, push_all).await.is_err() {
                warn!(session = %session, "offline push batch hit its deadline");
            }
        });
    }
}
