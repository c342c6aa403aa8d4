//! Connection state machine.
//!
//! A connection starts in *New* and only an `init` frame can move it to
//! *Authenticated*; everything else gets an inline `error` reply and no
//! side effects. Per-frame failures never terminate the connection;
//! only transport loss, an oversized frame, or a session drop do.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, info, warn};

use crate::core::crypto;
use crate::core::error::BrokerError;
use crate::core::protocol::{self, ClientFrame, ServerFrame, CHUNK_MARKER, TEXT_MARKER};
use crate::core::publish::PublishRequest;
use crate::core::subscribers::ConnectionHandle;
use crate::metrics;
use crate::storage::DeviceToken;

use super::Broker;

enum ConnState {
    New,
    Authenticated {
        session: String,
        user_id: Option<String>,
    },
}

/// Plaintext of a `register_fcm_token` envelope.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenRegistration {
    token: String,
    device_id: String,
    platform: String,
}

pub struct Connection {
    broker: Arc<Broker>,
    handle: ConnectionHandle,
    state: ConnState,
    uploads: HashMap<String, String>,
    done: bool,
}

impl Connection {
    pub fn new(broker: Arc<Broker>, handle: ConnectionHandle) -> Self {
        Self {
            broker,
            handle,
            state: ConnState::New,
            uploads: HashMap::new(),
            done: false,
        }
    }

    /// Drives the read side until transport loss, an oversized frame, or
    /// an external shutdown, then releases everything the connection owns.
    pub async fn run<R>(mut self, mut reader: R)
    where
        R: AsyncRead + Unpin,
    {
        let max_payload = self.broker.config.server.max_payload_size;
        let mut len_buf = [0u8; 4];

        loop {
            tokio::select! {
                read = reader.read_exact(&mut len_buf) => {
                    if read.is_err() {
                        break;
                    }
                    let len = u32::from_be_bytes(len_buf) as usize;
                    if len == 0 {
                        continue;
                    }
                    if len > max_payload {
                        warn!(conn = self.handle.id(), len, "oversized frame, closing");
                        break;
                    }
                    let mut body = vec![0u8; len];
                    if reader.read_exact(&mut body).await.is_err() {
                        break;
                    }
                    self.process_body(&body).await;
                }
                _ = self.handle.closed_signal() => {
                    break;
                }
            }
            if self.handle.is_closed() {
                break;
            }
        }

        self.cleanup();
    }

    async fn process_body(&mut self, body: &[u8]) {
        match body[0] {
            TEXT_MARKER => match protocol::parse_client_frame(&body[1..]) {
                Ok(frame) => self.dispatch(frame).await,
                Err(e) => {
                    debug!(conn = self.handle.id(), error = %e, "malformed text frame");
                    self.handle
                        .send_frame(&ServerFrame::error("Malformed frame"));
                }
            },
            CHUNK_MARKER => match &self.state {
                ConnState::Authenticated { session, .. } => {
                    self.broker
                        .files
                        .chunk(&self.handle, session, &self.uploads, body);
                }
                ConnState::New => {
                    self.handle
                        .send_frame(&ServerFrame::error("Not initialized"));
                }
            },
            _ => {
                self.handle
                    .send_frame(&ServerFrame::error("Unknown message type"));
            }
        }
    }

    async fn dispatch(&mut self, frame: ClientFrame) {
        match (&self.state, frame) {
            (
                ConnState::New,
                ClientFrame::Init {
                    session_name,
                    password,
                    user_id,
                },
            ) => self.handle_init(session_name, password, user_id).await,
            (ConnState::New, _) => {
                self.handle
                    .send_frame(&ServerFrame::error("Not initialized"));
            }
            (ConnState::Authenticated { .. }, ClientFrame::Init { .. }) => {
                self.handle
                    .send_frame(&ServerFrame::error("Already initialized"));
            }
            (ConnState::Authenticated { session, .. }, frame) => {
                let session = session.clone();
                self.dispatch_authenticated(&session, frame).await;
            }
        }
    }

    async fn handle_init(
        &mut self,
        session_name: String,
        password: String,
        user_id: Option<String>,
    ) {
        match self
            .broker
            .registry
            .validate_init(&session_name, &password)
            .await
        {
            Ok(_) => {
                self.handle.set_authenticated(true);
                self.broker
                    .index
                    .register_connection(&session_name, &self.handle);
                if let Some(user) = &user_id {
                    self.broker
                        .index
                        .register_user(&session_name, user, &self.handle);
                }
                self.state = ConnState::Authenticated {
                    session: session_name,
                    user_id,
                };
                self.handle.send_frame(&ServerFrame::InitResponse {
                    success: true,
                    error: None,
                });
            }
            Err(err) => {
                let reason = match err {
                    BrokerError::Suspended => "suspended",
                    BrokerError::Auth => "authentication failed",
                    _ => "storage unavailable",
                };
                self.handle.send_frame(&ServerFrame::InitResponse {
                    success: false,
                    error: Some(reason.into()),
                });
            }
        }
    }

    async fn dispatch_authenticated(&mut self, session: &str, frame: ClientFrame) {
        match frame {
            ClientFrame::Subscribe { topic } => {
                self.broker.index.subscribe(session, &topic, &self.handle);
                self.handle.send_frame(&ServerFrame::SubscribeResponse {
                    success: true,
                    topic,
                });
            }
            ClientFrame::Unsubscribe { topic } => {
                self.broker
                    .index
                    .unsubscribe(session, &topic, self.handle.id());
                self.handle.send_frame(&ServerFrame::UnsubscribeResponse {
                    success: true,
                    topic,
                });
            }
            ClientFrame::Publish {
                topic,
                data,
                hash,
                timestamp,
                message_id,
            } => {
                let response = self
                    .broker
                    .pipeline
                    .publish(
                        &self.handle,
                        session,
                        PublishRequest {
                            topic,
                            data,
                            hash,
                            timestamp,
                            message_id,
                        },
                    )
                    .await;
                self.handle.send_frame(&response);
            }
            ClientFrame::Ack { message_id, .. } => {
                self.broker.retry.ack(session, &message_id).await;
            }
            ClientFrame::InitFile {
                topic,
                file_id,
                file_name,
                file_size,
                total_chunks,
            } => {
                if let Some(reply) = self
                    .broker
                    .files
                    .init_file(
                        &self.handle,
                        session,
                        &mut self.uploads,
                        topic,
                        file_id,
                        file_name,
                        file_size,
                        total_chunks,
                    )
                    .await
                {
                    self.handle.send_frame(&reply);
                }
            }
            ClientFrame::EndFile {
                topic,
                file_id,
                hash,
            } => {
                self.broker.files.end_file(
                    &self.handle,
                    session,
                    &mut self.uploads,
                    topic,
                    file_id,
                    hash,
                );
            }
            ClientFrame::RegisterFcmToken {
                user_id,
                encrypted_data,
                hash,
            } => {
                let reply = self
                    .register_token(session, &user_id, &encrypted_data, &hash)
                    .await;
                self.handle.send_frame(&reply);
            }
            ClientFrame::Init { .. } => {
                // unreachable through dispatch(), kept for exhaustiveness
                self.handle
                    .send_frame(&ServerFrame::error("Already initialized"));
            }
        }
    }

    /// Verifies and opens a token-registration envelope, then persists
    /// the device token. The token itself never goes back on the wire.
    async fn register_token(
        &self,
        session: &str,
        user_id: &str,
        encrypted_data: &str,
        hash: &str,
    ) -> ServerFrame {
        let record = match self.broker.storage.get_session(session).await {
            Ok(Some(record)) => record,
            _ => {
                return ServerFrame::FcmTokenResponse {
                    success: false,
                    error: Some("session unavailable".into()),
                };
            }
        };

        let plaintext = match crypto::open_envelope(&record.secret_key, encrypted_data, hash) {
            Ok(p) => p,
            Err(e) => {
                return ServerFrame::FcmTokenResponse {
                    success: false,
                    error: Some(e.to_string()),
                };
            }
        };
        let registration: TokenRegistration = match serde_json::from_slice(&plaintext) {
            Ok(r) => r,
            Err(_) => {
                return ServerFrame::FcmTokenResponse {
                    success: false,
                    error: Some("invalid token payload".into()),
                };
            }
        };

        let now = self.broker.clock.now_ms();
        let token = DeviceToken {
            session_name: session.to_string(),
            user_id: user_id.to_string(),
            device_id: registration.device_id,
            token: registration.token,
            platform: registration.platform,
            created_at: now,
            updated_at: now,
        };
        match self.broker.storage.save_device_token(&token).await {
            Ok(()) => ServerFrame::FcmTokenResponse {
                success: true,
                error: None,
            },
            Err(e) => {
                warn!(session, error = %e, "saving device token failed");
                ServerFrame::FcmTokenResponse {
                    success: false,
                    error: Some("storage unavailable".into()),
                }
            }
        }
    }

    /// Releases subscriptions, the user binding, and upload mappings.
    /// Safe to call more than once; runs on every exit path.
    fn cleanup(&mut self) {
        if self.done {
            return;
        }
        self.done = true;

        if let ConnState::Authenticated { session, user_id } = &self.state {
            self.broker
                .index
                .unregister_connection(session, self.handle.id());
            if let Some(user) = user_id {
                self.broker.index.unregister_user(session, user);
            }
        }
        self.uploads.clear();
        self.handle.shutdown();
        metrics::inc_connections_closed(1);
        info!(
            event = "connection.closed",
            conn = self.handle.id(),
        );
    }
}
