//! File stream router: init/chunk/end relaying without buffering.
//!
//! File traffic never touches the message cache. `init_file` records the
//! sender's `fileId → topic` mapping, chunks are forwarded byte-for-byte
//! to the current subscribers, `end_file` forwards and forgets the
//! mapping. Chunk loss is silent; reliability is a client concern.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tracing::debug;

use crate::core::protocol::{self, ServerFrame};
use crate::core::subscribers::{ConnectionHandle, SubscriberIndex};
use crate::metrics;
use crate::storage::Storage;

#[derive(Clone)]
pub struct FileRouter {
    storage: Arc<dyn Storage>,
    index: Arc<SubscriberIndex>,
}

impl FileRouter {
    pub fn new(storage: Arc<dyn Storage>, index: Arc<SubscriberIndex>) -> Self {
        Self { storage, index }
    }

    fn relay(&self, session: &str, topic: &str, sender_id: u64, wire: Bytes) -> usize {
        let subscribers = self.index.subscribers_of(session, topic);
        let mut forwarded = 0;
        for conn in &subscribers {
            if conn.id() != sender_id && !conn.is_closed() && conn.send_wire(wire.clone()) {
                forwarded += 1;
            }
        }
        forwarded
    }

    /// Starts an upload: records the mapping on the sender's upload table
    /// and relays the envelope. Returns the reply for the sender, if any.
    pub async fn init_file(
        &self,
        sender: &ConnectionHandle,
        session: &str,
        uploads: &mut HashMap<String, String>,
        topic: String,
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    ) -> Option<ServerFrame> {
        let deliverable = match self.storage.get_session(session).await {
            Ok(Some(s)) => !s.suspended,
            _ => false,
        };
        if !deliverable {
            return Some(ServerFrame::error("session suspended or missing"));
        }

        uploads.insert(file_id.clone(), topic.clone());
        let wire = protocol::server_frame_to_wire(&ServerFrame::InitFile {
            topic: topic.clone(),
            file_id,
            file_name,
            file_size,
            total_chunks,
        });
        self.relay(session, &topic, sender.id(), wire);
        None
    }

    /// Forwards one binary chunk verbatim. Frames below the minimum
    /// length, or for a fileId the sender never announced, are dropped
    /// silently.
    pub fn chunk(
        &self,
        sender: &ConnectionHandle,
        session: &str,
        uploads: &HashMap<String, String>,
        body: &[u8],
    ) {
        let Some(header) = protocol::parse_chunk_header(body) else {
            return;
        };
        let Some(topic) = uploads.get(&header.file_id) else {
            debug!(file_id = %header.file_id, "chunk for unannounced upload dropped");
            return;
        };
        let wire = protocol::chunk_to_wire(body);
        self.relay(session, topic, sender.id(), wire);
    }

    /// Ends an upload: relays the envelope and forgets the mapping.
    pub fn end_file(
        &self,
        sender: &ConnectionHandle,
        session: &str,
        uploads: &mut HashMap<String, String>,
        topic: String,
        file_id: String,
        hash: Option<String>,
    ) {
        uploads.remove(&file_id);
        let wire = protocol::server_frame_to_wire(&ServerFrame::EndFile {
            topic: topic.clone(),
            file_id,
            hash,
        });
        self.relay(session, &topic, sender.id(), wire);
        metrics::inc_files_relayed(1);
    }
}
