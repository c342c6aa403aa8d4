//! Wire protocol: JSON text frames plus raw binary file chunks.
//!
//! Every frame on the transport is length-prefixed:
//!
//! ```text
//! [len : u32 BE][body : len bytes]
//! ```
//!
//! `body[0]` selects the kind: `0x01` means the rest of the body is a UTF-8
//! JSON document; `0x02` means the whole body (marker included) is a file
//! chunk laid out as `[0x02][fileId : 36B ASCII][chunkIndex : u32 BE][payload]`.
//! Chunk payloads are opaque to the broker and forwarded byte-for-byte.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};

pub const LENGTH_FIELD_LEN: usize = 4;
pub const TEXT_MARKER: u8 = 0x01;
pub const CHUNK_MARKER: u8 = 0x02;
pub const FILE_ID_LEN: usize = 36;
/// Marker + fileId + chunkIndex. Shorter binary bodies are dropped.
pub const MIN_CHUNK_LEN: usize = 1 + FILE_ID_LEN + 4;

/// Frames a client sends to the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    #[serde(rename_all = "camelCase")]
    Init {
        session_name: String,
        password: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        user_id: Option<String>,
    },
    Subscribe {
        topic: String,
    },
    Unsubscribe {
        topic: String,
    },
    #[serde(rename_all = "camelCase")]
    Publish {
        topic: String,
        data: String,
        hash: String,
        timestamp: u64,
        message_id: String,
    },
    #[serde(rename_all = "camelCase")]
    Ack {
        topic: String,
        message_id: String,
    },
    #[serde(rename_all = "camelCase")]
    InitFile {
        topic: String,
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    #[serde(rename_all = "camelCase")]
    EndFile {
        topic: String,
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    RegisterFcmToken {
        user_id: String,
        encrypted_data: String,
        hash: String,
    },
}

/// Frames the broker sends to a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    #[serde(rename_all = "camelCase")]
    InitResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    SubscribeResponse {
        success: bool,
        topic: String,
    },
    UnsubscribeResponse {
        success: bool,
        topic: String,
    },
    #[serde(rename_all = "camelCase")]
    PublishResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delivered_to: Option<u32>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    Message {
        topic: String,
        data: String,
        hash: String,
        timestamp: u64,
        message_id: String,
    },
    #[serde(rename_all = "camelCase")]
    AckReceived {
        message_id: String,
    },
    /// Relay of a sender's `init_file` envelope.
    #[serde(rename_all = "camelCase")]
    InitFile {
        topic: String,
        file_id: String,
        file_name: String,
        file_size: u64,
        total_chunks: u32,
    },
    /// Relay of a sender's `end_file` envelope.
    #[serde(rename_all = "camelCase")]
    EndFile {
        topic: String,
        file_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        hash: Option<String>,
    },
    FcmTokenResponse {
        success: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn error(msg: impl Into<String>) -> Self {
        ServerFrame::Error { error: msg.into() }
    }
}

/// Header of a binary file chunk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub file_id: String,
    pub chunk_index: u32,
}

/// Parses the fixed chunk header out of a binary frame body.
///
/// Returns `None` for bodies below the minimum length, a wrong marker, or a
/// non-ASCII fileId field; callers drop such frames silently. Trailing NUL
/// or space padding of short ids is stripped for the table lookup only.
pub fn parse_chunk_header(body: &[u8]) -> Option<ChunkHeader> {
    if body.len() < MIN_CHUNK_LEN || body[0] != CHUNK_MARKER {
        return None;
    }
    let id_bytes = &body[1..1 + FILE_ID_LEN];
    if !id_bytes.is_ascii() {
        return None;
    }
    let file_id = std::str::from_utf8(id_bytes)
        .ok()?
        .trim_end_matches(['\0', ' '])
        .to_string();
    if file_id.is_empty() {
        return None;
    }
    let mut index_bytes = &body[1 + FILE_ID_LEN..MIN_CHUNK_LEN];
    let chunk_index = index_bytes.get_u32();
    Some(ChunkHeader {
        file_id,
        chunk_index,
    })
}

/// Encodes a server frame into a complete wire frame: `[len][0x01][json]`.
pub fn server_frame_to_wire(frame: &ServerFrame) -> Bytes {
    let json = serde_json::to_vec(frame).expect("server frame serialization cannot fail");
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + 1 + json.len());
    buf.put_u32((1 + json.len()) as u32);
    buf.put_u8(TEXT_MARKER);
    buf.put_slice(&json);
    buf.freeze()
}

/// Encodes a client frame into a complete wire frame (client side / tests).
pub fn client_frame_to_wire(frame: &ClientFrame) -> Bytes {
    let json = serde_json::to_vec(frame).expect("client frame serialization cannot fail");
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + 1 + json.len());
    buf.put_u32((1 + json.len()) as u32);
    buf.put_u8(TEXT_MARKER);
    buf.put_slice(&json);
    buf.freeze()
}

/// Wraps an already-built binary chunk body (starting with `0x02`) into a
/// wire frame. The body is forwarded without modification.
pub fn chunk_to_wire(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(LENGTH_FIELD_LEN + body.len());
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

/// Builds a chunk body from its parts (client side / tests).
pub fn build_chunk_body(file_id: &str, chunk_index: u32, payload: &[u8]) -> Bytes {
    let mut id = [0u8; FILE_ID_LEN];
    let id_bytes = file_id.as_bytes();
    let n = id_bytes.len().min(FILE_ID_LEN);
    id[..n].copy_from_slice(&id_bytes[..n]);

    let mut buf = BytesMut::with_capacity(MIN_CHUNK_LEN + payload.len());
    buf.put_u8(CHUNK_MARKER);
    buf.put_slice(&id);
    buf.put_u32(chunk_index);
    buf.put_slice(payload);
    buf.freeze()
}

pub fn parse_client_frame(json: &[u8]) -> Result<ClientFrame, serde_json::Error> {
    serde_json::from_slice(json)
}

pub fn parse_server_frame(json: &[u8]) -> Result<ServerFrame, serde_json::Error> {
    serde_json::from_slice(json)
}
