//! Channel protocol message types
//!
//! Every frame on the physical connection names the channel it belongs to.
//! Frames are CBOR-encoded, one frame per websocket binary message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};
use crate::query::{Query, QueryOption};
use crate::record::VersionedChange;

/// Largest frame accepted from the wire (16MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Payload of one frame, tagged by `cmd`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Payload {
    /// Client asks for the result set (initial load or resync)
    Query {
        query: Query,
        #[serde(default)]
        options: Vec<QueryOption>,
    },

    /// Server answers a query with the full result set
    Snapshot {
        rows: Vec<VersionedChange>,
        server_time: DateTime<Utc>,
    },

    /// Client sends a batch of writes
    Set { changes: Vec<VersionedChange> },

    /// Server confirms writes; `changes` holds the authoritative rows
    Ack {
        ids: Vec<String>,
        #[serde(default)]
        changes: Vec<VersionedChange>,
    },

    /// Server refused one write
    Error { id: String, message: String },

    /// Server pushes changefeed deltas
    Update { changes: Vec<VersionedChange> },

    /// Either side ends the channel
    Close,
}

impl Payload {
    /// Short name for logging
    pub fn cmd(&self) -> &'static str {
        match self {
            Payload::Query { .. } => "query",
            Payload::Snapshot { .. } => "snapshot",
            Payload::Set { .. } => "set",
            Payload::Ack { .. } => "ack",
            Payload::Error { .. } => "error",
            Payload::Update { .. } => "update",
            Payload::Close => "close",
        }
    }
}

/// One message on the physical connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub channel: String,
    pub payload: Payload,
}

impl Frame {
    pub fn new(channel: impl Into<String>, payload: Payload) -> Self {
        Self {
            channel: channel.into(),
            payload,
        }
    }

    /// Encode frame to CBOR bytes
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::into_writer(self, &mut bytes)
            .map_err(|e| SyncError::Protocol(format!("CBOR encoding failed: {}", e)))?;
        Ok(bytes)
    }

    /// Decode frame from CBOR bytes
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(SyncError::Protocol(format!(
                "frame too large: {} bytes (max: {})",
                bytes.len(),
                MAX_FRAME_SIZE
            )));
        }
        ciborium::from_reader(bytes)
            .map_err(|e| SyncError::Protocol(format!("CBOR decoding failed: {}", e)))
    }
}
