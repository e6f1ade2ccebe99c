//! Wire frames
//!
//! Everything a [`ProcessTransport`](super::ProcessTransport) writes to its
//! pipe is one bincode-encoded [`Frame`]. Request/response pairs (`Sync` and
//! `Reply`, `ResolveBlob` and `BlobResolved`) share one id space per
//! transport so a waiter can stash answers that belong to an outer wait.

use bytes::Bytes;
use codec::{BlobMetadata, BlobParams};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MessageManagerError, Result};

/// How a blob appears on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobWireRef {
    /// Sender-owned object exposed as `actor` on this endpoint
    Local { actor: u64, params: BlobParams },
    /// Proxy the receiver itself handed out earlier as `actor`
    Returned { actor: u64 },
}

/// Serialized payload plus its blob references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClonedMessageData {
    pub bytes: Vec<u8>,
    pub blobs: Vec<BlobWireRef>,
}

/// Why the peer could not answer a blocking request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteFailure {
    /// The peer is itself blocked in a sync send
    Reentrant,
    /// No node is attached on the peer side
    NoTarget,
    Failed(String),
}

impl std::fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RemoteFailure::Reentrant => f.write_str("peer is blocked in its own sync send"),
            RemoteFailure::NoTarget => f.write_str("no message manager attached on peer"),
            RemoteFailure::Failed(message) => f.write_str(message),
        }
    }
}

/// Blob content shipped in answer to `ResolveBlob`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireResolvedBlob {
    pub metadata: BlobMetadata,
    pub bytes: Vec<u8>,
}

/// One unit on the pipe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Frame {
    Async {
        name: String,
        data: ClonedMessageData,
    },
    Sync {
        id: u64,
        /// RPC requests are answered even while the peer blocks in a sync send
        rpc: bool,
        name: String,
        data: ClonedMessageData,
    },
    Reply {
        id: u64,
        result: std::result::Result<Vec<String>, RemoteFailure>,
    },
    LoadScript {
        url: String,
    },
    ResolveBlob {
        id: u64,
        actor: u64,
    },
    BlobResolved {
        id: u64,
        result: std::result::Result<WireResolvedBlob, String>,
    },
    BridgeHello {
        process: Uuid,
        endpoint: u64,
    },
    BridgeAck {
        process: Uuid,
        endpoint: u64,
    },
    Close,
}

impl Frame {
    /// Id of the request this frame answers, if it is an answer
    pub fn answer_id(&self) -> Option<u64> {
        match self {
            Frame::Reply { id, .. } | Frame::BlobResolved { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Frame::Async { .. } => "async",
            Frame::Sync { .. } => "sync",
            Frame::Reply { .. } => "reply",
            Frame::LoadScript { .. } => "load-script",
            Frame::ResolveBlob { .. } => "resolve-blob",
            Frame::BlobResolved { .. } => "blob-resolved",
            Frame::BridgeHello { .. } => "bridge-hello",
            Frame::BridgeAck { .. } => "bridge-ack",
            Frame::Close => "close",
        }
    }

    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(bincode::serialize(self)?))
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame> {
        bincode::deserialize(bytes).map_err(|e| {
            MessageManagerError::transport_with_source(
                format!("undecodable frame ({} bytes)", bytes.len()),
                e,
            )
        })
    }
}
