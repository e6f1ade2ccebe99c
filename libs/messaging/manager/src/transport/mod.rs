//! Transport Bindings
//!
//! A binding moves one serialized message across one hop. Which binding a
//! node gets depends on where its counterpart lives:
//! - Same process: [`SameProcessShortcut`], direct calls plus a deferred queue
//! - Different process: [`ProcessTransport`], bincode frames over a [`MessagePipe`]
//! - Content to content: [`BridgeTransport`](crate::bridge::BridgeTransport),
//!   a process transport established by handshake
//!
//! Bindings never interpret payload bytes. They translate the blob list for
//! their endpoint and hand the payload to the node on the other side.

pub mod frame;
pub mod pipe;
pub mod process;
pub mod same_process;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use codec::StructuredCloneData;

use crate::error::Result;
use crate::node::MessageManager;
use crate::process_checker::ProcessChecker;

pub use frame::{BlobWireRef, ClonedMessageData, Frame, RemoteFailure};
pub use pipe::{ChannelPipe, MessagePipe};
pub use process::ProcessTransport;
pub use same_process::{SameProcessShortcut, ShortcutSide};

/// Transport type
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// Frames over a pipe to another process
    Process,
    /// Direct calls inside one process
    SameProcess,
    /// Dedicated content-to-content pipe
    Bridge,
}

/// Moves serialized messages for one node across one hop
pub trait TransportBinding: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Attach the node that receives inbound traffic
    fn connect(&self, node: Weak<MessageManager>);

    /// Blocking send; `is_sync == false` is an RPC that does not claim the
    /// process-wide sync flag. Returns reply slots as JSON text.
    fn send_blocking(&self, name: &str, data: &StructuredCloneData, is_sync: bool)
        -> Result<Vec<String>>;

    fn send_async(&self, name: &str, data: &StructuredCloneData) -> Result<()>;

    fn load_script(&self, url: &str) -> Result<()>;

    fn process_checker(&self) -> Option<Arc<dyn ProcessChecker>>;

    fn metrics(&self) -> Option<&TransportMetrics> {
        None
    }
}

/// Transport counters
#[derive(Debug, Default)]
pub struct TransportMetrics {
    /// Blocking sends issued
    pub blocking_sends: AtomicU64,
    /// Async sends issued
    pub async_sends: AtomicU64,
    /// Frames decoded from the peer
    pub frames_received: AtomicU64,
    /// Frames dropped (no target node, stale reply, undecodable)
    pub frames_dropped: AtomicU64,
    /// Blob proxies shipped to the peer
    pub blobs_sent: AtomicU64,
}

impl TransportMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_blocking_send(&self) {
        self.blocking_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_async_send(&self) {
        self.async_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_received(&self) {
        self.frames_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_frame_dropped(&self) {
        self.frames_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_blobs_sent(&self, count: usize) {
        self.blobs_sent.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Get statistics snapshot
    pub fn get_stats(&self) -> TransportStats {
        TransportStats {
            blocking_sends: self.blocking_sends.load(Ordering::Relaxed),
            async_sends: self.async_sends.load(Ordering::Relaxed),
            frames_received: self.frames_received.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            blobs_sent: self.blobs_sent.load(Ordering::Relaxed),
        }
    }
}

/// Transport statistics snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TransportStats {
    pub blocking_sends: u64,
    pub async_sends: u64,
    pub frames_received: u64,
    pub frames_dropped: u64,
    pub blobs_sent: u64,
}
