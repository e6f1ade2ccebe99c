//! Content Bridge
//!
//! Connects two content-level nodes over a dedicated pipe, without routing
//! through the parent process. The two ends agree on each other through a
//! one-time `BridgeHello` / `BridgeAck` exchange; afterwards the bridge
//! behaves exactly like a process transport.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use codec::StructuredCloneData;
use tracing::{debug, info};
use uuid::Uuid;

use crate::context::ProcessContext;
use crate::error::{MessageManagerError, Result};
use crate::node::{MessageManager, NodeRoles};
use crate::process_checker::ProcessChecker;
use crate::transport::{
    Frame, MessagePipe, ProcessTransport, TransportBinding, TransportKind, TransportMetrics,
};

/// Binding installed on each end of a bridge
pub struct BridgeTransport {
    inner: Arc<ProcessTransport>,
}

impl BridgeTransport {
    fn new(context: &Arc<ProcessContext>, pipe: Box<dyn MessagePipe>) -> Arc<Self> {
        Arc::new(Self {
            inner: ProcessTransport::build(context, pipe, None, TransportKind::Bridge),
        })
    }

    pub fn endpoint(&self) -> u64 {
        self.inner.endpoint()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_closed()
    }

    pub fn pump(&self) -> Result<usize> {
        self.inner.pump()
    }

    pub fn run_until_closed(&self) -> Result<()> {
        self.inner.run_until_closed()
    }

    fn close(&self) {
        self.inner.close();
    }
}

impl TransportBinding for BridgeTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Bridge
    }

    fn connect(&self, node: Weak<MessageManager>) {
        self.inner.connect(node);
    }

    fn send_blocking(
        &self,
        name: &str,
        data: &StructuredCloneData,
        is_sync: bool,
    ) -> Result<Vec<String>> {
        self.inner.send_blocking(name, data, is_sync)
    }

    fn send_async(&self, name: &str, data: &StructuredCloneData) -> Result<()> {
        self.inner.send_async(name, data)
    }

    fn load_script(&self, url: &str) -> Result<()> {
        self.inner.load_script(url)
    }

    fn process_checker(&self) -> Option<Arc<dyn ProcessChecker>> {
        None
    }

    fn metrics(&self) -> Option<&TransportMetrics> {
        self.inner.metrics()
    }
}

/// One end of an established content-to-content bridge
pub struct ContentBridge {
    node: Arc<MessageManager>,
    transport: Arc<BridgeTransport>,
    peer_process: Uuid,
    peer_endpoint: u64,
    closed: AtomicBool,
}

impl ContentBridge {
    /// Initiate the handshake on `pipe`
    pub fn open(context: &Arc<ProcessContext>, pipe: impl MessagePipe + 'static) -> Result<Self> {
        let transport = BridgeTransport::new(context, Box::new(pipe));
        transport.inner.send_frame(&Frame::BridgeHello {
            process: context.id(),
            endpoint: transport.endpoint(),
        })?;
        let (peer_process, peer_endpoint) = match await_handshake(context, &transport)? {
            Frame::BridgeAck { process, endpoint } => (process, endpoint),
            other => return Err(unexpected(&other, "bridge-ack")),
        };
        Self::establish(context, transport, peer_process, peer_endpoint)
    }

    /// Answer a handshake initiated by the peer
    pub fn accept(context: &Arc<ProcessContext>, pipe: impl MessagePipe + 'static) -> Result<Self> {
        let transport = BridgeTransport::new(context, Box::new(pipe));
        let (peer_process, peer_endpoint) = match await_handshake(context, &transport)? {
            Frame::BridgeHello { process, endpoint } => (process, endpoint),
            other => return Err(unexpected(&other, "bridge-hello")),
        };
        transport.inner.send_frame(&Frame::BridgeAck {
            process: context.id(),
            endpoint: transport.endpoint(),
        })?;
        Self::establish(context, transport, peer_process, peer_endpoint)
    }

    fn establish(
        context: &Arc<ProcessContext>,
        transport: Arc<BridgeTransport>,
        peer_process: Uuid,
        peer_endpoint: u64,
    ) -> Result<Self> {
        let binding: Arc<dyn TransportBinding> = transport.clone();
        let node = MessageManager::new(context, NodeRoles::CONTENT, None, Some(binding))?;
        info!(
            process = %context.id(),
            peer = %peer_process,
            endpoint = transport.endpoint(),
            peer_endpoint,
            "Content bridge established"
        );
        Ok(Self {
            node,
            transport,
            peer_process,
            peer_endpoint,
            closed: AtomicBool::new(false),
        })
    }

    /// Node that sends to and receives from the other content process
    pub fn node(&self) -> &Arc<MessageManager> {
        &self.node
    }

    pub fn transport(&self) -> &Arc<BridgeTransport> {
        &self.transport
    }

    pub fn peer_process(&self) -> Uuid {
        self.peer_process
    }

    pub fn peer_endpoint(&self) -> u64 {
        self.peer_endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Tear the bridge down; later calls do nothing
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.transport.close();
        self.node.disconnect(true);
        debug!(peer = %self.peer_process, "Content bridge closed");
    }
}

impl Drop for ContentBridge {
    fn drop(&mut self) {
        self.close();
    }
}

fn await_handshake(context: &ProcessContext, transport: &BridgeTransport) -> Result<Frame> {
    let timeout = context.config().transport.handshake_timeout();
    let deadline = Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(MessageManagerError::timeout(
                "bridge handshake",
                timeout.as_millis() as u64,
            ));
        }
        if let Some(frame) = transport.inner.recv_frame(remaining)? {
            return Ok(frame);
        }
    }
}

fn unexpected(frame: &Frame, expected: &str) -> MessageManagerError {
    MessageManagerError::handshake(format!(
        "expected {}, received {}",
        expected,
        frame.kind_name()
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessKind;
    use crate::transport::ChannelPipe;
    use manager_config::MessageManagerConfig;

    #[test]
    fn test_handshake_rejects_wrong_frame() {
        let ctx = ProcessContext::new(ProcessKind::Content, MessageManagerConfig::default());
        let (a, b) = ChannelPipe::pair();
        b.send(Frame::Close.encode().unwrap()).unwrap();
        let err = ContentBridge::accept(&ctx, a).err().unwrap();
        assert!(matches!(err, MessageManagerError::Handshake { .. }));
    }

    #[test]
    fn test_handshake_times_out() {
        let mut config = MessageManagerConfig::default();
        config.transport.handshake_timeout_ms = 20;
        let ctx = ProcessContext::new(ProcessKind::Content, config);
        let (a, _b) = ChannelPipe::pair();
        let err = ContentBridge::accept(&ctx, a).err().unwrap();
        assert!(matches!(err, MessageManagerError::Timeout { .. }));
    }
}
