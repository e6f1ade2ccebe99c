//! Cross-process transport
//!
//! One [`ProcessTransport`] owns one end of a [`MessagePipe`]. Outbound
//! messages become [`Frame`]s; inbound frames are handled by whichever thread
//! is pumping the transport or blocked waiting on it.
//!
//! A thread blocked in [`send_blocking`](TransportBinding::send_blocking)
//! keeps reading the pipe. Everything that arrives meanwhile is handled on
//! the spot: async messages are dispatched, the peer's blocking requests and
//! blob resolutions are answered, and answers that belong to other waiters
//! are stashed for them.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use codec::{BlobResolver, CodecError, CodecResult, ResolvedBlob, StructuredCloneData};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace, warn};

use super::frame::{BlobWireRef, ClonedMessageData, Frame, RemoteFailure, WireResolvedBlob};
use super::pipe::MessagePipe;
use super::{TransportBinding, TransportKind, TransportMetrics};
use crate::context::ProcessContext;
use crate::error::{MessageManagerError, Result};
use crate::node::MessageManager;
use crate::process_checker::ProcessChecker;

/// Frame transport over one pipe endpoint
pub struct ProcessTransport {
    kind: TransportKind,
    context: Weak<ProcessContext>,
    endpoint: u64,
    pipe: Box<dyn MessagePipe>,
    checker: Option<Arc<dyn ProcessChecker>>,
    node: RwLock<Weak<MessageManager>>,
    self_ref: Weak<ProcessTransport>,

    next_request: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
    answers: Mutex<HashMap<u64, Frame>>,
    reader: Mutex<()>,
    closed: AtomicBool,

    reply_timeout: Option<Duration>,
    pump_interval: Duration,
    metrics: TransportMetrics,
}

/// Removes a request id from the outstanding set however the wait ends
struct Outstanding<'a> {
    transport: &'a ProcessTransport,
    id: u64,
}

impl Drop for Outstanding<'_> {
    fn drop(&mut self) {
        self.transport.outstanding.lock().remove(&self.id);
        self.transport.answers.lock().remove(&self.id);
    }
}

impl ProcessTransport {
    /// Transport without process checks
    pub fn new(context: &Arc<ProcessContext>, pipe: impl MessagePipe + 'static) -> Arc<Self> {
        Self::build(context, Box::new(pipe), None, TransportKind::Process)
    }

    /// Transport whose peer answers process checks through `checker`
    pub fn with_checker(
        context: &Arc<ProcessContext>,
        pipe: impl MessagePipe + 'static,
        checker: Arc<dyn ProcessChecker>,
    ) -> Arc<Self> {
        Self::build(context, Box::new(pipe), Some(checker), TransportKind::Process)
    }

    pub(crate) fn build(
        context: &Arc<ProcessContext>,
        pipe: Box<dyn MessagePipe>,
        checker: Option<Arc<dyn ProcessChecker>>,
        kind: TransportKind,
    ) -> Arc<Self> {
        let transport_config = &context.config().transport;
        let endpoint = context.next_endpoint_id();
        debug!(process = %context.id(), endpoint, kind = ?kind, "Created process transport");
        Arc::new_cyclic(|weak| Self {
            kind,
            context: Arc::downgrade(context),
            endpoint,
            pipe,
            checker,
            node: RwLock::new(Weak::new()),
            self_ref: weak.clone(),
            next_request: AtomicU64::new(0),
            outstanding: Mutex::new(HashSet::new()),
            answers: Mutex::new(HashMap::new()),
            reader: Mutex::new(()),
            closed: AtomicBool::new(false),
            reply_timeout: transport_config.sync_reply_timeout(),
            pump_interval: transport_config.pump_interval(),
            metrics: TransportMetrics::new(),
        })
    }

    /// Registry scope for blobs crossing this transport
    pub fn endpoint(&self) -> u64 {
        self.endpoint
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn context(&self) -> Result<Arc<ProcessContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| MessageManagerError::not_available("process context"))
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(MessageManagerError::transport("transport is closed"));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Raw frame I/O
    // ------------------------------------------------------------------

    pub(crate) fn send_frame(&self, frame: &Frame) -> Result<()> {
        trace!(endpoint = self.endpoint, frame = frame.kind_name(), "Sending frame");
        let bytes = frame.encode()?;
        self.pipe.send(bytes).map_err(|e| self.pipe_failed(e))
    }

    /// A fatal pipe error closes the transport for good
    fn pipe_failed(&self, error: MessageManagerError) -> MessageManagerError {
        if error.is_fatal_for_transport() && !self.closed.swap(true, Ordering::AcqRel) {
            warn!(endpoint = self.endpoint, error = %error, "Pipe failed; transport closed");
        }
        error
    }

    /// Read one frame, waiting at most `timeout` for the reader slot and the pipe
    pub(crate) fn recv_frame(&self, timeout: Duration) -> Result<Option<Frame>> {
        let Some(_reader) = self.reader.try_lock_for(timeout) else {
            return Ok(None);
        };
        match self.pipe.recv_timeout(timeout) {
            Ok(Some(bytes)) => Ok(self.decode(&bytes)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.pipe_failed(e)),
        }
    }

    fn try_recv_frame(&self) -> Result<Option<Frame>> {
        let Some(_reader) = self.reader.try_lock() else {
            return Ok(None);
        };
        match self.pipe.try_recv() {
            Ok(Some(bytes)) => Ok(self.decode(&bytes)),
            Ok(None) => Ok(None),
            Err(e) => Err(self.pipe_failed(e)),
        }
    }

    /// Undecodable frames are counted and skipped
    fn decode(&self, bytes: &Bytes) -> Option<Frame> {
        self.metrics.record_frame_received();
        match Frame::decode(bytes) {
            Ok(frame) => Some(frame),
            Err(e) => {
                self.metrics.record_frame_dropped();
                warn!(endpoint = self.endpoint, error = %e, "Dropping undecodable frame");
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Request/answer matching
    // ------------------------------------------------------------------

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn begin_request(&self) -> Outstanding<'_> {
        let id = self.next_request_id();
        self.outstanding.lock().insert(id);
        Outstanding {
            transport: self,
            id,
        }
    }

    /// Read and handle frames until the answer to `request` shows up
    fn wait_for(&self, request: &Outstanding<'_>, operation: &str) -> Result<Frame> {
        let deadline = self.reply_timeout.map(|timeout| Instant::now() + timeout);
        loop {
            if let Some(answer) = self.answers.lock().remove(&request.id) {
                return Ok(answer);
            }
            if let Some(deadline) = deadline {
                if Instant::now() >= deadline {
                    let timeout_ms = self.reply_timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                    warn!(endpoint = self.endpoint, id = request.id, operation, "Blocking request timed out");
                    return Err(MessageManagerError::timeout(operation, timeout_ms));
                }
            }
            if self.is_closed() {
                return Err(MessageManagerError::transport(format!(
                    "transport closed while waiting for {}",
                    operation
                )));
            }

            if let Some(frame) = self.recv_frame(self.pump_interval)? {
                self.handle_frame(frame);
            }
        }
    }

    fn route_answer(&self, frame: Frame) {
        let Some(id) = frame.answer_id() else {
            return;
        };
        if self.outstanding.lock().contains(&id) {
            self.answers.lock().insert(id, frame);
        } else {
            self.metrics.record_frame_dropped();
            debug!(endpoint = self.endpoint, id, "Dropping answer with no waiter");
        }
    }

    // ------------------------------------------------------------------
    // Inbound handling
    // ------------------------------------------------------------------

    /// Handle frames that are already queued; returns how many were handled
    pub fn pump(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(frame) = self.try_recv_frame()? {
            self.handle_frame(frame);
            handled += 1;
        }
        Ok(handled)
    }

    /// Handle frames until the peer closes the pipe
    pub fn run_until_closed(&self) -> Result<()> {
        while !self.is_closed() {
            let step = self.pump().and_then(|_| self.recv_frame(self.pump_interval));
            match step {
                Ok(Some(frame)) => self.handle_frame(frame),
                Ok(None) => {}
                Err(_) if self.is_closed() => break,
                Err(e) => return Err(e),
            }
        }
        debug!(endpoint = self.endpoint, "Transport loop finished");
        Ok(())
    }

    fn handle_frame(&self, frame: Frame) {
        trace!(endpoint = self.endpoint, frame = frame.kind_name(), "Handling frame");
        match frame {
            Frame::Async { name, data } => self.deliver_async(&name, data),
            Frame::LoadScript { url } => self.run_script(&url),
            Frame::Sync {
                id,
                rpc,
                name,
                data,
            } => {
                let result = self.answer_blocking(rpc, &name, data);
                if let Err(e) = self.send_frame(&Frame::Reply { id, result }) {
                    warn!(endpoint = self.endpoint, id, error = %e, "Failed to send reply");
                }
            }
            Frame::ResolveBlob { id, actor } => {
                let result = self.resolve_local(actor);
                if let Err(e) = self.send_frame(&Frame::BlobResolved { id, result }) {
                    warn!(endpoint = self.endpoint, id, error = %e, "Failed to answer blob resolution");
                }
            }
            answer @ (Frame::Reply { .. } | Frame::BlobResolved { .. }) => self.route_answer(answer),
            Frame::BridgeHello { .. } | Frame::BridgeAck { .. } => {
                self.metrics.record_frame_dropped();
                debug!(endpoint = self.endpoint, "Ignoring handshake frame on established transport");
            }
            Frame::Close => self.peer_closed(),
        }
    }

    fn target_node(&self) -> Option<Arc<MessageManager>> {
        self.node.read().upgrade()
    }

    fn deliver_async(&self, name: &str, data: ClonedMessageData) {
        let Some(node) = self.target_node() else {
            self.metrics.record_frame_dropped();
            trace!(endpoint = self.endpoint, name, "No node attached; dropping async message");
            return;
        };
        let data = match self.from_wire(data) {
            Ok(data) => data,
            Err(e) => {
                self.metrics.record_frame_dropped();
                warn!(endpoint = self.endpoint, name, error = %e, "Dropping message with unresolvable blobs");
                return;
            }
        };
        if let Err(e) = node.receive_message(Some(&node), name, false, &data, None) {
            warn!(node = node.id(), name, error = %e, "Async delivery failed");
        }
    }

    fn answer_blocking(
        &self,
        rpc: bool,
        name: &str,
        data: ClonedMessageData,
    ) -> std::result::Result<Vec<String>, RemoteFailure> {
        let node = self.target_node().ok_or(RemoteFailure::NoTarget)?;
        let data = self
            .from_wire(data)
            .map_err(|e| RemoteFailure::Failed(e.to_string()))?;

        let mut replies = Vec::new();
        let delivered = if rpc {
            node.receive_exempt(Some(&node), name, true, &data, Some(&mut replies))
        } else {
            node.receive_message(Some(&node), name, true, &data, Some(&mut replies))
        };
        match delivered {
            Ok(()) => Ok(replies),
            Err(MessageManagerError::ReentrantSyncSend) => {
                debug!(endpoint = self.endpoint, name, "Refusing sync request while sending sync");
                Err(RemoteFailure::Reentrant)
            }
            Err(e) => Err(RemoteFailure::Failed(e.to_string())),
        }
    }

    fn run_script(&self, url: &str) {
        let Some(node) = self.target_node() else {
            self.metrics.record_frame_dropped();
            return;
        };
        let loader = self.context().ok().and_then(|ctx| ctx.script_loader());
        match loader {
            Some(loader) => {
                if let Err(e) = loader.load(url, &node) {
                    warn!(node = node.id(), url, error = %e, "Script load failed");
                }
            }
            None => warn!(node = node.id(), url, "No script loader; dropping script"),
        }
    }

    fn resolve_local(&self, actor: u64) -> std::result::Result<WireResolvedBlob, String> {
        let context = self.context().map_err(|e| e.to_string())?;
        let resolved = context
            .blob_registry()
            .resolve(self.endpoint, actor)
            .map_err(|e| e.to_string())?;
        Ok(WireResolvedBlob {
            metadata: resolved.metadata,
            bytes: resolved.bytes.to_vec(),
        })
    }

    fn peer_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(endpoint = self.endpoint, "Peer closed transport");
        if let Some(node) = self.target_node() {
            node.close();
        }
    }

    // ------------------------------------------------------------------
    // Blob translation
    // ------------------------------------------------------------------

    fn to_wire(&self, data: &StructuredCloneData) -> Result<ClonedMessageData> {
        let mut blobs = Vec::with_capacity(data.blobs().len());
        if !data.blobs().is_empty() {
            let context = self.context()?;
            for blob in data.blobs() {
                let proxy = context.blob_registry().get_or_create_proxy(blob, self.endpoint)?;
                blobs.push(match proxy.params {
                    Some(params) => BlobWireRef::Local {
                        actor: proxy.actor,
                        params,
                    },
                    None => BlobWireRef::Returned { actor: proxy.actor },
                });
            }
            self.metrics.record_blobs_sent(blobs.len());
        }
        Ok(ClonedMessageData {
            bytes: data.bytes().to_vec(),
            blobs,
        })
    }

    fn from_wire(&self, wire: ClonedMessageData) -> Result<StructuredCloneData> {
        let mut blobs = Vec::with_capacity(wire.blobs.len());
        if !wire.blobs.is_empty() {
            let context = self.context()?;
            let registry = context.blob_registry();
            for blob in wire.blobs {
                blobs.push(match blob {
                    BlobWireRef::Local { actor, params } => {
                        let resolver: Weak<dyn BlobResolver> = self.self_ref.clone();
                        registry.intern_remote(self.endpoint, actor, params, Some(resolver))
                    }
                    BlobWireRef::Returned { actor } => {
                        registry.actor_blob(self.endpoint, actor).ok_or_else(|| {
                            MessageManagerError::not_available(format!(
                                "returned blob actor {} on endpoint {}",
                                actor, self.endpoint
                            ))
                        })?
                    }
                });
            }
        }
        Ok(StructuredCloneData::new(Bytes::from(wire.bytes), blobs))
    }

    /// Tell the peer we are going away; only the first call sends
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.send_frame(&Frame::Close) {
            trace!(endpoint = self.endpoint, error = %e, "Close frame not delivered");
        }
        debug!(endpoint = self.endpoint, "Closed process transport");
    }
}

impl TransportBinding for ProcessTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn connect(&self, node: Weak<MessageManager>) {
        *self.node.write() = node;
    }

    fn send_blocking(
        &self,
        name: &str,
        data: &StructuredCloneData,
        is_sync: bool,
    ) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.metrics.record_blocking_send();
        let operation = if is_sync {
            "send_sync_message"
        } else {
            "send_rpc_message"
        };

        let wire = self.to_wire(data)?;
        let request = self.begin_request();
        self.send_frame(&Frame::Sync {
            id: request.id,
            rpc: !is_sync,
            name: name.to_string(),
            data: wire,
        })?;

        match self.wait_for(&request, operation)? {
            Frame::Reply { result: Ok(replies), .. } => Ok(replies),
            Frame::Reply { result: Err(failure), .. } => {
                Err(MessageManagerError::remote(failure.to_string()))
            }
            other => Err(MessageManagerError::transport(format!(
                "unexpected {} frame answering {}",
                other.kind_name(),
                operation
            ))),
        }
    }

    fn send_async(&self, name: &str, data: &StructuredCloneData) -> Result<()> {
        self.ensure_open()?;
        self.metrics.record_async_send();
        let wire = self.to_wire(data)?;
        self.send_frame(&Frame::Async {
            name: name.to_string(),
            data: wire,
        })
    }

    fn load_script(&self, url: &str) -> Result<()> {
        self.ensure_open()?;
        self.send_frame(&Frame::LoadScript {
            url: url.to_string(),
        })
    }

    fn process_checker(&self) -> Option<Arc<dyn ProcessChecker>> {
        self.checker.clone()
    }

    fn metrics(&self) -> Option<&TransportMetrics> {
        Some(&self.metrics)
    }
}

impl BlobResolver for ProcessTransport {
    fn resolve_blob(&self, actor: u64) -> CodecResult<ResolvedBlob> {
        let failed = |e: MessageManagerError| CodecError::blob_resolution(e.to_string());
        self.ensure_open().map_err(failed)?;

        let request = self.begin_request();
        self.send_frame(&Frame::ResolveBlob {
            id: request.id,
            actor,
        })
        .map_err(failed)?;

        match self.wait_for(&request, "resolve_blob").map_err(failed)? {
            Frame::BlobResolved { result: Ok(blob), .. } => Ok(ResolvedBlob {
                metadata: blob.metadata,
                bytes: Bytes::from(blob.bytes),
            }),
            Frame::BlobResolved { result: Err(message), .. } => {
                Err(CodecError::blob_resolution(message))
            }
            other => Err(CodecError::blob_resolution(format!(
                "unexpected {} frame answering blob resolution",
                other.kind_name()
            ))),
        }
    }
}

impl Drop for ProcessTransport {
    fn drop(&mut self) {
        self.close();
        if let Some(context) = self.context.upgrade() {
            context.blob_registry().release_endpoint(self.endpoint);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessKind;
    use crate::node::NodeRoles;
    use crate::transport::ChannelPipe;
    use manager_config::MessageManagerConfig;

    fn context(kind: ProcessKind) -> Arc<ProcessContext> {
        ProcessContext::new(kind, MessageManagerConfig::default())
    }

    #[test]
    fn test_async_without_node_is_dropped() {
        let (a, b) = ChannelPipe::pair();
        let parent = ProcessTransport::new(&context(ProcessKind::Parent), a);
        let child = ProcessTransport::new(&context(ProcessKind::Content), b);

        parent
            .send_async("hello", &StructuredCloneData::empty())
            .unwrap();
        assert_eq!(child.pump().unwrap(), 1);
        assert_eq!(child.metrics().unwrap().get_stats().frames_dropped, 1);
    }

    #[test]
    fn test_sync_without_peer_node_is_remote_failure() {
        let (a, b) = ChannelPipe::pair();
        let parent_ctx = context(ProcessKind::Parent);
        let parent = ProcessTransport::new(&parent_ctx, a);
        let child_ctx = context(ProcessKind::Content);
        let child = ProcessTransport::new(&child_ctx, b);

        let server = std::thread::spawn(move || child.run_until_closed());
        let err = parent
            .send_blocking("get-x", &StructuredCloneData::empty(), true)
            .unwrap_err();
        assert!(matches!(err, MessageManagerError::RemoteFailure { .. }));

        parent.close();
        server.join().unwrap().unwrap();
    }

    #[test]
    fn test_close_is_sent_once_and_closes_peer_node() {
        let (a, b) = ChannelPipe::pair();
        let child_ctx = context(ProcessKind::Content);
        let parent = ProcessTransport::new(&context(ProcessKind::Parent), a);
        let child = ProcessTransport::new(&child_ctx, b);
        let node = MessageManager::new(
            &child_ctx,
            NodeRoles::CHILD_PROCESS,
            None,
            Some(Arc::clone(&child) as Arc<dyn TransportBinding>),
        )
        .unwrap();

        parent.close();
        parent.close();
        assert!(parent
            .send_async("late", &StructuredCloneData::empty())
            .is_err());

        child.pump().unwrap();
        assert!(child.is_closed());
        assert!(node.binding().is_none());
    }

    #[test]
    fn test_broken_pipe_closes_transport() {
        let (a, b) = ChannelPipe::pair();
        let parent = ProcessTransport::new(&context(ProcessKind::Parent), a);
        drop(b);

        let err = parent
            .send_async("hello", &StructuredCloneData::empty())
            .unwrap_err();
        assert!(err.is_fatal_for_transport());
        assert!(parent.is_closed());
        assert!(parent.run_until_closed().is_ok());
        assert!(parent
            .send_async("again", &StructuredCloneData::empty())
            .is_err());
    }
}
