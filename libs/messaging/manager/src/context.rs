//! Process Context
//!
//! Everything that is process-wide for the message manager lives here: the
//! sync-send flag, the codec, the blob proxy registry, the deferred queue of
//! same-process async messages, the script loader, lifecycle observers, name
//! interning, and the well-known managers.
//!
//! Nodes hold the context strongly. The context holds the global manager
//! weakly; the process hierarchy (parent process root, same-process parent
//! and the process's own child process manager) stays alive until
//! [`ProcessContext::shutdown`].

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use codec::{BincodeCodec, PayloadCodec, StructuredCloneData};
use manager_config::MessageManagerConfig;
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, trace};
use uuid::Uuid;

use crate::atom::{Atom, AtomTable};
use crate::blob_registry::BlobProxyRegistry;
use crate::error::{MessageManagerError, Result};
use crate::node::{MessageManager, NodeRoles};
use crate::script_loader::ScriptLoader;
use crate::transport::{SameProcessShortcut, ShortcutSide, TransportBinding};

/// Which side of the process topology this context is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    /// Privileged parent process
    Parent,
    /// Content child process
    Content,
}

/// Node lifecycle notifications
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    /// Binding released
    Close,
    /// Node torn down
    Disconnect,
}

/// Observer of node lifecycle events
pub type LifecycleObserver = Arc<dyn Fn(&MessageManager, LifecycleEvent) + Send + Sync>;

/// Observer of first disconnects
pub type DisconnectObserver = Arc<dyn Fn(&MessageManager) + Send + Sync>;

/// Async message queued by a same-process shortcut
pub(crate) struct PendingTask {
    pub(crate) side: ShortcutSide,
    pub(crate) receiver: Weak<SameProcessShortcut>,
    pub(crate) name: String,
    pub(crate) data: StructuredCloneData,
}

impl PendingTask {
    fn run(self) {
        match self.receiver.upgrade() {
            Some(receiver) => receiver.deliver_async(&self.name, &self.data),
            None => trace!(name = %self.name, "Dropping queued message for released shortcut"),
        }
    }
}

#[derive(Default)]
struct WellKnownManagers {
    global: Option<Weak<MessageManager>>,
    parent_process: Option<Weak<MessageManager>>,
    same_process_parent: Option<Weak<MessageManager>>,
    child_process: Option<Weak<MessageManager>>,
    /// Kept alive until shutdown
    retained: Vec<Arc<MessageManager>>,
}

fn upgrade(slot: &Option<Weak<MessageManager>>) -> Option<Arc<MessageManager>> {
    slot.as_ref().and_then(Weak::upgrade)
}

/// Released on drop of the outstanding sync send
pub struct SyncSendGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for SyncSendGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Process-scoped state shared by every node of one process
pub struct ProcessContext {
    id: Uuid,
    kind: ProcessKind,
    config: MessageManagerConfig,
    codec: Arc<dyn PayloadCodec>,
    sending_sync: AtomicBool,
    blob_registry: BlobProxyRegistry,
    pending: Mutex<VecDeque<PendingTask>>,
    managers: Mutex<WellKnownManagers>,
    script_loader: RwLock<Option<Arc<dyn ScriptLoader>>>,
    observers: Mutex<Vec<LifecycleObserver>>,
    atoms: AtomTable,
    next_node_id: AtomicU64,
    next_endpoint: AtomicU64,
}

impl ProcessContext {
    /// Context with the default bincode codec
    pub fn new(kind: ProcessKind, config: MessageManagerConfig) -> Arc<Self> {
        Self::with_codec(kind, config, Arc::new(BincodeCodec::new()))
    }

    pub fn with_codec(
        kind: ProcessKind,
        config: MessageManagerConfig,
        codec: Arc<dyn PayloadCodec>,
    ) -> Arc<Self> {
        let context = Arc::new(Self {
            id: Uuid::new_v4(),
            kind,
            config,
            codec,
            sending_sync: AtomicBool::new(false),
            blob_registry: BlobProxyRegistry::new(),
            pending: Mutex::new(VecDeque::new()),
            managers: Mutex::new(WellKnownManagers::default()),
            script_loader: RwLock::new(None),
            observers: Mutex::new(Vec::new()),
            atoms: AtomTable::new(),
            next_node_id: AtomicU64::new(0),
            next_endpoint: AtomicU64::new(0),
        });
        info!(process = %context.id, kind = ?kind, "Created process context");
        context
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ProcessKind {
        self.kind
    }

    pub fn config(&self) -> &MessageManagerConfig {
        &self.config
    }

    pub fn codec(&self) -> &Arc<dyn PayloadCodec> {
        &self.codec
    }

    pub fn blob_registry(&self) -> &BlobProxyRegistry {
        &self.blob_registry
    }

    pub fn atom(&self, name: &str) -> Atom {
        self.atoms.intern(name)
    }

    pub(crate) fn next_node_id(&self) -> u64 {
        self.next_node_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn next_endpoint_id(&self) -> u64 {
        self.next_endpoint.fetch_add(1, Ordering::Relaxed) + 1
    }

    // ------------------------------------------------------------------
    // Sync send flag
    // ------------------------------------------------------------------

    /// Whether a sync send is outstanding in this process
    pub fn is_sending_sync(&self) -> bool {
        self.sending_sync.load(Ordering::Acquire)
    }

    /// Claim the sync flag for the lifetime of the guard
    pub fn begin_sync_send(&self) -> Result<SyncSendGuard<'_>> {
        self.sending_sync
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| MessageManagerError::ReentrantSyncSend)?;
        Ok(SyncSendGuard {
            flag: &self.sending_sync,
        })
    }

    // ------------------------------------------------------------------
    // Same-process deferred queue
    // ------------------------------------------------------------------

    pub(crate) fn enqueue(&self, task: PendingTask) {
        self.pending.lock().push_back(task);
    }

    /// Run queued tasks that originate from `side`, leaving the others queued
    pub(crate) fn flush_pending(&self, side: ShortcutSide) -> usize {
        let mine: Vec<PendingTask> = {
            let mut queue = self.pending.lock();
            let (mine, rest): (VecDeque<_>, VecDeque<_>) =
                queue.drain(..).partition(|task| task.side == side);
            *queue = rest;
            mine.into_iter().collect()
        };
        let count = mine.len();
        for task in mine {
            task.run();
        }
        count
    }

    /// Drain the deferred queue, including tasks queued while draining
    pub fn run_pending_tasks(&self) -> usize {
        let mut count = 0;
        loop {
            let task = self.pending.lock().pop_front();
            match task {
                Some(task) => {
                    task.run();
                    count += 1;
                }
                None => break,
            }
        }
        if count > 0 {
            trace!(process = %self.id, count, "Ran pending same-process tasks");
        }
        count
    }

    pub fn pending_task_count(&self) -> usize {
        self.pending.lock().len()
    }

    // ------------------------------------------------------------------
    // Script loader
    // ------------------------------------------------------------------

    pub fn set_script_loader(&self, loader: Arc<dyn ScriptLoader>) {
        *self.script_loader.write() = Some(loader);
    }

    pub fn script_loader(&self) -> Option<Arc<dyn ScriptLoader>> {
        self.script_loader.read().clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle observers
    // ------------------------------------------------------------------

    /// Observe every lifecycle event (`Close` and `Disconnect`)
    pub fn on_lifecycle(&self, observer: LifecycleObserver) {
        self.observers.lock().push(observer);
    }

    /// Observe each node's first disconnect
    pub fn on_disconnect(&self, observer: DisconnectObserver) {
        let filtered: LifecycleObserver =
            Arc::new(move |node: &MessageManager, event: LifecycleEvent| {
                if event == LifecycleEvent::Disconnect {
                    observer(node);
                }
            });
        self.on_lifecycle(filtered);
    }

    pub(crate) fn notify_lifecycle(&self, node: &MessageManager, event: LifecycleEvent) {
        let observers = self.observers.lock().clone();
        for observer in observers {
            observer(node, event);
        }
    }

    // ------------------------------------------------------------------
    // Well-known managers
    // ------------------------------------------------------------------

    pub fn global_manager(&self) -> Option<Arc<MessageManager>> {
        upgrade(&self.managers.lock().global)
    }

    pub fn parent_process_manager(&self) -> Option<Arc<MessageManager>> {
        upgrade(&self.managers.lock().parent_process)
    }

    pub fn same_process_parent_manager(&self) -> Option<Arc<MessageManager>> {
        upgrade(&self.managers.lock().same_process_parent)
    }

    pub fn child_process_manager(&self) -> Option<Arc<MessageManager>> {
        upgrade(&self.managers.lock().child_process)
    }

    fn require_parent(&self, operation: &str) -> Result<()> {
        match self.kind {
            ProcessKind::Parent => Ok(()),
            ProcessKind::Content => Err(MessageManagerError::not_implemented(
                operation,
                "content process",
            )),
        }
    }

    /// Root of the window hierarchy (parent process only)
    pub fn create_global_manager(self: &Arc<Self>) -> Result<Arc<MessageManager>> {
        self.require_parent("create_global_manager")?;
        if let Some(existing) = self.global_manager() {
            return Ok(existing);
        }
        let global = MessageManager::new(self, NodeRoles::GLOBAL, None, None)?;
        self.managers.lock().global = Some(Arc::downgrade(&global));
        Ok(global)
    }

    /// Per-window broadcaster under the global manager
    pub fn create_window_manager(self: &Arc<Self>) -> Result<Arc<MessageManager>> {
        let global = self.create_global_manager()?;
        MessageManager::new(self, NodeRoles::WINDOW, Some(&global), None)
    }

    /// Root of the process hierarchy (parent process only)
    ///
    /// Also wires the in-process child: a same-process parent manager under
    /// the root, linked through a [`SameProcessShortcut`] to a child process
    /// manager living in this same context.
    pub fn create_parent_process_manager(self: &Arc<Self>) -> Result<Arc<MessageManager>> {
        self.require_parent("create_parent_process_manager")?;
        if let Some(existing) = self.parent_process_manager() {
            return Ok(existing);
        }

        let root = MessageManager::new(self, NodeRoles::PARENT_PROCESS, None, None)?;
        let (parent_side, child_side) = SameProcessShortcut::pair(self);
        let parent_side: Arc<dyn TransportBinding> = parent_side;
        let child_side: Arc<dyn TransportBinding> = child_side;
        let same_process_parent = MessageManager::new(
            self,
            NodeRoles::CHROME_PROCESS,
            Some(&root),
            Some(parent_side),
        )?;
        let child = MessageManager::new(self, NodeRoles::CHILD_PROCESS, None, Some(child_side))?;

        let mut managers = self.managers.lock();
        managers.parent_process = Some(Arc::downgrade(&root));
        managers.same_process_parent = Some(Arc::downgrade(&same_process_parent));
        managers.child_process = Some(Arc::downgrade(&child));
        managers.retained.push(Arc::clone(&root));
        managers.retained.push(child);
        debug!(process = %self.id, "Created parent process manager with in-process child");
        Ok(root)
    }

    /// Parent-side manager for a child process reached through `binding`
    pub fn create_remote_process_manager(
        self: &Arc<Self>,
        binding: Arc<dyn TransportBinding>,
    ) -> Result<Arc<MessageManager>> {
        let root = self.create_parent_process_manager()?;
        MessageManager::new(self, NodeRoles::CHROME_PROCESS, Some(&root), Some(binding))
    }

    /// This process's child process manager
    ///
    /// In the parent process it is the in-process child wired by
    /// [`create_parent_process_manager`](Self::create_parent_process_manager)
    /// and `binding` is ignored. In a content process it is bound to
    /// `binding` (or left unbound until `set_callback`).
    pub fn create_child_process_manager(
        self: &Arc<Self>,
        binding: Option<Arc<dyn TransportBinding>>,
    ) -> Result<Arc<MessageManager>> {
        if let Some(existing) = self.child_process_manager() {
            return Ok(existing);
        }
        match self.kind {
            ProcessKind::Parent => {
                self.create_parent_process_manager()?;
                self.child_process_manager()
                    .ok_or_else(|| MessageManagerError::not_available("in-process child manager"))
            }
            ProcessKind::Content => {
                let child = MessageManager::new(self, NodeRoles::CHILD_PROCESS, None, binding)?;
                let mut managers = self.managers.lock();
                managers.child_process = Some(Arc::downgrade(&child));
                managers.retained.push(Arc::clone(&child));
                Ok(child)
            }
        }
    }

    /// Release process-wide state
    ///
    /// Clears the script cache, the deferred queue and the blob registry,
    /// disconnects the retained managers and forgets the well-known slots.
    pub fn shutdown(&self) {
        if let Some(loader) = self.script_loader() {
            loader.clear_cache();
        }
        let dropped = {
            let mut pending = self.pending.lock();
            let count = pending.len();
            pending.clear();
            count
        };
        self.blob_registry.clear();

        let retained = {
            let mut managers = self.managers.lock();
            let retained = std::mem::take(&mut managers.retained);
            *managers = WellKnownManagers::default();
            retained
        };
        for manager in retained {
            manager.disconnect(true);
        }
        self.observers.lock().clear();

        info!(process = %self.id, dropped_tasks = dropped, "Process context shut down");
    }
}
