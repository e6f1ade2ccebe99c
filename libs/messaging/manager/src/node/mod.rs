//! Message Manager Nodes
//!
//! A [`MessageManager`] is one node of the manager tree. Broadcasters own
//! their children and fan messages out to them; leaves own a transport
//! binding and talk to their counterpart through it. Every message a node
//! receives is delivered to its own listeners and then forwarded to its
//! parent, so listeners at several tree levels observe one physical message.
//!
//! ```text
//!  parent process                                  content process
//!  ──────────────                                  ───────────────
//!  global (broadcaster)
//!   └─ window (broadcaster)
//!       └─ chrome frame ──ProcessTransport──────── content frame
//!  parent process manager (broadcaster)
//!   ├─ chrome process ──ProcessTransport────────── child process manager
//!   └─ same-process parent ─SameProcessShortcut─ in-process child manager
//! ```

mod dispatch;
mod tree;

use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};

use codec::StructuredValue;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::atom::Atom;
use crate::context::ProcessContext;
use crate::error::{MessageManagerError, Result};
use crate::listeners::{ListenerCounts, ListenerTable, MessageListener};
use crate::process_checker::{AppStatus, ProcessChecker};
use crate::transport::TransportBinding;

/// Role flags of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NodeRoles {
    /// Lives in the privileged context
    pub chrome: bool,
    /// Root of the window or process hierarchy
    pub global: bool,
    /// Speaks for a whole process rather than a frame
    pub process_manager: bool,
    /// Owns children and fans messages out to them
    pub broadcaster: bool,
    /// Groups the frames of one window
    pub window_level: bool,
}

impl NodeRoles {
    /// Root of all window message managers
    pub const GLOBAL: Self = Self {
        chrome: true,
        global: true,
        process_manager: false,
        broadcaster: true,
        window_level: false,
    };

    /// Per-window broadcaster
    pub const WINDOW: Self = Self {
        chrome: true,
        global: false,
        process_manager: false,
        broadcaster: true,
        window_level: true,
    };

    /// Root of all process managers in the parent process
    pub const PARENT_PROCESS: Self = Self {
        chrome: true,
        global: true,
        process_manager: true,
        broadcaster: true,
        window_level: false,
    };

    /// Parent-side manager for one child process
    pub const CHROME_PROCESS: Self = Self {
        chrome: true,
        global: false,
        process_manager: true,
        broadcaster: false,
        window_level: false,
    };

    /// Process manager inside a child process
    pub const CHILD_PROCESS: Self = Self {
        chrome: false,
        global: false,
        process_manager: true,
        broadcaster: false,
        window_level: false,
    };

    /// Parent-side manager for one frame
    pub const CHROME_FRAME: Self = Self {
        chrome: true,
        global: false,
        process_manager: false,
        broadcaster: false,
        window_level: false,
    };

    /// Content-side manager for one frame
    pub const CONTENT: Self = Self {
        chrome: false,
        global: false,
        process_manager: false,
        broadcaster: false,
        window_level: false,
    };

    /// Human-readable role, used in errors and logs
    pub fn describe(&self) -> &'static str {
        match (
            self.broadcaster,
            self.global,
            self.window_level,
            self.process_manager,
            self.chrome,
        ) {
            (true, true, _, true, _) => "parent process manager",
            (true, true, _, false, _) => "global message manager",
            (true, _, true, _, _) => "window message manager",
            (true, _, _, _, _) => "broadcaster",
            (false, _, _, true, true) => "chrome process manager",
            (false, _, _, true, false) => "child process manager",
            (false, _, _, false, true) => "chrome frame message manager",
            (false, _, _, false, false) => "content message manager",
        }
    }
}

/// Lifecycle state of a node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Unbound,
    Bound,
    Disconnected,
}

struct NodeInner {
    parent: Option<Weak<MessageManager>>,
    children: Vec<Arc<MessageManager>>,
    listeners: ListenerTable,
    binding: Option<Arc<dyn TransportBinding>>,
    pending_scripts: Vec<String>,
    disconnected: bool,
    closed: bool,
}

/// One node of the message manager tree
pub struct MessageManager {
    id: u64,
    roles: NodeRoles,
    context: Arc<ProcessContext>,
    self_ref: Weak<MessageManager>,
    inner: Mutex<NodeInner>,
    handling_message: AtomicUsize,
}

impl fmt::Debug for MessageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageManager")
            .field("id", &self.id)
            .field("role", &self.roles.describe())
            .field("state", &self.state())
            .finish()
    }
}

impl MessageManager {
    /// Create a node, attach it under `parent` and install `binding`
    ///
    /// A broadcaster parent adopts the node as a child (loading its pending
    /// scripts into it); any other parent only receives bubbled messages.
    pub fn new(
        context: &Arc<ProcessContext>,
        roles: NodeRoles,
        parent: Option<&Arc<MessageManager>>,
        binding: Option<Arc<dyn TransportBinding>>,
    ) -> Result<Arc<MessageManager>> {
        if roles.broadcaster && binding.is_some() {
            return Err(MessageManagerError::not_implemented(
                "set_callback",
                roles.describe(),
            ));
        }

        let node = Arc::new_cyclic(|weak| MessageManager {
            id: context.next_node_id(),
            roles,
            context: Arc::clone(context),
            self_ref: weak.clone(),
            inner: Mutex::new(NodeInner {
                parent: None,
                children: Vec::new(),
                listeners: ListenerTable::new(),
                binding: None,
                pending_scripts: Vec::new(),
                disconnected: false,
                closed: false,
            }),
            handling_message: AtomicUsize::new(0),
        });

        if let Some(binding) = binding {
            node.install_binding(binding);
        }

        if let Some(parent) = parent {
            if parent.roles.broadcaster {
                parent.add_child(&node, true)?;
            } else {
                node.inner.lock().parent = Some(Arc::downgrade(parent));
            }
        }

        debug!(
            node = node.id,
            role = roles.describe(),
            parent = parent.map(|p| p.id),
            "Created message manager"
        );
        Ok(node)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn roles(&self) -> NodeRoles {
        self.roles
    }

    pub fn is_broadcaster(&self) -> bool {
        self.roles.broadcaster
    }

    pub fn is_chrome(&self) -> bool {
        self.roles.chrome
    }

    pub fn context(&self) -> &Arc<ProcessContext> {
        &self.context
    }

    pub fn state(&self) -> NodeState {
        let inner = self.inner.lock();
        if inner.disconnected {
            NodeState::Disconnected
        } else if inner.binding.is_some() {
            NodeState::Bound
        } else {
            NodeState::Unbound
        }
    }

    pub fn parent(&self) -> Option<Arc<MessageManager>> {
        self.inner.lock().parent.as_ref().and_then(Weak::upgrade)
    }

    pub fn child_count(&self) -> usize {
        self.inner.lock().children.len()
    }

    pub fn child_at(&self, index: usize) -> Option<Arc<MessageManager>> {
        self.inner.lock().children.get(index).cloned()
    }

    pub fn children(&self) -> Vec<Arc<MessageManager>> {
        self.inner.lock().children.clone()
    }

    pub fn binding(&self) -> Option<Arc<dyn TransportBinding>> {
        self.inner.lock().binding.clone()
    }

    /// Registrations on this node, grouped by message name
    pub fn listener_counts(&self) -> Vec<(Atom, ListenerCounts)> {
        self.inner.lock().listeners.counts()
    }

    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.len()
    }

    fn install_binding(&self, binding: Arc<dyn TransportBinding>) {
        self.inner.lock().binding = Some(Arc::clone(&binding));
        binding.connect(self.self_ref.clone());
        trace!(node = self.id, kind = ?binding.kind(), "Installed transport binding");
    }

    // ------------------------------------------------------------------
    // Listener registration
    // ------------------------------------------------------------------

    /// Register `listener` for `name`; a repeated identical registration is a no-op
    pub fn add_listener(
        &self,
        name: &str,
        listener: &Arc<dyn MessageListener>,
        weak: bool,
    ) -> Result<()> {
        if weak && !listener.supports_weak_reference() {
            return Err(MessageManagerError::NoWeakCapability {
                message: name.to_string(),
            });
        }
        let atom = self.context.atom(name);
        let added = self.inner.lock().listeners.add(atom, listener, weak);
        trace!(node = self.id, name, weak, added, "Add message listener");
        Ok(())
    }

    pub fn add_message_listener(&self, name: &str, listener: &Arc<dyn MessageListener>) -> Result<()> {
        self.add_listener(name, listener, false)
    }

    pub fn add_weak_message_listener(
        &self,
        name: &str,
        listener: &Arc<dyn MessageListener>,
    ) -> Result<()> {
        self.add_listener(name, listener, true)
    }

    pub fn remove_message_listener(&self, name: &str, listener: &Arc<dyn MessageListener>) {
        let removed = self.inner.lock().listeners.remove(name, listener, false);
        trace!(node = self.id, name, removed, "Remove message listener");
    }

    pub fn remove_weak_message_listener(&self, name: &str, listener: &Arc<dyn MessageListener>) {
        let removed = self.inner.lock().listeners.remove(name, listener, true);
        trace!(node = self.id, name, removed, "Remove weak message listener");
    }

    // ------------------------------------------------------------------
    // Sending
    // ------------------------------------------------------------------

    /// Blocking send; returns one reply per responding listener on the other side
    pub fn send_sync_message(&self, name: &str, value: &StructuredValue) -> Result<Vec<Value>> {
        self.send_blocking_message(name, value, true)
    }

    /// Blocking send that does not claim the process-wide sync flag
    pub fn send_rpc_message(&self, name: &str, value: &StructuredValue) -> Result<Vec<Value>> {
        self.send_blocking_message(name, value, false)
    }

    fn send_blocking_message(
        &self,
        name: &str,
        value: &StructuredValue,
        is_sync: bool,
    ) -> Result<Vec<Value>> {
        let operation = if is_sync {
            "send_sync_message"
        } else {
            "send_rpc_message"
        };
        if self.roles.broadcaster {
            return Err(MessageManagerError::not_implemented(
                operation,
                self.roles.describe(),
            ));
        }
        let binding = self
            .binding()
            .ok_or_else(|| MessageManagerError::not_initialized(operation))?;
        if is_sync && self.context.is_sending_sync() {
            return Err(MessageManagerError::ReentrantSyncSend);
        }

        let data = self.context.codec().serialize(value)?;

        let replies = {
            let _sending = if is_sync {
                Some(self.context.begin_sync_send()?)
            } else {
                None
            };
            trace!(node = self.id, name, is_sync, bytes = data.bytes().len(), "Blocking send");
            binding.send_blocking(name, &data, is_sync)?
        };

        parse_replies(replies)
    }

    /// Fire-and-forget send; broadcasters fan out to their subtree
    pub fn send_async_message(&self, name: &str, value: &StructuredValue) -> Result<()> {
        if self.roles.broadcaster {
            return self.broadcast_async_message(name, value);
        }
        let binding = self
            .binding()
            .ok_or_else(|| MessageManagerError::not_initialized("send_async_message"))?;
        let data = self.context.codec().serialize(value)?;
        trace!(node = self.id, name, bytes = data.bytes().len(), "Async send");
        binding.send_async(name, &data)
    }

    /// Serialize once and send to every leaf of the subtree
    pub fn broadcast_async_message(&self, name: &str, value: &StructuredValue) -> Result<()> {
        if !self.roles.broadcaster {
            return Err(MessageManagerError::not_implemented(
                "broadcast_async_message",
                self.roles.describe(),
            ));
        }
        let data = self.context.codec().serialize(value)?;
        self.broadcast_data(name, &data);
        Ok(())
    }

    fn broadcast_data(&self, name: &str, data: &codec::StructuredCloneData) {
        for child in self.children() {
            if child.roles.broadcaster {
                child.broadcast_data(name, data);
                continue;
            }
            match child.binding() {
                Some(binding) => {
                    if let Err(e) = binding.send_async(name, data) {
                        warn!(node = child.id, name, error = %e, "Broadcast to child failed");
                    }
                }
                None => trace!(node = child.id, name, "Skipping unbound child in broadcast"),
            }
        }
    }

    // ------------------------------------------------------------------
    // Process checks
    // ------------------------------------------------------------------

    fn process_checker_for(&self, operation: &str) -> Result<Arc<dyn ProcessChecker>> {
        if !self.roles.chrome || self.roles.broadcaster {
            return Err(MessageManagerError::not_implemented(
                operation,
                self.roles.describe(),
            ));
        }
        let binding = self
            .binding()
            .ok_or_else(|| MessageManagerError::not_available("transport binding"))?;
        binding
            .process_checker()
            .ok_or_else(|| MessageManagerError::not_available("process checker"))
    }

    fn check_outcome(&self, check: &str, subject: &str, passed: bool) -> bool {
        if !passed {
            warn!(node = self.id, check, subject, "Process check failed");
        }
        passed
    }

    pub fn assert_permission(&self, permission: &str) -> Result<bool> {
        let checker = self.process_checker_for("assert_permission")?;
        Ok(self.check_outcome("permission", permission, checker.check_permission(permission)))
    }

    pub fn assert_contain_app(&self, manifest_url: &str) -> Result<bool> {
        let checker = self.process_checker_for("assert_contain_app")?;
        Ok(self.check_outcome(
            "manifest",
            manifest_url,
            checker.check_manifest_url(manifest_url),
        ))
    }

    pub fn assert_app_has_permission(&self, permission: &str) -> Result<bool> {
        let checker = self.process_checker_for("assert_app_has_permission")?;
        Ok(self.check_outcome(
            "app permission",
            permission,
            checker.check_app_has_permission(permission),
        ))
    }

    pub fn check_app_has_status(&self, status: AppStatus) -> Result<bool> {
        let checker = self.process_checker_for("check_app_has_status")?;
        let subject = format!("{:?}", status);
        Ok(self.check_outcome("app status", &subject, checker.check_app_has_status(status)))
    }
}

fn parse_replies(replies: Vec<String>) -> Result<Vec<Value>> {
    let mut parsed = Vec::new();
    parsed
        .try_reserve_exact(replies.len())
        .map_err(|_| MessageManagerError::OutOfMemory {
            requested: replies.len(),
        })?;
    for (index, reply) in replies.iter().enumerate() {
        let value = serde_json::from_str(reply).map_err(|e| MessageManagerError::MalformedReply {
            index,
            message: e.to_string(),
        })?;
        parsed.push(value);
    }
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::{ProcessContext, ProcessKind};
    use crate::listeners::listener_fn;
    use manager_config::MessageManagerConfig;
    use serde_json::json;

    fn context() -> Arc<ProcessContext> {
        ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default())
    }

    #[test]
    fn test_role_descriptions() {
        assert_eq!(NodeRoles::GLOBAL.describe(), "global message manager");
        assert_eq!(NodeRoles::PARENT_PROCESS.describe(), "parent process manager");
        assert_eq!(NodeRoles::WINDOW.describe(), "window message manager");
        assert_eq!(NodeRoles::CHILD_PROCESS.describe(), "child process manager");
        assert_eq!(NodeRoles::CONTENT.describe(), "content message manager");
    }

    #[test]
    fn test_unbound_leaf_sync_send_not_initialized() {
        let ctx = context();
        let leaf = MessageManager::new(&ctx, NodeRoles::CONTENT, None, None).unwrap();
        let err = leaf
            .send_sync_message("get-x", &StructuredValue::Null)
            .unwrap_err();
        assert!(matches!(err, MessageManagerError::NotInitialized { .. }));
        assert!(!ctx.is_sending_sync());
    }

    #[test]
    fn test_broadcaster_sync_send_not_implemented() {
        let ctx = context();
        let root = MessageManager::new(&ctx, NodeRoles::GLOBAL, None, None).unwrap();
        assert!(matches!(
            root.send_sync_message("x", &StructuredValue::Null),
            Err(MessageManagerError::NotImplemented { .. })
        ));
        assert!(matches!(
            root.send_rpc_message("x", &StructuredValue::Null),
            Err(MessageManagerError::NotImplemented { .. })
        ));
    }

    #[test]
    fn test_weak_registration_requires_capability() {
        struct StrongOnly;
        impl MessageListener for StrongOnly {
            fn receive_message(
                &self,
                _message: &crate::listeners::ReceivedMessage<'_>,
            ) -> anyhow::Result<Option<Value>> {
                Ok(None)
            }
            fn supports_weak_reference(&self) -> bool {
                false
            }
        }

        let ctx = context();
        let node = MessageManager::new(&ctx, NodeRoles::CONTENT, None, None).unwrap();
        let listener: Arc<dyn MessageListener> = Arc::new(StrongOnly);

        assert!(matches!(
            node.add_weak_message_listener("evt", &listener),
            Err(MessageManagerError::NoWeakCapability { .. })
        ));
        node.add_message_listener("evt", &listener).unwrap();
        node.add_message_listener("evt", &listener).unwrap();
        assert_eq!(node.listener_count(), 1);
    }

    #[test]
    fn test_process_checks_require_chrome_leaf() {
        let ctx = context();
        let content = MessageManager::new(&ctx, NodeRoles::CONTENT, None, None).unwrap();
        assert!(matches!(
            content.assert_permission("camera"),
            Err(MessageManagerError::NotImplemented { .. })
        ));

        let chrome = MessageManager::new(&ctx, NodeRoles::CHROME_FRAME, None, None).unwrap();
        assert!(matches!(
            chrome.assert_permission("camera"),
            Err(MessageManagerError::NotAvailable { .. })
        ));
    }

    #[test]
    fn test_parse_replies() {
        let parsed = parse_replies(vec!["1".into(), "{\"a\":true}".into()]).unwrap();
        assert_eq!(parsed, vec![json!(1), json!({"a": true})]);

        assert!(matches!(
            parse_replies(vec!["1".into(), "not json".into()]),
            Err(MessageManagerError::MalformedReply { index: 1, .. })
        ));
    }

    #[test]
    fn test_listener_fn_registration_counts() {
        let ctx = context();
        let node = MessageManager::new(&ctx, NodeRoles::CONTENT, None, None).unwrap();
        let listener = listener_fn(|_| Ok(None));
        node.add_message_listener("a", &listener).unwrap();
        node.add_weak_message_listener("a", &listener).unwrap();
        node.remove_message_listener("a", &listener);
        node.remove_message_listener("missing", &listener);

        let counts = node.listener_counts();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].1.weak_alive, 1);
    }
}
