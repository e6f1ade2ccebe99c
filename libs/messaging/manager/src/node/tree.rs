//! Tree maintenance: children, bindings, scripts and teardown

use std::sync::atomic::Ordering;
use std::sync::{Arc, Weak};

use tracing::{debug, trace, warn};

use super::MessageManager;
use crate::context::LifecycleEvent;
use crate::error::{MessageManagerError, Result};
use crate::transport::TransportBinding;

impl MessageManager {
    /// Install the transport binding; with `load_scripts` the node receives
    /// its ancestors' pending scripts and replays its own
    pub fn set_callback(
        &self,
        binding: Arc<dyn TransportBinding>,
        load_scripts: bool,
    ) -> Result<()> {
        if self.roles.broadcaster {
            return Err(MessageManagerError::not_implemented(
                "set_callback",
                self.roles.describe(),
            ));
        }
        if self.inner.lock().disconnected {
            return Err(MessageManagerError::not_available(
                "binding for a disconnected message manager",
            ));
        }

        self.install_binding(binding);

        if load_scripts {
            if let (Some(parent), Some(this)) = (self.parent(), self.self_ref.upgrade()) {
                parent.load_pending_scripts_into(&this);
            }
            let own = self.inner.lock().pending_scripts.clone();
            for url in own {
                self.load_script(&url, false)?;
            }
        }
        Ok(())
    }

    /// Adopt `child`; it leaves any previous parent
    pub fn add_child(&self, child: &Arc<MessageManager>, load_scripts: bool) -> Result<()> {
        if !self.roles.broadcaster {
            return Err(MessageManagerError::not_implemented(
                "add_child",
                self.roles.describe(),
            ));
        }
        if std::ptr::eq(Arc::as_ptr(child), self) {
            return Ok(());
        }
        if self.has_ancestor(child) {
            return Err(MessageManagerError::TreeCycle {
                parent: self.id,
                child: child.id,
            });
        }

        let previous = child.inner.lock().parent.replace(self.self_ref.clone());
        if let Some(previous) = previous.as_ref().and_then(Weak::upgrade) {
            if !std::ptr::eq(Arc::as_ptr(&previous), self) {
                previous.detach_child(Arc::as_ptr(child));
            }
        }

        {
            let mut inner = self.inner.lock();
            if !inner.children.iter().any(|c| Arc::ptr_eq(c, child)) {
                inner.children.push(Arc::clone(child));
            }
        }
        trace!(parent = self.id, child = child.id, "Added child manager");

        if load_scripts {
            self.load_pending_scripts_into(child);
        }
        Ok(())
    }

    /// Remove `child` from the children list; returns whether it was present
    pub fn remove_child(&self, child: &Arc<MessageManager>) -> bool {
        let removed = self.detach_child(Arc::as_ptr(child));
        if removed {
            let mut child_inner = child.inner.lock();
            let points_here = child_inner
                .parent
                .as_ref()
                .map(|p| std::ptr::eq(p.as_ptr(), self))
                .unwrap_or(false);
            if points_here {
                child_inner.parent = None;
            }
        }
        removed
    }

    /// Leave the parent's children list
    pub fn remove_from_parent(&self) {
        let parent = self.inner.lock().parent.take();
        if let Some(parent) = parent.as_ref().and_then(Weak::upgrade) {
            parent.detach_child(self);
        }
    }

    fn has_ancestor(&self, node: &MessageManager) -> bool {
        let mut current = self.parent();
        while let Some(ancestor) = current {
            if std::ptr::eq(Arc::as_ptr(&ancestor), node) {
                return true;
            }
            current = ancestor.parent();
        }
        false
    }

    fn detach_child(&self, child: *const MessageManager) -> bool {
        let mut inner = self.inner.lock();
        let before = inner.children.len();
        inner
            .children
            .retain(|c| !std::ptr::eq(Arc::as_ptr(c), child));
        before != inner.children.len()
    }

    /// Release the transport binding; observers hear `Close` once
    pub fn close(&self) {
        let (binding, first) = {
            let mut inner = self.inner.lock();
            let first = !inner.closed;
            inner.closed = true;
            (inner.binding.take(), first)
        };
        drop(binding);
        if first {
            self.context.notify_lifecycle(self, LifecycleEvent::Close);
        }
    }

    /// Tear the node down
    ///
    /// Idempotent. The first call detaches from the parent (when
    /// `remove_from_parent`), releases the binding and notifies observers.
    /// Listeners are cleared unless a dispatch is running on this node, in
    /// which case the dispatch clears them when it unwinds. Broadcasters
    /// disconnect their children without re-detaching them.
    pub fn disconnect(&self, remove_from_parent: bool) {
        let parent = self.inner.lock().parent.take();
        if remove_from_parent {
            if let Some(parent) = parent.as_ref().and_then(Weak::upgrade) {
                parent.detach_child(self);
            }
        }

        self.close();

        let (first, children) = {
            let mut inner = self.inner.lock();
            let first = !inner.disconnected;
            inner.disconnected = true;
            if self.handling_message.load(Ordering::Acquire) == 0 {
                inner.listeners.clear();
            }
            let children = if first && self.roles.broadcaster {
                std::mem::take(&mut inner.children)
            } else {
                Vec::new()
            };
            (first, children)
        };

        if first {
            debug!(node = self.id, role = self.roles.describe(), "Disconnected message manager");
            self.context.notify_lifecycle(self, LifecycleEvent::Disconnect);
        }

        for child in children {
            child.disconnect(false);
        }
    }

    // ------------------------------------------------------------------
    // Scripts
    // ------------------------------------------------------------------

    /// Load a script into this node's counterpart and the whole subtree
    ///
    /// With `allow_delayed`, broadcasters and unbound nodes remember the URL
    /// for nodes that bind or attach later.
    pub fn load_script(&self, url: &str, allow_delayed: bool) -> Result<()> {
        let (binding, children) = {
            let mut inner = self.inner.lock();
            if allow_delayed && (self.roles.broadcaster || inner.binding.is_none()) {
                inner.pending_scripts.push(url.to_string());
            }
            (inner.binding.clone(), inner.children.clone())
        };

        match binding {
            Some(binding) => binding.load_script(url)?,
            None if !self.roles.broadcaster => {
                trace!(node = self.id, url, "Deferred script on unbound node");
                return Ok(());
            }
            None => {}
        }

        for child in children {
            if let Err(e) = child.load_script(url, false) {
                warn!(node = child.id, url, error = %e, "Loading script into child failed");
            }
        }
        Ok(())
    }

    /// Forget a delayed script; nodes that already ran it are unaffected
    pub fn remove_delayed_script(&self, url: &str) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.pending_scripts.iter().position(|u| u == url) {
            inner.pending_scripts.remove(index);
        }
    }

    /// Scripts waiting for future children
    pub fn delayed_scripts(&self) -> Result<Vec<String>> {
        if !(self.roles.global || self.roles.window_level) {
            return Err(MessageManagerError::not_implemented(
                "delayed_scripts",
                self.roles.describe(),
            ));
        }
        Ok(self.inner.lock().pending_scripts.clone())
    }

    /// Ancestors' pending scripts first, then this node's
    fn load_pending_scripts_into(&self, child: &Arc<MessageManager>) {
        if let Some(parent) = self.parent() {
            parent.load_pending_scripts_into(child);
        }
        let pending = self.inner.lock().pending_scripts.clone();
        for url in pending {
            if let Err(e) = child.load_script(&url, false) {
                warn!(node = child.id, url, error = %e, "Loading pending script failed");
            }
        }
    }
}
