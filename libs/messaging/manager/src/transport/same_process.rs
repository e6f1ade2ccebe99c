//! Same-process shortcut
//!
//! Links a parent-side node and a child-side node that live in the same
//! process. Blocking sends call straight into the peer node; async sends go
//! through the context's deferred queue so they are delivered on a later
//! turn, after the sender's current work, and always in send order.

use std::sync::{Arc, Weak};

use codec::StructuredCloneData;
use parking_lot::RwLock;
use tracing::{trace, warn};

use super::{TransportBinding, TransportKind, TransportMetrics};
use crate::context::{PendingTask, ProcessContext};
use crate::error::{MessageManagerError, Result};
use crate::node::MessageManager;
use crate::process_checker::{AllowAllChecker, ProcessChecker};

/// Which end of the shortcut a binding sits on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShortcutSide {
    Parent,
    Child,
}

/// One end of an in-process parent/child link
pub struct SameProcessShortcut {
    side: ShortcutSide,
    context: Weak<ProcessContext>,
    node: RwLock<Weak<MessageManager>>,
    peer: RwLock<Weak<SameProcessShortcut>>,
    metrics: TransportMetrics,
}

impl SameProcessShortcut {
    /// Connected (parent, child) ends
    pub fn pair(context: &Arc<ProcessContext>) -> (Arc<SameProcessShortcut>, Arc<SameProcessShortcut>) {
        let parent = Arc::new(Self::new(context, ShortcutSide::Parent));
        let child = Arc::new(Self::new(context, ShortcutSide::Child));
        *parent.peer.write() = Arc::downgrade(&child);
        *child.peer.write() = Arc::downgrade(&parent);
        (parent, child)
    }

    fn new(context: &Arc<ProcessContext>, side: ShortcutSide) -> Self {
        Self {
            side,
            context: Arc::downgrade(context),
            node: RwLock::new(Weak::new()),
            peer: RwLock::new(Weak::new()),
            metrics: TransportMetrics::new(),
        }
    }

    pub fn side(&self) -> ShortcutSide {
        self.side
    }

    fn context(&self) -> Result<Arc<ProcessContext>> {
        self.context
            .upgrade()
            .ok_or_else(|| MessageManagerError::not_available("process context"))
    }

    fn peer_node(&self) -> Option<Arc<MessageManager>> {
        self.peer
            .read()
            .upgrade()
            .and_then(|peer| peer.node.read().upgrade())
    }

    /// Deliver a queued async message to the node on this end
    pub(crate) fn deliver_async(&self, name: &str, data: &StructuredCloneData) {
        let Some(node) = self.node.read().upgrade() else {
            self.metrics.record_frame_dropped();
            trace!(side = ?self.side, name, "No node attached; dropping async message");
            return;
        };
        self.metrics.record_frame_received();
        if let Err(e) = node.receive_message(Some(&node), name, false, data, None) {
            warn!(node = node.id(), name, error = %e, "Async delivery failed");
        }
    }
}

impl TransportBinding for SameProcessShortcut {
    fn kind(&self) -> TransportKind {
        TransportKind::SameProcess
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
        self.metrics.record_blocking_send();
        let context = self.context()?;
        // Earlier async sends from this end arrive first
        context.flush_pending(self.side);

        let mut replies = Vec::new();
        match self.peer_node() {
            Some(peer) => {
                trace!(side = ?self.side, name, is_sync, "Shortcut blocking delivery");
                peer.receive_exempt(Some(&peer), name, true, data, Some(&mut replies))?;
            }
            None => trace!(side = ?self.side, name, "No peer node; empty reply"),
        }
        Ok(replies)
    }

    fn send_async(&self, name: &str, data: &StructuredCloneData) -> Result<()> {
        self.metrics.record_async_send();
        let context = self.context()?;
        context.enqueue(PendingTask {
            side: self.side,
            receiver: self.peer.read().clone(),
            name: name.to_string(),
            data: data.clone(),
        });
        Ok(())
    }

    fn load_script(&self, url: &str) -> Result<()> {
        if self.side == ShortcutSide::Child {
            trace!(url, "Child end does not load scripts into its parent");
            return Ok(());
        }
        let context = self.context()?;
        let loader = context
            .script_loader()
            .ok_or_else(|| MessageManagerError::not_available("script loader"))?;
        match self.peer_node() {
            Some(peer) => loader.load(url, &peer),
            None => Ok(()),
        }
    }

    fn process_checker(&self) -> Option<Arc<dyn ProcessChecker>> {
        Some(Arc::new(AllowAllChecker))
    }

    fn metrics(&self) -> Option<&TransportMetrics> {
        Some(&self.metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProcessKind;
    use crate::listeners::listener_fn;
    use codec::StructuredValue;
    use manager_config::MessageManagerConfig;
    use parking_lot::Mutex;
    use serde_json::json;

    #[test]
    fn test_async_is_deferred_until_pending_tasks_run() {
        let ctx = ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default());
        ctx.create_parent_process_manager().unwrap();
        let parent_side = ctx.same_process_parent_manager().unwrap();
        let child = ctx.child_process_manager().unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let listener = listener_fn(move |msg| {
            sink.lock().push(msg.data.to_json());
            Ok(None)
        });
        child.add_message_listener("tick", &listener).unwrap();

        parent_side.send_async_message("tick", &StructuredValue::from(1i64)).unwrap();
        parent_side.send_async_message("tick", &StructuredValue::from(2i64)).unwrap();
        assert!(seen.lock().is_empty());
        assert_eq!(ctx.pending_task_count(), 2);

        assert_eq!(ctx.run_pending_tasks(), 2);
        assert_eq!(*seen.lock(), vec![Some(json!(1)), Some(json!(2))]);
    }

    #[test]
    fn test_sync_flushes_own_side_first() {
        let ctx = ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default());
        ctx.create_parent_process_manager().unwrap();
        let parent_side = ctx.same_process_parent_manager().unwrap();
        let child = ctx.child_process_manager().unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let listener = listener_fn(move |msg| {
            sink.lock().push(msg.name.to_string());
            Ok(if msg.sync { Some(json!("ok")) } else { None })
        });
        child.add_message_listener("a", &listener).unwrap();
        child.add_message_listener("s", &listener).unwrap();

        // Child-originated task stays queued
        child.send_async_message("back", &StructuredValue::Null).unwrap();
        parent_side.send_async_message("a", &StructuredValue::Null).unwrap();

        let replies = parent_side.send_sync_message("s", &StructuredValue::Null).unwrap();
        assert_eq!(replies, vec![json!("ok")]);
        assert_eq!(*order.lock(), vec!["a".to_string(), "s".to_string()]);
        assert_eq!(ctx.pending_task_count(), 1);
    }
}
