//! Message dispatch
//!
//! Delivery runs over a snapshot of the matching registrations, so listeners
//! may add or remove registrations (their own included) while a message is
//! being delivered. Afterwards the message always bubbles to the parent,
//! whether or not anything matched locally.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use codec::{StructuredCloneData, StructuredValue};
use tracing::{trace, warn};

use super::MessageManager;
use crate::error::{MessageManagerError, Result};
use crate::listeners::ReceivedMessage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reentrancy {
    /// Sync deliveries fail while this process has a sync send outstanding
    Enforce,
    /// Delivery is part of the outstanding send itself (or an RPC)
    Exempt,
}

/// Keeps `handling_message` raised for the duration of a delivery
struct HandlingGuard<'a>(&'a MessageManager);

impl<'a> HandlingGuard<'a> {
    fn enter(node: &'a MessageManager) -> Self {
        node.handling_message.fetch_add(1, Ordering::AcqRel);
        HandlingGuard(node)
    }
}

impl Drop for HandlingGuard<'_> {
    fn drop(&mut self) {
        if self.0.handling_message.fetch_sub(1, Ordering::AcqRel) == 1 {
            let mut inner = self.0.inner.lock();
            if inner.disconnected {
                inner.listeners.clear();
            }
        }
    }
}

impl MessageManager {
    /// Deliver an inbound message to this node's listeners, then to its ancestors
    ///
    /// For sync deliveries `replies` collects one JSON text slot per listener
    /// that returned a value, in registration order, across all levels.
    pub fn receive_message(
        &self,
        target: Option<&Arc<MessageManager>>,
        name: &str,
        is_sync: bool,
        data: &StructuredCloneData,
        replies: Option<&mut Vec<String>>,
    ) -> Result<()> {
        self.dispatch(target, name, is_sync, data, replies, Reentrancy::Enforce)
    }

    /// Delivery performed on behalf of a send that already owns the sync flag
    pub(crate) fn receive_exempt(
        &self,
        target: Option<&Arc<MessageManager>>,
        name: &str,
        is_sync: bool,
        data: &StructuredCloneData,
        replies: Option<&mut Vec<String>>,
    ) -> Result<()> {
        self.dispatch(target, name, is_sync, data, replies, Reentrancy::Exempt)
    }

    fn dispatch(
        &self,
        target: Option<&Arc<MessageManager>>,
        name: &str,
        is_sync: bool,
        data: &StructuredCloneData,
        mut replies: Option<&mut Vec<String>>,
        reentrancy: Reentrancy,
    ) -> Result<()> {
        if is_sync && reentrancy == Reentrancy::Enforce && self.context.is_sending_sync() {
            return Err(MessageManagerError::ReentrantSyncSend);
        }
        let Some(this) = self.self_ref.upgrade() else {
            return Ok(());
        };

        let _handling = HandlingGuard::enter(self);
        let snapshot = self.inner.lock().listeners.snapshot(name);
        trace!(
            node = self.id,
            name,
            is_sync,
            listeners = snapshot.len(),
            "Dispatching message"
        );

        if !snapshot.is_empty() {
            match self.context.codec().deserialize(data) {
                Ok(value) => {
                    self.deliver(&this, target, name, is_sync, &value, &snapshot, replies.as_deref_mut())
                }
                Err(e) => warn!(node = self.id, name, error = %e, "Dropping undecodable payload"),
            }
        }

        if let Some(parent) = self.parent() {
            parent.dispatch(target, name, is_sync, data, replies, Reentrancy::Exempt)?;
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &self,
        this: &Arc<MessageManager>,
        target: Option<&Arc<MessageManager>>,
        name: &str,
        is_sync: bool,
        value: &StructuredValue,
        snapshot: &[crate::listeners::ListenerEntry],
        mut replies: Option<&mut Vec<String>>,
    ) {
        let message = ReceivedMessage {
            name,
            sync: is_sync,
            data: value,
            target,
            manager: this,
        };

        for entry in snapshot {
            let Some(listener) = entry.listener.resolve() else {
                self.inner.lock().listeners.remove_id(entry.id);
                trace!(node = self.id, name, entry = entry.id, "Pruned expired weak listener");
                continue;
            };

            match listener.receive_message(&message) {
                Ok(Some(reply)) if is_sync => {
                    if let Some(replies) = replies.as_deref_mut() {
                        replies.push(reply.to_string());
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(node = self.id, name, error = %format!("{:#}", e), "Message listener failed")
                }
            }
        }
    }
}
