//! Listener Table
//!
//! Per-node registry of (message name, listener) bindings. Entries hold the
//! listener strongly or weakly; weak entries are resolved when a message is
//! dispatched and pruned once their listener is gone.

use std::sync::{Arc, Weak};

use codec::StructuredValue;
use serde_json::Value;

use crate::atom::Atom;
use crate::node::MessageManager;

/// What a listener sees for one delivery
pub struct ReceivedMessage<'a> {
    /// Message name
    pub name: &'a str,
    /// Whether the sender is blocked waiting for replies
    pub sync: bool,
    /// Deserialized payload
    pub data: &'a StructuredValue,
    /// Node the message physically arrived at
    pub target: Option<&'a Arc<MessageManager>>,
    /// Node whose listener is running
    pub manager: &'a Arc<MessageManager>,
}

/// Receives named messages
///
/// Returning `Ok(Some(value))` from a sync delivery contributes one reply
/// slot; `Ok(None)` contributes nothing. Errors are logged by the dispatcher
/// and never reach the sender.
pub trait MessageListener: Send + Sync {
    fn receive_message(&self, message: &ReceivedMessage<'_>) -> anyhow::Result<Option<Value>>;

    /// Whether the listener may be registered weakly
    fn supports_weak_reference(&self) -> bool {
        true
    }
}

struct FnListener<F>(F);

impl<F> MessageListener for FnListener<F>
where
    F: Fn(&ReceivedMessage<'_>) -> anyhow::Result<Option<Value>> + Send + Sync,
{
    fn receive_message(&self, message: &ReceivedMessage<'_>) -> anyhow::Result<Option<Value>> {
        (self.0)(message)
    }
}

/// Wrap a closure as a listener
pub fn listener_fn<F>(f: F) -> Arc<dyn MessageListener>
where
    F: Fn(&ReceivedMessage<'_>) -> anyhow::Result<Option<Value>> + Send + Sync + 'static,
{
    Arc::new(FnListener(f))
}

/// Strong or weak handle to a listener
#[derive(Clone)]
pub enum ListenerRef {
    Strong(Arc<dyn MessageListener>),
    Weak(Weak<dyn MessageListener>),
}

impl ListenerRef {
    fn addr(&self) -> *const () {
        match self {
            ListenerRef::Strong(listener) => Arc::as_ptr(listener) as *const (),
            ListenerRef::Weak(listener) => Weak::as_ptr(listener) as *const (),
        }
    }

    pub fn is_weak(&self) -> bool {
        matches!(self, ListenerRef::Weak(_))
    }

    /// Resolve to a callable listener; `None` for an expired weak entry
    pub fn resolve(&self) -> Option<Arc<dyn MessageListener>> {
        match self {
            ListenerRef::Strong(listener) => Some(Arc::clone(listener)),
            ListenerRef::Weak(listener) => listener.upgrade(),
        }
    }

    pub fn is_alive(&self) -> bool {
        match self {
            ListenerRef::Strong(_) => true,
            ListenerRef::Weak(listener) => listener.strong_count() > 0,
        }
    }
}

fn listener_addr(listener: &Arc<dyn MessageListener>) -> *const () {
    Arc::as_ptr(listener) as *const ()
}

/// One registration
#[derive(Clone)]
pub struct ListenerEntry {
    pub id: u64,
    pub name: Atom,
    pub listener: ListenerRef,
}

/// Per-name registration counts
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ListenerCounts {
    pub strong: usize,
    pub weak_alive: usize,
    pub weak_dead: usize,
}

impl ListenerCounts {
    pub fn total(&self) -> usize {
        self.strong + self.weak_alive + self.weak_dead
    }
}

/// Ordered registrations for one node
#[derive(Default)]
pub struct ListenerTable {
    entries: Vec<ListenerEntry>,
    next_id: u64,
}

impl ListenerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register; returns `false` if the identical registration exists
    pub fn add(&mut self, name: Atom, listener: &Arc<dyn MessageListener>, weak: bool) -> bool {
        let addr = listener_addr(listener);
        let exists = self.entries.iter().any(|entry| {
            entry.name == name && entry.listener.is_weak() == weak && entry.listener.addr() == addr
        });
        if exists {
            return false;
        }

        let listener = if weak {
            ListenerRef::Weak(Arc::downgrade(listener))
        } else {
            ListenerRef::Strong(Arc::clone(listener))
        };
        self.next_id += 1;
        self.entries.push(ListenerEntry {
            id: self.next_id,
            name,
            listener,
        });
        true
    }

    /// Remove at most one matching registration
    pub fn remove(&mut self, name: &str, listener: &Arc<dyn MessageListener>, weak: bool) -> bool {
        let addr = listener_addr(listener);
        let position = self.entries.iter().position(|entry| {
            entry.name == *name && entry.listener.is_weak() == weak && entry.listener.addr() == addr
        });
        match position {
            Some(index) => {
                self.entries.remove(index);
                true
            }
            None => false,
        }
    }

    /// Remove an entry by id (used to prune expired weak entries)
    pub fn remove_id(&mut self, id: u64) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Copy of the entries registered for `name`, in registration order
    pub fn snapshot(&self, name: &str) -> Vec<ListenerEntry> {
        self.entries
            .iter()
            .filter(|entry| entry.name == *name)
            .cloned()
            .collect()
    }

    pub fn has_listeners_for(&self, name: &str) -> bool {
        self.entries.iter().any(|entry| entry.name == *name)
    }

    /// Registration counts grouped by name, in first-registration order
    pub fn counts(&self) -> Vec<(Atom, ListenerCounts)> {
        let mut out: Vec<(Atom, ListenerCounts)> = Vec::new();
        for entry in &self.entries {
            let index = match out.iter().position(|(name, _)| *name == entry.name) {
                Some(index) => index,
                None => {
                    out.push((entry.name.clone(), ListenerCounts::default()));
                    out.len() - 1
                }
            };
            let slot = &mut out[index].1;
            match &entry.listener {
                ListenerRef::Strong(_) => slot.strong += 1,
                weak if weak.is_alive() => slot.weak_alive += 1,
                _ => slot.weak_dead += 1,
            }
        }
        out
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
