//! # Hierarchical Message Manager
//!
//! ## Purpose
//!
//! Named, structured messages between a privileged parent process and its
//! content processes. Messages travel through a tree of [`MessageManager`]
//! nodes: broadcasters fan out to their subtrees, leaves hand messages to a
//! transport binding, and every received message bubbles from the receiving
//! node up through its ancestors.
//!
//! ## Architecture Role
//!
//! ```text
//! listeners ◀── dispatch ◀── MessageManager ──▶ TransportBinding ──▶ peer process
//!                               │    ▲              │
//!                      children ▼    │ bubble       ├─ ProcessTransport (frames over a MessagePipe)
//!                          MessageManager           ├─ SameProcessShortcut (direct calls + deferred queue)
//!                                                   └─ BridgeTransport (content to content)
//! ```
//!
//! All process-wide state (sync-send flag, codec, blob proxies, deferred
//! queue, script loader, well-known managers) lives in a [`ProcessContext`].
//!
//! ## Example
//!
//! ```rust
//! use message_manager::{listener_fn, ProcessContext, ProcessKind};
//! use manager_config::MessageManagerConfig;
//! use codec::StructuredValue;
//! use serde_json::json;
//!
//! let ctx = ProcessContext::new(ProcessKind::Parent, MessageManagerConfig::default());
//! ctx.create_parent_process_manager().unwrap();
//! let child = ctx.child_process_manager().unwrap();
//! child
//!     .add_message_listener("ping", &listener_fn(|_| Ok(Some(json!("pong")))))
//!     .unwrap();
//!
//! let parent_side = ctx.same_process_parent_manager().unwrap();
//! let replies = parent_side.send_sync_message("ping", &StructuredValue::Null).unwrap();
//! assert_eq!(replies, vec![json!("pong")]);
//! ```

pub mod atom;
pub mod blob_registry;
pub mod bridge;
pub mod context;
pub mod error;
pub mod listeners;
pub mod logging;
pub mod node;
pub mod process_checker;
pub mod reporter;
pub mod script_loader;
pub mod transport;

pub use atom::{Atom, AtomTable};
pub use blob_registry::{BlobProxyRegistry, ProxyActor};
pub use bridge::{BridgeTransport, ContentBridge};
pub use context::{
    DisconnectObserver, LifecycleEvent, LifecycleObserver, ProcessContext, ProcessKind,
    SyncSendGuard,
};
pub use error::{MessageManagerError, Result};
pub use listeners::{listener_fn, ListenerCounts, MessageListener, ReceivedMessage};
pub use node::{MessageManager, NodeRoles, NodeState};
pub use process_checker::{AllowAllChecker, AppStatus, GrantedProcessChecker, ProcessChecker};
pub use reporter::{MemoryReport, MessageManagerReporter, ReferentCount};
pub use script_loader::{
    CachingScriptLoader, FileScriptSource, ScriptExecutor, ScriptLoader, ScriptSource,
};
pub use transport::{
    ChannelPipe, MessagePipe, ProcessTransport, SameProcessShortcut, TransportBinding,
    TransportKind, TransportMetrics, TransportStats,
};
