//! Message Manager Error Types
//!
//! Errors surfaced by node operations, transports, and the collaborators
//! they reach (codec, script loader, process checker).

use codec::CodecError;
use thiserror::Error;

/// Main message manager error type
#[derive(Error, Debug)]
pub enum MessageManagerError {
    /// A blocking send was issued while this process already waits on one
    #[error("Reentrant sync send: a synchronous message is already outstanding in this process")]
    ReentrantSyncSend,

    /// The node has no transport binding
    #[error("Not initialized: {operation} requires a bound message manager")]
    NotInitialized { operation: String },

    /// The payload cannot be cloned natively nor through JSON text
    #[error("Data clone error: {reason}")]
    DataClone { reason: String },

    /// Reply storage could not be allocated
    #[error("Out of memory: cannot allocate {requested} reply slots")]
    OutOfMemory { requested: usize },

    /// Weak registration of a listener that cannot hand out weak handles
    #[error("Listener for '{message}' does not support weak references")]
    NoWeakCapability { message: String },

    /// A blob could not be frozen before being shared across an endpoint
    #[error("Blob {blob} cannot be made immutable")]
    ImmutabilityFailure { blob: String },

    /// Operation is not available for this node role
    #[error("Operation '{operation}' not implemented for {role}")]
    NotImplemented { operation: String, role: String },

    /// Adoption would make a node its own ancestor
    #[error("Tree cycle: manager {child} is an ancestor of manager {parent}")]
    TreeCycle { parent: u64, child: u64 },

    /// Required collaborator is missing
    #[error("Not available: {what}")]
    NotAvailable { what: String },

    /// A reply slot did not contain JSON text
    #[error("Malformed reply #{index}: {message}")]
    MalformedReply { index: usize, message: String },

    /// Pipe or framing failure
    #[error("Transport error: {message}")]
    Transport {
        message: String,
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Blocking wait exceeded its deadline
    #[error("Timeout error: {operation} exceeded {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    /// The peer answered a blocking request with a failure
    #[error("Remote failure: {message}")]
    RemoteFailure { message: String },

    /// Bridge handshake did not complete
    #[error("Handshake error: {message}")]
    Handshake { message: String },

    /// Codec failure other than a data clone error
    #[error("Codec error: {0}")]
    Codec(CodecError),

    /// Script fetch or execution failure
    #[error("Script error: {url}: {message}")]
    Script { url: String, message: String },
}

/// Result type alias for message manager operations
pub type Result<T> = std::result::Result<T, MessageManagerError>;

impl MessageManagerError {
    /// Create a not-initialized error
    pub fn not_initialized(operation: impl Into<String>) -> Self {
        Self::NotInitialized {
            operation: operation.into(),
        }
    }

    /// Create a not-implemented error
    pub fn not_implemented(operation: impl Into<String>, role: impl Into<String>) -> Self {
        Self::NotImplemented {
            operation: operation.into(),
            role: role.into(),
        }
    }

    /// Create a not-available error
    pub fn not_available(what: impl Into<String>) -> Self {
        Self::NotAvailable { what: what.into() }
    }

    /// Create a transport error
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
            source: None,
        }
    }

    /// Create a transport error with source
    pub fn transport_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Transport {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a remote failure error
    pub fn remote(message: impl Into<String>) -> Self {
        Self::RemoteFailure {
            message: message.into(),
        }
    }

    /// Create a handshake error
    pub fn handshake(message: impl Into<String>) -> Self {
        Self::Handshake {
            message: message.into(),
        }
    }

    /// Create a script error
    pub fn script(url: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Script {
            url: url.into(),
            message: message.into(),
        }
    }

    /// Errors that end the transport rather than a single call
    pub fn is_fatal_for_transport(&self) -> bool {
        matches!(self, Self::Transport { .. } | Self::Handshake { .. })
    }
}

impl From<CodecError> for MessageManagerError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::DataClone { reason } => Self::DataClone { reason },
            other => Self::Codec(other),
        }
    }
}

impl From<bincode::Error> for MessageManagerError {
    fn from(err: bincode::Error) -> Self {
        Self::transport_with_source("frame encoding failed", err)
    }
}
