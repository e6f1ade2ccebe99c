//! Codec errors
//!
//! Errors raised while turning a [`StructuredValue`](crate::StructuredValue)
//! into a [`StructuredCloneData`](crate::StructuredCloneData) buffer and back,
//! and while resolving reference objects that live in another process.

use thiserror::Error;

/// Structured payload codec errors
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CodecError {
    /// The value cannot be represented natively nor through the JSON text fallback
    #[error("Data clone error: {reason}")]
    DataClone { reason: String },

    /// Buffer contents do not decode to a value
    #[error("Malformed payload: {message} (buffer: {buffer_size} bytes)")]
    Malformed { message: String, buffer_size: usize },

    /// Native encoder failure unrelated to representability
    #[error("Encode error: {message}")]
    Encode { message: String },

    /// A payload references a blob slot that was not shipped with it
    #[error("Missing blob reference {index}: payload carries {available} blobs")]
    MissingBlob { index: u32, available: usize },

    /// A remote blob could not be resolved through its originating endpoint
    #[error("Blob resolution failed: {message}")]
    BlobResolution { message: String },
}

/// Result type alias for codec operations
pub type CodecResult<T> = std::result::Result<T, CodecError>;

impl CodecError {
    /// Create a data clone error
    pub fn data_clone(reason: impl Into<String>) -> Self {
        Self::DataClone {
            reason: reason.into(),
        }
    }

    /// Create a malformed payload error
    pub fn malformed(message: impl Into<String>, buffer_size: usize) -> Self {
        Self::Malformed {
            message: message.into(),
            buffer_size,
        }
    }

    /// Create an encode error
    pub fn encode(message: impl Into<String>) -> Self {
        Self::Encode {
            message: message.into(),
        }
    }

    /// Create a blob resolution error
    pub fn blob_resolution(message: impl Into<String>) -> Self {
        Self::BlobResolution {
            message: message.into(),
        }
    }

    /// Whether the JSON text fallback may still rescue the value
    pub fn is_data_clone(&self) -> bool {
        matches!(self, Self::DataClone { .. })
    }
}
