//! Serialized payloads

use std::sync::Arc;

use bytes::Bytes;

use crate::blob::Blob;

/// An opaque serialized buffer plus the reference objects it points at
///
/// The buffer refers to blobs by index into `blobs`. Transports never look
/// inside the buffer; they only translate the blob list for their endpoint.
#[derive(Debug, Clone, Default)]
pub struct StructuredCloneData {
    bytes: Bytes,
    blobs: Vec<Arc<Blob>>,
}

impl StructuredCloneData {
    pub fn new(bytes: impl Into<Bytes>, blobs: Vec<Arc<Blob>>) -> Self {
        Self {
            bytes: bytes.into(),
            blobs,
        }
    }

    /// Payload that deserializes to null
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn blobs(&self) -> &[Arc<Blob>] {
        &self.blobs
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
