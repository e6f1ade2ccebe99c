//! # Structured Payload Codec
//!
//! ## Purpose
//!
//! Turns message payloads into opaque byte buffers and back. A payload is a
//! [`StructuredValue`]: a JSON-like tree that may also carry raw bytes,
//! reference objects ([`Blob`]) and host objects. Serialization produces a
//! [`StructuredCloneData`], the buffer plus the list of blobs it references,
//! so transports can translate blobs into proxies for their endpoint without
//! ever parsing the buffer.
//!
//! ## Architecture Role
//!
//! ```text
//! StructuredValue ──serialize──▶ StructuredCloneData ──▶ message-manager transports
//!        ▲                         (bytes + Vec<Arc<Blob>>)          │
//!        └──────────deserialize────────────────────────────────────◀─┘
//! ```
//!
//! ## What This Crate Contains
//! - [`PayloadCodec`]: the codec seam, with the JSON text fallback built in
//! - [`BincodeCodec`]: the default versioned native format
//! - [`Blob`]: local and remote (lazily resolved) reference objects
//! - [`CodecError`]: data clone, malformed buffer and resolution failures
//!
//! ## What This Crate Does NOT Contain
//! - Transport framing or blob proxy bookkeeping (belongs in message-manager)
//! - Any notion of message names, listeners or nodes

pub mod blob;
pub mod clone_data;
pub mod codec;
pub mod error;
pub mod value;

pub use blob::{
    Blob, BlobBuilder, BlobMetadata, BlobParams, BlobResolver, BlobSource, FileMetadata,
    RemoteBlob, ResolvedBlob,
};
pub use clone_data::StructuredCloneData;
pub use codec::{BincodeCodec, PayloadCodec, NATIVE_FORMAT_VERSION};
pub use error::{CodecError, CodecResult};
pub use value::{HostObject, StructuredValue};
