//! Reference objects
//!
//! A [`Blob`] is a binary object that travels next to a serialized payload
//! instead of inside it. Local blobs own their bytes (or a list of parts);
//! remote blobs are proxies for an object living behind a transport endpoint
//! and resolve their bytes and metadata lazily through a [`BlobResolver`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use bytes::{Bytes, BytesMut};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CodecError, CodecResult};

/// File-specific metadata as shipped with a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub name: String,
    /// Milliseconds since the Unix epoch
    pub last_modified: i64,
}

/// Everything a receiver needs to describe a blob without reading it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobMetadata {
    pub content_type: String,
    pub size: u64,
    pub file: Option<FileMetadata>,
}

/// Constructor parameters carried by a proxy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobParams {
    /// Metadata was fully known at the sender
    Normal(BlobMetadata),
    /// Size or modification date was unknown at the sender; ask lazily
    Mystery { is_file: bool },
}

/// Result of resolving a remote blob through its endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBlob {
    pub metadata: BlobMetadata,
    pub bytes: Bytes,
}

/// Fetches the content of a proxied blob from the process that owns it
pub trait BlobResolver: Send + Sync {
    fn resolve_blob(&self, actor: u64) -> CodecResult<ResolvedBlob>;
}

/// Local file information
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileInfo {
    name: String,
    /// `None` when the modification date is not known without a stat
    last_modified: Option<i64>,
}

/// Proxy state for a blob owned by another endpoint
#[derive(Debug)]
pub struct RemoteBlob {
    endpoint: u64,
    actor: u64,
    params: BlobParams,
    resolver: Option<Weak<dyn BlobResolver>>,
    resolved: OnceCell<ResolvedBlob>,
}

impl RemoteBlob {
    pub fn endpoint(&self) -> u64 {
        self.endpoint
    }

    pub fn actor(&self) -> u64 {
        self.actor
    }

    pub fn params(&self) -> &BlobParams {
        &self.params
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.get().is_some()
    }

    fn resolve(&self) -> CodecResult<&ResolvedBlob> {
        self.resolved.get_or_try_init(|| {
            let resolver = self
                .resolver
                .as_ref()
                .and_then(Weak::upgrade)
                .ok_or_else(|| {
                    CodecError::blob_resolution(format!(
                        "endpoint {} is gone, actor {} cannot be resolved",
                        self.endpoint, self.actor
                    ))
                })?;
            resolver.resolve_blob(self.actor)
        })
    }
}

/// Where a blob's content lives
#[derive(Debug)]
pub enum BlobSource {
    Memory(Bytes),
    Multipart(Vec<Arc<Blob>>),
    Remote(RemoteBlob),
}

/// A binary reference object
#[derive(Debug)]
pub struct Blob {
    id: Uuid,
    content_type: String,
    file: Option<FileInfo>,
    size_unknown: bool,
    source: BlobSource,
    mutable: AtomicBool,
    freezable: bool,
}

impl Blob {
    /// In-memory blob
    pub fn from_bytes(bytes: impl Into<Bytes>, content_type: impl Into<String>) -> Arc<Blob> {
        Blob::builder(BlobSource::Memory(bytes.into()))
            .content_type(content_type)
            .build()
    }

    /// In-memory file with a known modification date
    pub fn file(
        bytes: impl Into<Bytes>,
        content_type: impl Into<String>,
        name: impl Into<String>,
        last_modified: i64,
    ) -> Arc<Blob> {
        Blob::builder(BlobSource::Memory(bytes.into()))
            .content_type(content_type)
            .file(name, Some(last_modified))
            .build()
    }

    /// Blob stitched together from other blobs
    pub fn multipart(parts: Vec<Arc<Blob>>, content_type: impl Into<String>) -> Arc<Blob> {
        Blob::builder(BlobSource::Multipart(parts))
            .content_type(content_type)
            .build()
    }

    /// Proxy for a blob that lives behind `endpoint`
    pub fn remote(
        endpoint: u64,
        actor: u64,
        params: BlobParams,
        resolver: Option<Weak<dyn BlobResolver>>,
    ) -> Arc<Blob> {
        let (content_type, file) = match &params {
            BlobParams::Normal(meta) => (
                meta.content_type.clone(),
                meta.file.as_ref().map(|f| FileInfo {
                    name: f.name.clone(),
                    last_modified: Some(f.last_modified),
                }),
            ),
            BlobParams::Mystery { .. } => (String::new(), None),
        };
        let size_unknown = matches!(params, BlobParams::Mystery { .. });
        let mut builder = Blob::builder(BlobSource::Remote(RemoteBlob {
            endpoint,
            actor,
            params,
            resolver,
            resolved: OnceCell::new(),
        }))
        .content_type(content_type);
        builder.file = file;
        builder.size_unknown = size_unknown;
        // Proxies are immutable from birth
        builder.mutable = false;
        builder.build()
    }

    pub fn builder(source: BlobSource) -> BlobBuilder {
        BlobBuilder {
            content_type: String::new(),
            file: None,
            size_unknown: false,
            source,
            mutable: true,
            freezable: true,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn source(&self) -> &BlobSource {
        &self.source
    }

    pub fn remote_info(&self) -> Option<&RemoteBlob> {
        match &self.source {
            BlobSource::Remote(remote) => Some(remote),
            _ => None,
        }
    }

    pub fn parts(&self) -> Option<&[Arc<Blob>]> {
        match &self.source {
            BlobSource::Multipart(parts) => Some(parts),
            _ => None,
        }
    }

    pub fn is_file(&self) -> bool {
        match &self.source {
            BlobSource::Remote(RemoteBlob {
                params: BlobParams::Mystery { is_file },
                ..
            }) => *is_file,
            _ => self.file.is_some(),
        }
    }

    /// Whether size or modification date can only be learnt lazily
    pub fn has_unknown_metadata(&self) -> bool {
        self.size_unknown
            || self
                .file
                .as_ref()
                .map(|f| f.last_modified.is_none())
                .unwrap_or(false)
    }

    pub fn is_mutable(&self) -> bool {
        self.mutable.load(Ordering::Acquire)
    }

    /// Make the blob immutable; returns `false` if it refuses
    pub fn freeze(&self) -> bool {
        if !self.is_mutable() {
            return true;
        }
        if !self.freezable {
            return false;
        }
        self.mutable.store(false, Ordering::Release);
        true
    }

    pub fn content_type(&self) -> CodecResult<String> {
        match &self.source {
            BlobSource::Remote(remote) if self.size_unknown => {
                Ok(remote.resolve()?.metadata.content_type.clone())
            }
            _ => Ok(self.content_type.clone()),
        }
    }

    pub fn size(&self) -> CodecResult<u64> {
        match &self.source {
            BlobSource::Memory(bytes) => Ok(bytes.len() as u64),
            BlobSource::Multipart(parts) => parts
                .iter()
                .try_fold(0u64, |total, part| Ok(total + part.size()?)),
            BlobSource::Remote(remote) => match &remote.params {
                BlobParams::Normal(meta) => Ok(meta.size),
                BlobParams::Mystery { .. } => Ok(remote.resolve()?.metadata.size),
            },
        }
    }

    /// Full metadata; proxies with unknown metadata resolve through their endpoint
    pub fn metadata(&self) -> CodecResult<BlobMetadata> {
        if let BlobSource::Remote(remote) = &self.source {
            return match &remote.params {
                BlobParams::Normal(meta) => Ok(meta.clone()),
                BlobParams::Mystery { .. } => Ok(remote.resolve()?.metadata.clone()),
            };
        }

        let file = self.file.as_ref().map(|f| FileMetadata {
            name: f.name.clone(),
            last_modified: f.last_modified.unwrap_or_default(),
        });
        Ok(BlobMetadata {
            content_type: self.content_type.clone(),
            size: self.size()?,
            file,
        })
    }

    /// Read the whole content
    pub fn bytes(&self) -> CodecResult<Bytes> {
        match &self.source {
            BlobSource::Memory(bytes) => Ok(bytes.clone()),
            BlobSource::Multipart(parts) => {
                let mut out = BytesMut::new();
                for part in parts {
                    out.extend_from_slice(&part.bytes()?);
                }
                Ok(out.freeze())
            }
            BlobSource::Remote(remote) => Ok(remote.resolve()?.bytes.clone()),
        }
    }
}

/// Builder for [`Blob`] values with non-default flags
pub struct BlobBuilder {
    content_type: String,
    file: Option<FileInfo>,
    size_unknown: bool,
    source: BlobSource,
    mutable: bool,
    freezable: bool,
}

impl BlobBuilder {
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }

    pub fn file(mut self, name: impl Into<String>, last_modified: Option<i64>) -> Self {
        self.file = Some(FileInfo {
            name: name.into(),
            last_modified,
        });
        self
    }

    /// The size is only known after reading the content
    pub fn size_unknown(mut self) -> Self {
        self.size_unknown = true;
        self
    }

    /// The blob cannot be made immutable (e.g. backed by a growing stream)
    pub fn unfreezable(mut self) -> Self {
        self.freezable = false;
        self
    }

    pub fn build(self) -> Arc<Blob> {
        Arc::new(Blob {
            id: Uuid::new_v4(),
            content_type: self.content_type,
            file: self.file,
            size_unknown: self.size_unknown,
            source: self.source,
            mutable: AtomicBool::new(self.mutable),
            freezable: self.freezable,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingResolver {
        calls: AtomicUsize,
    }

    impl BlobResolver for CountingResolver {
        fn resolve_blob(&self, actor: u64) -> CodecResult<ResolvedBlob> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ResolvedBlob {
                metadata: BlobMetadata {
                    content_type: "application/octet-stream".into(),
                    size: 3,
                    file: None,
                },
                bytes: Bytes::from(vec![actor as u8; 3]),
            })
        }
    }

    #[test]
    fn test_multipart_reads_concatenate() {
        let blob = Blob::multipart(
            vec![
                Blob::from_bytes(&b"ab"[..], "text/plain"),
                Blob::from_bytes(&b"cd"[..], "text/plain"),
            ],
            "text/plain",
        );
        assert_eq!(blob.size().unwrap(), 4);
        assert_eq!(&blob.bytes().unwrap()[..], b"abcd");
    }

    #[test]
    fn test_freeze() {
        let blob = Blob::from_bytes(vec![1u8], "");
        assert!(blob.is_mutable());
        assert!(blob.freeze());
        assert!(!blob.is_mutable());

        let stubborn = Blob::builder(BlobSource::Memory(Bytes::new()))
            .unfreezable()
            .build();
        assert!(!stubborn.freeze());
        assert!(stubborn.is_mutable());
    }

    #[test]
    fn test_unknown_metadata_detection() {
        let file = Blob::builder(BlobSource::Memory(Bytes::new()))
            .file("a.txt", None)
            .build();
        assert!(file.has_unknown_metadata());
        assert!(!Blob::file(vec![0u8], "", "b.txt", 5).has_unknown_metadata());
    }

    #[test]
    fn test_mystery_proxy_resolves_once() {
        let resolver = Arc::new(CountingResolver {
            calls: AtomicUsize::new(0),
        });
        let weak: Weak<dyn BlobResolver> = Arc::downgrade(&(resolver.clone() as Arc<dyn BlobResolver>));
        let proxy = Blob::remote(1, 7, BlobParams::Mystery { is_file: false }, Some(weak));

        assert!(!proxy.is_mutable());
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 0);
        assert_eq!(proxy.size().unwrap(), 3);
        assert_eq!(&proxy.bytes().unwrap()[..], &[7u8, 7, 7]);
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_orphaned_proxy_fails_resolution() {
        let proxy = Blob::remote(1, 2, BlobParams::Mystery { is_file: true }, None);
        assert!(proxy.is_file());
        assert!(matches!(
            proxy.bytes(),
            Err(CodecError::BlobResolution { .. })
        ));
    }
}
