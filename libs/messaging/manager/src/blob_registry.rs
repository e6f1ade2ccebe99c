//! Blob Proxy Registry
//!
//! Tracks which blobs have been exposed to which transport endpoint, and
//! which remote proxies this process holds.
//!
//! Sender side: every blob crossing an endpoint gets one actor id per
//! (blob, endpoint). The registry keeps the blob alive under that id so the
//! peer can resolve it later. Receiver side: proxies are interned by
//! (endpoint, actor) so the same remote object always maps to the same
//! `Arc<Blob>` while anyone still holds it.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use codec::{Blob, BlobParams, BlobResolver, ResolvedBlob};
use parking_lot::Mutex;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::error::{MessageManagerError, Result};

/// Actor handed to the wire for one blob
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyActor {
    pub actor: u64,
    /// `None` when the blob is a proxy the peer itself owns
    pub params: Option<BlobParams>,
}

#[derive(Default)]
struct RegistryInner {
    by_blob: HashMap<(Uuid, u64), u64>,
    actors: HashMap<(u64, u64), Arc<Blob>>,
    proxies: HashMap<(u64, u64), Weak<Blob>>,
}

/// Process-wide blob proxy bookkeeping
#[derive(Default)]
pub struct BlobProxyRegistry {
    inner: Mutex<RegistryInner>,
    next_actor: AtomicU64,
}

impl BlobProxyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Actor for `blob` on `endpoint`, creating it on first use
    pub fn get_or_create_proxy(&self, blob: &Arc<Blob>, endpoint: u64) -> Result<ProxyActor> {
        if let Some(remote) = blob.remote_info() {
            if remote.endpoint() == endpoint {
                return Ok(ProxyActor {
                    actor: remote.actor(),
                    params: None,
                });
            }
        }

        if let Some([only]) = blob.parts() {
            if only.is_file() == blob.is_file() {
                trace!(blob = %blob.id(), part = %only.id(), "Unwrapping single-part blob");
                return self.get_or_create_proxy(only, endpoint);
            }
        }

        if !blob.freeze() {
            return Err(MessageManagerError::ImmutabilityFailure {
                blob: blob.id().to_string(),
            });
        }

        // Metadata of a forwarded proxy may resolve remotely; never under the lock
        let params = if blob.has_unknown_metadata() {
            BlobParams::Mystery {
                is_file: blob.is_file(),
            }
        } else {
            BlobParams::Normal(blob.metadata()?)
        };

        let mut inner = self.inner.lock();
        let key = (blob.id(), endpoint);
        if let Some(&actor) = inner.by_blob.get(&key) {
            return Ok(ProxyActor {
                actor,
                params: Some(params),
            });
        }

        let actor = self.next_actor.fetch_add(1, Ordering::Relaxed) + 1;
        inner.by_blob.insert(key, actor);
        inner.actors.insert((endpoint, actor), Arc::clone(blob));
        debug!(blob = %blob.id(), endpoint, actor, "Created blob proxy actor");

        Ok(ProxyActor {
            actor,
            params: Some(params),
        })
    }

    /// Blob this process exposed as `actor` on `endpoint`
    pub fn actor_blob(&self, endpoint: u64, actor: u64) -> Option<Arc<Blob>> {
        self.inner.lock().actors.get(&(endpoint, actor)).cloned()
    }

    /// Content and metadata for a peer's lazy resolution request
    pub fn resolve(&self, endpoint: u64, actor: u64) -> Result<ResolvedBlob> {
        let blob = self.actor_blob(endpoint, actor).ok_or_else(|| {
            MessageManagerError::not_available(format!(
                "blob actor {} on endpoint {}",
                actor, endpoint
            ))
        })?;
        Ok(ResolvedBlob {
            metadata: blob.metadata()?,
            bytes: blob.bytes()?,
        })
    }

    /// Proxy for a remote actor, shared while any holder keeps it alive
    pub fn intern_remote(
        &self,
        endpoint: u64,
        actor: u64,
        params: BlobParams,
        resolver: Option<Weak<dyn BlobResolver>>,
    ) -> Arc<Blob> {
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.proxies.get(&(endpoint, actor)).and_then(Weak::upgrade) {
            return existing;
        }
        let before = inner.proxies.len();
        inner.proxies.retain(|_, proxy| proxy.strong_count() > 0);
        if inner.proxies.len() < before {
            trace!(pruned = before - inner.proxies.len(), "Pruned dropped blob proxies");
        }
        let proxy = Blob::remote(endpoint, actor, params, resolver);
        inner.proxies.insert((endpoint, actor), Arc::downgrade(&proxy));
        proxy
    }

    /// Forget everything scoped to `endpoint`
    pub fn release_endpoint(&self, endpoint: u64) {
        let mut inner = self.inner.lock();
        inner.by_blob.retain(|(_, ep), _| *ep != endpoint);
        inner.actors.retain(|(ep, _), _| *ep != endpoint);
        inner.proxies.retain(|(ep, _), _| *ep != endpoint);
        debug!(endpoint, "Released blob proxies for endpoint");
    }

    /// Actors exposed to peers
    pub fn actor_count(&self) -> usize {
        self.inner.lock().actors.len()
    }

    /// Remote proxies still alive in this process
    pub fn live_proxy_count(&self) -> usize {
        self.inner
            .lock()
            .proxies
            .values()
            .filter(|proxy| proxy.strong_count() > 0)
            .count()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.by_blob.clear();
        inner.actors.clear();
        inner.proxies.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use codec::BlobSource;

    #[test]
    fn test_dedup_per_endpoint() {
        let registry = BlobProxyRegistry::new();
        let blob = Blob::from_bytes(vec![1u8, 2, 3], "application/octet-stream");

        let first = registry.get_or_create_proxy(&blob, 1).unwrap();
        let again = registry.get_or_create_proxy(&blob, 1).unwrap();
        let other = registry.get_or_create_proxy(&blob, 2).unwrap();

        assert_eq!(first.actor, again.actor);
        assert_ne!(first.actor, other.actor);
        assert_eq!(registry.actor_count(), 2);
        assert!(!blob.is_mutable(), "shared blobs are frozen");
    }

    #[test]
    fn test_metadata_params() {
        let registry = BlobProxyRegistry::new();
        let file = Blob::file(&b"abc"[..], "text/plain", "a.txt", 99);
        match registry.get_or_create_proxy(&file, 1).unwrap().params {
            Some(BlobParams::Normal(meta)) => {
                assert_eq!(meta.size, 3);
                assert_eq!(meta.file.unwrap().last_modified, 99);
            }
            other => panic!("unexpected params {:?}", other),
        }

        let undated = Blob::builder(BlobSource::Memory(Bytes::from_static(b"x")))
            .file("b.txt", None)
            .build();
        assert_eq!(
            registry.get_or_create_proxy(&undated, 1).unwrap().params,
            Some(BlobParams::Mystery { is_file: true })
        );
    }

    #[test]
    fn test_single_part_unwrap() {
        let registry = BlobProxyRegistry::new();
        let inner = Blob::from_bytes(vec![5u8], "");
        let wrapper = Blob::multipart(vec![Arc::clone(&inner)], "");

        let via_wrapper = registry.get_or_create_proxy(&wrapper, 1).unwrap();
        let direct = registry.get_or_create_proxy(&inner, 1).unwrap();
        assert_eq!(via_wrapper.actor, direct.actor);
        assert!(wrapper.is_mutable(), "wrapper itself is never frozen");
    }

    #[test]
    fn test_unfreezable_blob_fails() {
        let registry = BlobProxyRegistry::new();
        let blob = Blob::builder(BlobSource::Memory(Bytes::new()))
            .unfreezable()
            .build();
        assert!(matches!(
            registry.get_or_create_proxy(&blob, 1),
            Err(MessageManagerError::ImmutabilityFailure { .. })
        ));
    }

    #[test]
    fn test_remote_proxy_returns_to_its_endpoint() {
        let registry = BlobProxyRegistry::new();
        let params = BlobParams::Mystery { is_file: false };
        let proxy = registry.intern_remote(3, 42, params.clone(), None);
        let same = registry.intern_remote(3, 42, params, None);
        assert!(Arc::ptr_eq(&proxy, &same));

        let actor = registry.get_or_create_proxy(&proxy, 3).unwrap();
        assert_eq!(actor, ProxyActor { actor: 42, params: None });
    }

    #[test]
    fn test_dropped_proxies_are_pruned_on_lookup() {
        let registry = BlobProxyRegistry::new();
        let params = BlobParams::Mystery { is_file: false };
        for actor in 1..=3 {
            drop(registry.intern_remote(4, actor, params.clone(), None));
        }
        assert_eq!(registry.live_proxy_count(), 0);

        let kept = registry.intern_remote(4, 10, params.clone(), None);
        assert_eq!(registry.inner.lock().proxies.len(), 1);

        let dropped = registry.intern_remote(4, 11, params.clone(), None);
        drop(dropped);
        let revived = registry.intern_remote(4, 11, params.clone(), None);
        assert_eq!(registry.inner.lock().proxies.len(), 2);
        assert_eq!(registry.live_proxy_count(), 2);
        assert!(Arc::ptr_eq(&kept, &registry.intern_remote(4, 10, params, None)));
        drop(revived);
    }

    #[test]
    fn test_release_endpoint() {
        let registry = BlobProxyRegistry::new();
        let blob = Blob::from_bytes(vec![1u8], "");
        let actor = registry.get_or_create_proxy(&blob, 9).unwrap().actor;
        assert!(registry.resolve(9, actor).is_ok());

        registry.release_endpoint(9);
        assert_eq!(registry.actor_count(), 0);
        assert!(registry.resolve(9, actor).is_err());
    }
}
