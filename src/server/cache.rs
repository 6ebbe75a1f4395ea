//! Process-Wide Caches
//!
//! Both caches are bounded and expose only atomic operations; no lock is
//! held across I/O. They live for the process and carry no persistence.

use crate::image::{Digest, Manifest};
use lru::LruCache;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::num::NonZeroUsize;

/// Associates a digest with the repositories known to hold it. Entries are
/// repository identifiers: upstream `host/namespace/name` pull paths
/// recorded by blob probing, or local `namespace/name` names recorded when
/// a manifest is mirrored.
pub struct DigestRepositoryCache {
    entries: Mutex<LruCache<Digest, HashSet<String>>>,
}

impl DigestRepositoryCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Record that `repository` holds `digest`
    pub fn add_digest(&self, digest: &Digest, repository: &str) {
        let mut entries = self.entries.lock();
        match entries.get_mut(digest) {
            Some(set) => {
                set.insert(repository.to_string());
            }
            None => {
                let mut set = HashSet::new();
                set.insert(repository.to_string());
                entries.put(digest.clone(), set);
            }
        }
    }

    /// The repositories recorded for `digest`
    pub fn repositories(&self, digest: &Digest) -> Vec<String> {
        let mut entries = self.entries.lock();
        entries
            .get(digest)
            .map(|set| {
                let mut names: Vec<_> = set.iter().cloned().collect();
                names.sort();
                names
            })
            .unwrap_or_default()
    }

    /// Forget one association
    pub fn remove(&self, digest: &Digest, repository: &str) {
        let mut entries = self.entries.lock();
        if let Some(set) = entries.get_mut(digest) {
            set.remove(repository);
            if set.is_empty() {
                entries.pop(digest);
            }
        }
    }
}

impl Default for DigestRepositoryCache {
    fn default() -> Self {
        Self::new(2048)
    }
}

/// Bounded cache of recently fetched manifests keyed by digest
pub struct ManifestCache {
    entries: Mutex<LruCache<Digest, Manifest>>,
}

impl ManifestCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap();
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn get(&self, digest: &Digest) -> Option<Manifest> {
        self.entries.lock().get(digest).cloned()
    }

    pub fn add(&self, manifest: Manifest) {
        self.entries.lock().put(manifest.digest.clone(), manifest);
    }
}

impl Default for ManifestCache {
    fn default() -> Self {
        Self::new(256)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_digest_cache_accumulates_repositories() {
        let cache = DigestRepositoryCache::new(16);
        let digest = Digest::from_bytes(b"layer");

        cache.add_digest(&digest, "upstream.example.com/ns/app");
        cache.add_digest(&digest, "ns/app");
        assert_eq!(
            cache.repositories(&digest),
            vec!["ns/app".to_string(), "upstream.example.com/ns/app".to_string()]
        );

        cache.remove(&digest, "ns/app");
        assert_eq!(cache.repositories(&digest).len(), 1);
    }

    #[test]
    fn test_digest_cache_is_bounded() {
        let cache = DigestRepositoryCache::new(2);
        let first = Digest::from_bytes(b"first");
        cache.add_digest(&first, "ns/app");
        cache.add_digest(&Digest::from_bytes(b"second"), "ns/app");
        cache.add_digest(&Digest::from_bytes(b"third"), "ns/app");

        // The least recently used entry was evicted.
        assert!(cache.repositories(&first).is_empty());
    }

    #[test]
    fn test_manifest_cache_round_trip() {
        let cache = ManifestCache::new(4);
        let manifest = Manifest::from_payload(
            crate::image::MEDIA_TYPE_SCHEMA2,
            Bytes::from_static(b"{\"schemaVersion\": 2}"),
        );
        assert!(cache.get(&manifest.digest).is_none());
        cache.add(manifest.clone());
        assert_eq!(cache.get(&manifest.digest), Some(manifest));
    }
}
