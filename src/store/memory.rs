//! In-Memory Store
//!
//! A `LocalManifestStore`/`LocalBlobStore` backed by process memory, used in
//! tests and by embedders that do not need persistence.

use crate::image::{Descriptor, Digest, Manifest};
use crate::store::{BlobWriter, LocalBlobStore, LocalManifestStore, Result, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const OCTET_STREAM: &str = "application/octet-stream";

/// In-memory content-addressed store
#[derive(Default)]
pub struct MemoryStore {
    manifests: DashMap<Digest, Manifest>,
    blobs: Arc<DashMap<Digest, (String, Bytes)>>,
    manifest_gets: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `get_manifest` calls served, for call-count assertions
    pub fn manifest_get_count(&self) -> usize {
        self.manifest_gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LocalManifestStore for MemoryStore {
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
        self.manifest_gets.fetch_add(1, Ordering::SeqCst);
        self.manifests
            .get(digest)
            .map(|m| m.clone())
            .ok_or_else(|| StoreError::ManifestUnknown(digest.clone()))
    }

    async fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        self.manifests
            .insert(manifest.digest.clone(), manifest.clone());
        Ok(())
    }

    async fn manifest_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(self.manifests.contains_key(digest))
    }

    async fn delete_manifest(&self, digest: &Digest) -> Result<()> {
        self.manifests
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| StoreError::ManifestUnknown(digest.clone()))
    }
}

#[async_trait]
impl LocalBlobStore for MemoryStore {
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
        self.blobs
            .get(digest)
            .map(|entry| Descriptor {
                media_type: entry.0.clone(),
                digest: digest.to_string(),
                size: entry.1.len() as u64,
            })
            .ok_or_else(|| StoreError::BlobUnknown(digest.clone()))
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Bytes> {
        self.blobs
            .get(digest)
            .map(|entry| entry.1.clone())
            .ok_or_else(|| StoreError::BlobUnknown(digest.clone()))
    }

    async fn put_blob(&self, media_type: &str, data: Bytes) -> Result<Descriptor> {
        let digest = Digest::from_bytes(&data);
        let size = data.len() as u64;
        self.blobs
            .insert(digest.clone(), (media_type.to_string(), data));
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size,
        })
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<()> {
        self.blobs
            .remove(digest)
            .map(|_| ())
            .ok_or_else(|| StoreError::BlobUnknown(digest.clone()))
    }

    async fn blob_writer(&self) -> Result<Box<dyn BlobWriter>> {
        Ok(Box::new(MemoryBlobWriter {
            blobs: self.blobs.clone(),
            buffer: Vec::new(),
        }))
    }
}

struct MemoryBlobWriter {
    blobs: Arc<DashMap<Digest, (String, Bytes)>>,
    buffer: Vec<u8>,
}

#[async_trait]
impl BlobWriter for MemoryBlobWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(chunk);
        Ok(())
    }

    async fn commit(self: Box<Self>, expected: &Digest) -> Result<Descriptor> {
        let actual = Digest::from_bytes(&self.buffer);
        if &actual != expected {
            return Err(StoreError::ContentVerification {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let size = self.buffer.len() as u64;
        self.blobs.insert(
            expected.clone(),
            (OCTET_STREAM.to_string(), Bytes::from(self.buffer)),
        );
        Ok(Descriptor {
            media_type: OCTET_STREAM.to_string(),
            digest: expected.to_string(),
            size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_blob_round_trip() {
        let store = MemoryStore::new();
        let desc = store
            .put_blob(OCTET_STREAM, Bytes::from_static(b"data"))
            .await
            .unwrap();
        let digest = Digest::parse(&desc.digest).unwrap();

        assert_eq!(store.get_blob(&digest).await.unwrap().as_ref(), b"data");
        assert!(store.delete_blob(&digest).await.is_ok());
        assert!(store.stat_blob(&digest).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_writer_commits_only_on_matching_digest() {
        let store = MemoryStore::new();

        let mut writer = store.blob_writer().await.unwrap();
        writer.write_chunk(b"streamed").await.unwrap();
        let err = writer
            .commit(&Digest::from_bytes(b"other"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::ContentVerification { .. }));

        let mut writer = store.blob_writer().await.unwrap();
        writer.write_chunk(b"streamed").await.unwrap();
        let expected = Digest::from_bytes(b"streamed");
        writer.commit(&expected).await.unwrap();
        assert!(store.get_blob(&expected).await.is_ok());
    }

    #[tokio::test]
    async fn test_manifest_get_counts() {
        let store = MemoryStore::new();
        let manifest = Manifest::from_payload(
            crate::image::MEDIA_TYPE_SCHEMA2,
            Bytes::from_static(b"{\"schemaVersion\": 2}"),
        );
        store.put_manifest(&manifest).await.unwrap();

        let _ = store.get_manifest(&manifest.digest).await.unwrap();
        let _ = store.get_manifest(&Digest::from_bytes(b"missing")).await;
        assert_eq!(store.manifest_get_count(), 2);
    }
}
