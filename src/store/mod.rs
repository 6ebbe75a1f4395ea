//! Local Content-Addressed Store
//!
//! The interface the pull-through middleware wraps: a deduplicated store
//! for manifests and blobs keyed by digest. Two implementations ship with
//! the crate: a sha256-sharded filesystem store and an in-memory store.

mod fs;
mod memory;

pub use fs::FsStore;
pub use memory::MemoryStore;

use crate::image::{Descriptor, Digest, Manifest};
use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Errors from the local store
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("manifest {0} unknown to the local store")]
    ManifestUnknown(Digest),

    #[error("blob {0} unknown to the local store")]
    BlobUnknown(Digest),

    #[error("content verification failed: expected {expected}, got {actual}")]
    ContentVerification { expected: String, actual: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            StoreError::ManifestUnknown(_) | StoreError::BlobUnknown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Manifest half of the local store
#[async_trait]
pub trait LocalManifestStore: Send + Sync {
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest>;

    async fn put_manifest(&self, manifest: &Manifest) -> Result<()>;

    async fn manifest_exists(&self, digest: &Digest) -> Result<bool>;

    async fn delete_manifest(&self, digest: &Digest) -> Result<()>;
}

/// Blob half of the local store
#[async_trait]
pub trait LocalBlobStore: Send + Sync {
    /// Describe a blob without reading it
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor>;

    /// Read a whole blob
    async fn get_blob(&self, digest: &Digest) -> Result<Bytes>;

    /// Store a blob, returning its descriptor
    async fn put_blob(&self, media_type: &str, data: Bytes) -> Result<Descriptor>;

    async fn delete_blob(&self, digest: &Digest) -> Result<()>;

    /// Open a two-phase writer for streaming ingest (used by mirroring).
    /// Nothing is visible in the store until `commit` succeeds; dropping
    /// the writer discards the partial write.
    async fn blob_writer(&self) -> Result<Box<dyn BlobWriter>>;
}

/// Two-phase blob writer: write chunks, then commit under the expected
/// digest. An uncommitted writer cleans up after itself on drop.
#[async_trait]
pub trait BlobWriter: Send {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()>;

    /// Verify the accumulated content against `expected` and publish it
    async fn commit(self: Box<Self>, expected: &Digest) -> Result<Descriptor>;
}
