//! Blob Store Pipeline
//!
//! Mirrors the manifest pipeline: pending-error check around pull-through
//! around the local store. Reads that miss locally are routed through the
//! remote blob getter; `serve_blob` can tee the upstream body into a local
//! blob writer that is only committed on a clean EOF.

use crate::image::{Descriptor, Digest};
use crate::server::repository::Repository;
use crate::server::{Error, RequestContext, Result};
use crate::store::StoreError;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// An opened blob: its descriptor and the body chunks
pub struct BlobContent {
    pub descriptor: Descriptor,

    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

/// Registry blob operations for one repository
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Describe a blob without transferring it
    async fn stat(&self, ctx: &RequestContext, digest: &Digest) -> Result<Descriptor>;

    /// Open a blob for streaming
    async fn open(&self, ctx: &RequestContext, digest: &Digest) -> Result<BlobContent>;

    /// Stream a blob into `writer`, returning the descriptor the response
    /// headers are built from
    async fn serve_blob(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Descriptor>;

    /// Store a blob locally
    async fn put(&self, ctx: &RequestContext, media_type: &str, data: Bytes) -> Result<Descriptor>;

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()>;
}

/// Innermost layer: the local blob store
pub(crate) struct LocalBlobService {
    pub(crate) repo: Arc<Repository>,
}

fn map_store_error(digest: &Digest, err: StoreError) -> Error {
    match err {
        StoreError::BlobUnknown(_) => Error::BlobUnknown(digest.clone()),
        e => e.into(),
    }
}

#[async_trait]
impl BlobStore for LocalBlobService {
    async fn stat(&self, ctx: &RequestContext, digest: &Digest) -> Result<Descriptor> {
        ctx.check_cancelled()?;
        self.repo
            .app
            .blob_store
            .stat_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))
    }

    async fn open(&self, ctx: &RequestContext, digest: &Digest) -> Result<BlobContent> {
        ctx.check_cancelled()?;
        let descriptor = self
            .repo
            .app
            .blob_store
            .stat_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))?;
        let data = self
            .repo
            .app
            .blob_store
            .get_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))?;

        Ok(BlobContent {
            descriptor,
            stream: futures_util::stream::iter([Ok::<_, std::io::Error>(data)]).boxed(),
        })
    }

    async fn serve_blob(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Descriptor> {
        ctx.check_cancelled()?;
        let descriptor = self
            .repo
            .app
            .blob_store
            .stat_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))?;
        let data = self
            .repo
            .app
            .blob_store
            .get_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))?;

        writer.write_all(&data).await.map_err(StoreError::Io)?;
        Ok(descriptor)
    }

    async fn put(&self, ctx: &RequestContext, media_type: &str, data: Bytes) -> Result<Descriptor> {
        ctx.check_cancelled()?;
        Ok(self.repo.app.blob_store.put_blob(media_type, data).await?)
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        ctx.check_cancelled()?;
        self.repo
            .app
            .blob_store
            .delete_blob(digest)
            .await
            .map_err(|e| map_store_error(digest, e))
    }
}

/// Middle layer: route local misses to candidate upstream repositories
pub(crate) struct PullthroughBlobStore {
    pub(crate) inner: Arc<dyn BlobStore>,
    pub(crate) repo: Arc<Repository>,
    pub(crate) mirror: bool,
}

impl PullthroughBlobStore {
    /// Stream an upstream blob to `writer`, optionally teeing it into a
    /// local blob writer committed only on clean EOF
    async fn serve_remote(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Descriptor> {
        let mut remote = self.repo.remote.open(ctx, digest).await?;

        let mut mirror_writer = if self.mirror {
            match self.repo.app.blob_store.blob_writer().await {
                Ok(w) => Some(w),
                Err(e) => {
                    tracing::warn!("unable to start local mirror of blob {}: {}", digest, e);
                    None
                }
            }
        } else {
            None
        };

        let mut served: u64 = 0;
        while let Some(chunk) = remote.stream.next().await {
            // Cancellation drops the mirror writer before it ever commits.
            ctx.check_cancelled()?;

            let chunk = chunk.map_err(StoreError::Io)?;
            writer.write_all(&chunk).await.map_err(StoreError::Io)?;
            served += chunk.len() as u64;

            if let Some(w) = mirror_writer.as_mut() {
                if let Err(e) = w.write_chunk(&chunk).await {
                    tracing::warn!("aborting local mirror of blob {}: {}", digest, e);
                    mirror_writer = None;
                }
            }
        }
        writer.flush().await.map_err(StoreError::Io)?;

        if let Some(w) = mirror_writer {
            match w.commit(digest).await {
                Ok(_) => tracing::debug!("mirrored blob {} locally", digest),
                Err(e) => tracing::warn!("unable to commit local mirror of blob {}: {}", digest, e),
            }
        }

        let mut descriptor = remote.descriptor;
        if descriptor.size == 0 {
            descriptor.size = served;
        }
        Ok(descriptor)
    }
}

#[async_trait]
impl BlobStore for PullthroughBlobStore {
    async fn stat(&self, ctx: &RequestContext, digest: &Digest) -> Result<Descriptor> {
        match self.inner.stat(ctx, digest).await {
            Err(Error::BlobUnknown(_)) => {
                ctx.check_cancelled()?;
                self.repo.remote.stat(ctx, digest).await
            }
            other => other,
        }
    }

    async fn open(&self, ctx: &RequestContext, digest: &Digest) -> Result<BlobContent> {
        match self.inner.open(ctx, digest).await {
            Err(Error::BlobUnknown(_)) => {
                ctx.check_cancelled()?;
                let remote = self.repo.remote.open(ctx, digest).await?;
                Ok(BlobContent {
                    descriptor: remote.descriptor,
                    stream: remote.stream,
                })
            }
            other => other,
        }
    }

    async fn serve_blob(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Descriptor> {
        match self.inner.serve_blob(ctx, digest, writer).await {
            Err(Error::BlobUnknown(_)) => {
                ctx.check_cancelled()?;
                self.serve_remote(ctx, digest, writer).await
            }
            other => other,
        }
    }

    async fn put(&self, ctx: &RequestContext, media_type: &str, data: Bytes) -> Result<Descriptor> {
        self.inner.put(ctx, media_type, data).await
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        self.inner.delete(ctx, digest).await
    }
}

/// Outermost layer: refuse operations for repositories with recorded errors
pub(crate) struct PendingErrorsBlobStore {
    pub(crate) inner: Arc<dyn BlobStore>,
    pub(crate) repo: Arc<Repository>,
}

#[async_trait]
impl BlobStore for PendingErrorsBlobStore {
    async fn stat(&self, ctx: &RequestContext, digest: &Digest) -> Result<Descriptor> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.stat(ctx, digest).await
    }

    async fn open(&self, ctx: &RequestContext, digest: &Digest) -> Result<BlobContent> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.open(ctx, digest).await
    }

    async fn serve_blob(
        &self,
        ctx: &RequestContext,
        digest: &Digest,
        writer: &mut (dyn AsyncWrite + Send + Unpin),
    ) -> Result<Descriptor> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.serve_blob(ctx, digest, writer).await
    }

    async fn put(&self, ctx: &RequestContext, media_type: &str, data: Bytes) -> Result<Descriptor> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.put(ctx, media_type, data).await
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.delete(ctx, digest).await
    }
}
