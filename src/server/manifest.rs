//! Manifest Service Pipeline
//!
//! Three layers implement the same `ManifestService` trait and nest per
//! request: the pending-error check wraps the pull-through layer, which
//! wraps the local store. A local hit is returned by identity without any
//! upstream I/O; only an unknown-revision miss enters pull-through.

use crate::image::{Digest, Manifest};
use crate::registry::{RegistryError, TransportKind};
use crate::server::repository::Repository;
use crate::server::{pullthrough_insecure, Error, RequestContext, Result};
use crate::store::StoreError;
use async_trait::async_trait;
use std::sync::Arc;

/// Registry manifest operations for one repository
#[async_trait]
pub trait ManifestService: Send + Sync {
    async fn exists(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool>;

    async fn get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Manifest>;

    /// Store a manifest locally, returning its canonical digest
    async fn put(&self, ctx: &RequestContext, manifest: Manifest) -> Result<Digest>;

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()>;
}

/// Innermost layer: the local manifest store
pub(crate) struct LocalManifestService {
    pub(crate) repo: Arc<Repository>,
}

impl LocalManifestService {
    fn map_store_error(&self, digest: &Digest, err: StoreError) -> Error {
        match err {
            StoreError::ManifestUnknown(_) => self.repo.unknown_revision(digest),
            e => e.into(),
        }
    }
}

#[async_trait]
impl ManifestService for LocalManifestService {
    async fn exists(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        ctx.check_cancelled()?;
        Ok(self.repo.app.manifest_store.manifest_exists(digest).await?)
    }

    async fn get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Manifest> {
        ctx.check_cancelled()?;
        self.repo
            .app
            .manifest_store
            .get_manifest(digest)
            .await
            .map_err(|e| self.map_store_error(digest, e))
    }

    async fn put(&self, ctx: &RequestContext, manifest: Manifest) -> Result<Digest> {
        ctx.check_cancelled()?;
        let digest = manifest.digest.clone();
        self.repo.app.manifest_store.put_manifest(&manifest).await?;
        Ok(digest)
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        ctx.check_cancelled()?;
        self.repo
            .app
            .manifest_store
            .delete_manifest(digest)
            .await
            .map_err(|e| self.map_store_error(digest, e))
    }
}

/// Middle layer: serve unknown revisions from the upstream registry the
/// repository's image stream points at
pub(crate) struct PullthroughManifestService {
    pub(crate) inner: Arc<dyn ManifestService>,
    pub(crate) repo: Arc<Repository>,
}

impl PullthroughManifestService {
    async fn remote_get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Manifest> {
        ctx.check_cancelled()?;
        let (image, resolved, stream) = self.repo.image_of_stream(digest).await?;

        if let Some(manifest) = self.repo.app.manifest_cache.get(digest) {
            tracing::debug!("manifest cache hit for {}", digest);
            return Ok(manifest);
        }

        let (host, reference) = self.repo.upstream_of_image(&image)?;

        let kind = if pullthrough_insecure(&stream, Some(&resolved.tag)) {
            TransportKind::Insecure
        } else {
            TransportKind::Secure
        };

        tracing::info!(
            "pulling manifest {} for {} from {} ({:?})",
            digest,
            self.repo.named(),
            host,
            kind
        );

        let upstream =
            self.repo
                .app
                .upstream
                .repository(&host, &reference.repository_path(), kind);

        let manifest = match upstream.get_manifest(digest).await {
            Ok(manifest) => manifest,
            Err(RegistryError::NotFound(_)) => return Err(self.repo.unknown_revision(digest)),
            Err(e) => return Err(Error::Upstream(e)),
        };

        if &manifest.digest != digest {
            return Err(Error::Unknown(format!(
                "upstream manifest digest mismatch: requested {}, got {}",
                digest, manifest.digest
            )));
        }

        if self.repo.app.pullthrough.mirror {
            // Best effort: a failed mirror write must not fail the read.
            match self.repo.app.manifest_store.put_manifest(&manifest).await {
                Ok(()) => {
                    self.repo
                        .app
                        .digest_cache
                        .add_digest(digest, &self.repo.named());
                }
                Err(e) => {
                    tracing::warn!("unable to mirror manifest {} locally: {}", digest, e);
                }
            }
        }

        self.repo.app.manifest_cache.add(manifest.clone());

        Ok(manifest)
    }
}

#[async_trait]
impl ManifestService for PullthroughManifestService {
    async fn exists(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        match self.inner.exists(ctx, digest).await {
            Ok(true) => Ok(true),
            Ok(false) | Err(Error::ManifestUnknownRevision { .. }) => {
                match self.get(ctx, digest).await {
                    Ok(_) => Ok(true),
                    Err(e) if e.is_not_found() => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Manifest> {
        match self.inner.get(ctx, digest).await {
            Ok(manifest) => Ok(manifest),
            Err(Error::ManifestUnknownRevision { .. }) => self.remote_get(ctx, digest).await,
            Err(e) => Err(e),
        }
    }

    async fn put(&self, ctx: &RequestContext, manifest: Manifest) -> Result<Digest> {
        // Pushes may land before the stream exists; provision it with the
        // requesting user's credentials.
        self.repo.stream.get_or_create(ctx).await?;
        self.inner.put(ctx, manifest).await
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        self.inner.delete(ctx, digest).await
    }
}

/// Outermost layer: refuse operations for repositories with recorded errors
pub(crate) struct PendingErrorsManifestService {
    pub(crate) inner: Arc<dyn ManifestService>,
    pub(crate) repo: Arc<Repository>,
}

#[async_trait]
impl ManifestService for PendingErrorsManifestService {
    async fn exists(&self, ctx: &RequestContext, digest: &Digest) -> Result<bool> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.exists(ctx, digest).await
    }

    async fn get(&self, ctx: &RequestContext, digest: &Digest) -> Result<Manifest> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.get(ctx, digest).await
    }

    async fn put(&self, ctx: &RequestContext, manifest: Manifest) -> Result<Digest> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.put(ctx, manifest).await
    }

    async fn delete(&self, ctx: &RequestContext, digest: &Digest) -> Result<()> {
        self.repo.check_pending_errors(ctx)?;
        self.inner.delete(ctx, digest).await
    }
}
