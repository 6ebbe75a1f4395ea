//! Repository Scope
//!
//! `App` holds the process-wide state (local store handles, catalog client,
//! upstream factory, caches). `Repository` is created per request for one
//! `namespace/name` and owns the request scope: the image cache, the cached
//! image stream and the per-request upstream client map. The service
//! pipelines borrow the scope through `Arc`; the decorator order is fixed:
//! pending-error check outermost, local store innermost.

use crate::catalog::CatalogClient;
use crate::image::{normalize_image, Digest, Image, ImageReference};
use crate::registry::{HttpUpstreamFactory, UpstreamClientFactory};
use crate::server::blob::{
    BlobStore, LocalBlobService, PendingErrorsBlobStore, PullthroughBlobStore,
};
use crate::server::manifest::{
    LocalManifestService, ManifestService, PendingErrorsManifestService,
    PullthroughManifestService,
};
use crate::server::{
    resolve_image_id, DigestRepositoryCache, Error, ImageStreamHandle, ManifestCache,
    RemoteBlobGetter, RequestContext, ResolvedTag, Result,
};
use crate::store::{LocalBlobStore, LocalManifestStore};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Pull-through behavior switches
#[derive(Debug, Clone, Copy)]
pub struct PullthroughConfig {
    /// Serve misses from upstream registries
    pub enabled: bool,

    /// Write fetched content back to the local store
    pub mirror: bool,
}

impl Default for PullthroughConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            mirror: false,
        }
    }
}

/// Process-wide state shared by every request
pub struct App {
    pub(crate) catalog: Arc<dyn CatalogClient>,
    pub(crate) manifest_store: Arc<dyn LocalManifestStore>,
    pub(crate) blob_store: Arc<dyn LocalBlobStore>,
    pub(crate) upstream: Arc<dyn UpstreamClientFactory>,
    pub(crate) digest_cache: Arc<DigestRepositoryCache>,
    pub(crate) manifest_cache: Arc<ManifestCache>,
    pub(crate) pullthrough: PullthroughConfig,
}

impl App {
    pub fn builder() -> AppBuilder {
        AppBuilder::default()
    }

    /// Open the repository scope for `name` ("namespace/name")
    pub fn repository(self: &Arc<Self>, name: &str) -> Result<Arc<Repository>> {
        let (namespace, repo_name) = name.split_once('/').ok_or_else(|| {
            Error::InvalidReference(format!(
                "invalid repository name {:?}: it must be of the format <namespace>/<name>",
                name
            ))
        })?;
        if namespace.is_empty() || repo_name.is_empty() || repo_name.contains('/') {
            return Err(Error::InvalidReference(format!(
                "invalid repository name {:?}: it must be of the format <namespace>/<name>",
                name
            )));
        }

        let stream = Arc::new(ImageStreamHandle::new(
            namespace,
            repo_name,
            self.catalog.clone(),
        ));

        let remote = RemoteBlobGetter::new(
            stream.clone(),
            self.upstream.clone(),
            self.digest_cache.clone(),
        );

        Ok(Arc::new(Repository {
            app: self.clone(),
            namespace: namespace.to_string(),
            name: repo_name.to_string(),
            stream,
            remote,
            images: Mutex::new(HashMap::new()),
        }))
    }
}

/// Builds an `App` from its collaborators
pub struct AppBuilder {
    catalog: Option<Arc<dyn CatalogClient>>,
    manifest_store: Option<Arc<dyn LocalManifestStore>>,
    blob_store: Option<Arc<dyn LocalBlobStore>>,
    upstream: Arc<dyn UpstreamClientFactory>,
    digest_cache: Arc<DigestRepositoryCache>,
    manifest_cache: Arc<ManifestCache>,
    pullthrough: PullthroughConfig,
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self {
            catalog: None,
            manifest_store: None,
            blob_store: None,
            upstream: Arc::new(HttpUpstreamFactory::new()),
            digest_cache: Arc::new(DigestRepositoryCache::default()),
            manifest_cache: Arc::new(ManifestCache::default()),
            pullthrough: PullthroughConfig::default(),
        }
    }
}

impl AppBuilder {
    pub fn catalog(mut self, catalog: Arc<dyn CatalogClient>) -> Self {
        self.catalog = Some(catalog);
        self
    }

    pub fn manifest_store(mut self, store: Arc<dyn LocalManifestStore>) -> Self {
        self.manifest_store = Some(store);
        self
    }

    pub fn blob_store(mut self, store: Arc<dyn LocalBlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }

    /// Substitute the upstream client factory (tests use recording fakes)
    pub fn upstream_factory(mut self, factory: Arc<dyn UpstreamClientFactory>) -> Self {
        self.upstream = factory;
        self
    }

    pub fn pullthrough(mut self, config: PullthroughConfig) -> Self {
        self.pullthrough = config;
        self
    }

    pub fn build(self) -> Result<Arc<App>> {
        let catalog = self
            .catalog
            .ok_or_else(|| Error::Unknown("app requires a catalog client".to_string()))?;
        let manifest_store = self
            .manifest_store
            .ok_or_else(|| Error::Unknown("app requires a local manifest store".to_string()))?;
        let blob_store = self
            .blob_store
            .ok_or_else(|| Error::Unknown("app requires a local blob store".to_string()))?;

        Ok(Arc::new(App {
            catalog,
            manifest_store,
            blob_store,
            upstream: self.upstream,
            digest_cache: self.digest_cache,
            manifest_cache: self.manifest_cache,
            pullthrough: self.pullthrough,
        }))
    }
}

/// One repository's request scope
pub struct Repository {
    pub(crate) app: Arc<App>,
    namespace: String,
    name: String,
    pub(crate) stream: Arc<ImageStreamHandle>,
    pub(crate) remote: RemoteBlobGetter,

    // Images cached for the lifetime of the request being handled.
    images: Mutex<HashMap<Digest, Image>>,
}

impl Repository {
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The `namespace/name` path of this repository
    pub fn named(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The manifest service pipeline for this repository
    pub fn manifests(self: &Arc<Self>) -> Arc<dyn ManifestService> {
        let mut service: Arc<dyn ManifestService> = Arc::new(LocalManifestService {
            repo: self.clone(),
        });

        if self.app.pullthrough.enabled {
            service = Arc::new(PullthroughManifestService {
                inner: service,
                repo: self.clone(),
            });
        }

        Arc::new(PendingErrorsManifestService {
            inner: service,
            repo: self.clone(),
        })
    }

    /// The blob store pipeline for this repository
    pub fn blobs(self: &Arc<Self>) -> Arc<dyn BlobStore> {
        let mut store: Arc<dyn BlobStore> = Arc::new(LocalBlobService { repo: self.clone() });

        if self.app.pullthrough.enabled {
            store = Arc::new(PullthroughBlobStore {
                inner: store,
                repo: self.clone(),
                mirror: self.app.pullthrough.mirror,
            });
        }

        Arc::new(PendingErrorsBlobStore {
            inner: store,
            repo: self.clone(),
        })
    }

    /// Surface any error recorded for this repository before running an
    /// operation on it
    pub fn check_pending_errors(&self, ctx: &RequestContext) -> Result<()> {
        ctx.check_pending_errors(&self.namespace, &self.name)
    }

    /// Fetch the image for `digest`, normalized, from the request cache or
    /// the catalog. At most one catalog lookup happens per digest per
    /// request.
    pub(crate) async fn get_image(&self, digest: &Digest) -> Result<Image> {
        let mut images = self.images.lock().await;
        if let Some(image) = images.get(digest) {
            tracing::debug!("returning cached copy of image {}", image.name);
            return Ok(image.clone());
        }

        let mut image = self
            .app
            .catalog
            .get_image(digest.as_str())
            .await
            .map_err(Error::from_catalog)?;

        normalize_image(&mut image)
            .map_err(|e| Error::Unknown(format!("unable to parse image {}: {}", digest, e)))?;

        images.insert(digest.clone(), image.clone());
        Ok(image)
    }

    /// Resolve `digest` within this repository's image stream and load the
    /// image it maps to. Resolution failures are reported as an unknown
    /// manifest revision for this repository.
    pub(crate) async fn image_of_stream(
        &self,
        digest: &Digest,
    ) -> Result<(Image, ResolvedTag, crate::catalog::ImageStream)> {
        let stream = self.stream.get().await.map_err(|e| {
            tracing::error!("failed to get image stream {}: {}", self.named(), e);
            self.unknown_revision(digest)
        })?;

        let resolved = resolve_image_id(&stream, digest.as_str()).map_err(|e| {
            tracing::debug!(
                "failed to resolve image {} in image stream {}: {}",
                digest,
                self.named(),
                e
            );
            match e {
                Error::Conflict(_) => e,
                _ => self.unknown_revision(digest),
            }
        })?;

        let mut image = self.get_image(digest).await.map_err(|e| match e {
            Error::NotFound(_) => self.unknown_revision(digest),
            e => e,
        })?;
        // Pretend the image came from the source its tag event was imported
        // from; the stored pull spec may point elsewhere.
        image.docker_image_reference = resolved.event.docker_image_reference.clone();

        Ok((image, resolved, stream))
    }

    /// Parse an image's upstream pull spec into host + repository path
    pub(crate) fn upstream_of_image(&self, image: &Image) -> Result<(String, ImageReference)> {
        let reference = ImageReference::parse(&image.docker_image_reference)
            .map_err(|e| Error::InvalidReference(e.to_string()))?;
        let host = reference.registry.clone().ok_or_else(|| {
            Error::Unknown(format!(
                "image {} has no registry host in its pull spec {:?}",
                image.name, image.docker_image_reference
            ))
        })?;
        Ok((host, reference))
    }

    pub(crate) fn unknown_revision(&self, digest: &Digest) -> Error {
        Error::ManifestUnknownRevision {
            name: self.named(),
            revision: digest.clone(),
        }
    }
}
