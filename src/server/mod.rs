//! Pull-Through Middleware
//!
//! Wraps a local manifest/blob store with decorators that transparently
//! fetch content from the upstream registries referenced by the repository's
//! image stream:
//!
//! - `Repository` owns the request scope and assembles the pipelines
//!   `{pending errors -> pull-through -> local}` for manifests and blobs.
//! - `ImageStreamHandle` resolves digests to upstream references and the
//!   insecure-transport policy.
//! - `RemoteBlobGetter` probes candidate upstream repositories for blobs.
//! - Process-wide caches associate digests with repositories and hold
//!   recently fetched manifests.

mod blob;
mod cache;
mod context;
mod imagestream;
mod manifest;
mod remote;
mod repository;

pub use blob::{BlobContent, BlobStore};
pub use cache::{DigestRepositoryCache, ManifestCache};
pub use context::RequestContext;
pub use imagestream::{pullthrough_insecure, resolve_image_id, ImageStreamHandle, ResolvedTag};
pub use manifest::ManifestService;
pub use remote::RemoteBlobGetter;
pub use repository::{App, AppBuilder, PullthroughConfig, Repository};

use crate::catalog::CatalogError;
use crate::image::Digest;
use std::sync::Arc;
use thiserror::Error;

/// Registry-facing error taxonomy
#[derive(Error, Debug)]
pub enum Error {
    #[error("manifest unknown to repository {name}: revision {revision}")]
    ManifestUnknownRevision { name: String, revision: Digest },

    #[error("blob unknown to registry: {0}")]
    BlobUnknown(Digest),

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("denied: {0}")]
    Denied(String),

    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("operation cancelled")]
    Cancelled,

    /// The authorization middleware never ran for this request
    #[error("authorization has not completed for this request")]
    AuthIncomplete,

    /// An error recorded for this repository before the operation ran
    #[error("{0}")]
    Deferred(Arc<Error>),

    /// Upstream errors surface verbatim, including the HTTP-to-HTTPS
    /// transport rejection whose message tests match on.
    #[error(transparent)]
    Upstream(crate::registry::RegistryError),

    #[error("storage error: {0}")]
    Store(#[from] crate::store::StoreError),

    #[error("{0}")]
    Unknown(String),
}

impl Error {
    /// Map a classified catalog failure onto the registry taxonomy
    pub(crate) fn from_catalog(err: CatalogError) -> Self {
        match err {
            CatalogError::NotFound(what) => Error::NotFound(what),
            CatalogError::AlreadyExists(what) => Error::AlreadyExists(what),
            CatalogError::Conflict(what) => Error::Conflict(what),
            e if e.is_denied() => Error::Denied(e.to_string()),
            e => Error::Unknown(e.to_string()),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::NotFound(_) | Error::ManifestUnknownRevision { .. } | Error::BlobUnknown(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
