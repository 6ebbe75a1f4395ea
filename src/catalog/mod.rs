//! Image Catalog API
//!
//! Typed client for the control plane that owns `ImageStream` and `Image`
//! objects. The middleware only consumes a narrow slice of the API: fetching
//! streams and images, and auto-provisioning a stream on first push.
//!
//! Errors are classified so callers can map them onto registry semantics
//! (`NotFound` triggers pull-through, `Forbidden`/`Unauthorized`/
//! `QuotaExceeded` become a denial, and so on).

mod memory;

pub use memory::MemoryCatalog;

use crate::image::Image;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

/// Classified control-plane errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("{0} already exists")]
    AlreadyExists(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("invalid object: {0}")]
    Invalid(String),

    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("catalog error: {0}")]
    Unknown(String),
}

impl CatalogError {
    /// Whether creating an object failed because it is already there
    pub fn is_already_exists(&self) -> bool {
        matches!(self, CatalogError::AlreadyExists(_) | CatalogError::Conflict(_))
    }

    /// Whether the caller lacks permission or quota for the operation
    pub fn is_denied(&self) -> bool {
        matches!(
            self,
            CatalogError::Forbidden(_)
                | CatalogError::Unauthorized(_)
                | CatalogError::QuotaExceeded(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, CatalogError>;

/// One entry in a tag's history; the head is the current mapping
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEvent {
    pub created: DateTime<Utc>,

    /// Upstream pull spec this event was imported from
    pub docker_image_reference: String,

    /// Manifest digest of the image
    pub image: String,
}

/// Ordered history of one status tag, newest first
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagEventList {
    pub tag: String,

    pub items: Vec<TagEvent>,
}

/// Import policy of a spec tag. Only `insecure == true` is meaningful: a
/// literal `false` cannot be distinguished from the default.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagImportPolicy {
    #[serde(default)]
    pub insecure: bool,
}

/// Spec tag carrying per-tag policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagReference {
    pub name: String,

    #[serde(default)]
    pub import_policy: TagImportPolicy,
}

/// Catalog object mapping tags to upstream references and stored images
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageStream {
    pub namespace: String,

    pub name: String,

    #[serde(default)]
    pub annotations: HashMap<String, String>,

    /// Spec tags with their import policies
    #[serde(default)]
    pub spec_tags: Vec<TagReference>,

    /// Status tag histories
    #[serde(default)]
    pub status_tags: Vec<TagEventList>,
}

impl ImageStream {
    /// The import policy of a spec tag, if the tag is declared
    pub fn tag_reference(&self, tag: &str) -> Option<&TagReference> {
        self.spec_tags.iter().find(|t| t.name == tag)
    }
}

/// Typed control-plane client consumed by the middleware
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch an image stream by namespace and name
    async fn get_image_stream(&self, namespace: &str, name: &str) -> Result<ImageStream>;

    /// Create an image stream; classified `AlreadyExists`/`Conflict` when it
    /// was created concurrently
    async fn create_image_stream(&self, namespace: &str, stream: ImageStream)
        -> Result<ImageStream>;

    /// Fetch an image by its manifest digest
    async fn get_image(&self, digest: &str) -> Result<Image>;

    /// Replace an image object
    async fn update_image(&self, image: Image) -> Result<Image>;
}
