//! Image Model
//!
//! Provides the data model the middleware operates on:
//! - Content digests (`alg:hex` identifiers)
//! - Pull spec parsing into registry/namespace/name/tag/id
//! - Manifest payload parsing (Docker schema 1/2, OCI)
//! - Catalog image metadata and its normalization

mod digest;
mod manifest;
mod metadata;
mod reference;

pub use digest::Digest;
pub use manifest::{
    manifest_accept_header, parse_manifest, Descriptor, FsLayer, Manifest, ManifestKind,
    Schema1Manifest, Schema2Manifest, MEDIA_TYPE_IMAGE_CONFIG, MEDIA_TYPE_LAYER_GZIP,
    MEDIA_TYPE_OCI, MEDIA_TYPE_SCHEMA1, MEDIA_TYPE_SCHEMA1_SIGNED, MEDIA_TYPE_SCHEMA2,
};
pub use metadata::{
    normalize_image, Image, ImageLayer, INSECURE_REPOSITORY_ANNOTATION, LAYERS_ORDER_ANNOTATION,
    MANAGED_ANNOTATION, MANIFEST_BLOB_STORED_ANNOTATION,
};
pub use reference::ImageReference;

use thiserror::Error;

/// Errors that can occur while parsing image model objects
#[derive(Error, Debug)]
pub enum ImageError {
    #[error("invalid image reference: {0}")]
    InvalidReference(String),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("manifest parse error: {0}")]
    ManifestParse(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ImageError>;
