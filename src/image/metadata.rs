//! Image Metadata Normalization
//!
//! The catalog stores images with their raw manifest payload and a layer
//! list whose order depends on the manifest schema. Normalization brings
//! every image to a canonical shape: layers ascending (base first), the
//! layer-order annotation set, and the total size computed.

use crate::image::{
    parse_manifest, Digest, ImageError, ManifestKind, MEDIA_TYPE_SCHEMA2, MEDIA_TYPE_OCI,
};
use std::collections::{HashMap, HashSet};

/// Stream-level annotation permitting HTTP upstream pull-through for every tag
pub const INSECURE_REPOSITORY_ANNOTATION: &str = "openshift.io/image.insecureRepository";
/// Image annotation indicating the manifest payload is persisted in the local blob store
pub const MANIFEST_BLOB_STORED_ANNOTATION: &str = "image.openshift.io/manifestBlobStored";
/// Image annotation recording the layer order; normalized to "ascending"
pub const LAYERS_ORDER_ANNOTATION: &str = "image.openshift.io/dockerLayersOrder";
/// Image annotation marking images managed by this registry
pub const MANAGED_ANNOTATION: &str = "openshift.io/image.managed";

/// One layer entry of an image
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageLayer {
    /// Layer blob digest
    pub name: Digest,

    /// Compressed layer size in bytes (0 when unknown, e.g. schema 1)
    pub size: u64,

    /// Layer media type
    pub media_type: String,
}

/// Catalog image object
///
/// `name` is the manifest digest. The manifest payload may be empty when it
/// has been offloaded to the local blob store.
#[derive(Debug, Clone, Default)]
pub struct Image {
    pub name: String,

    /// Pull spec of the upstream source this image was imported from
    pub docker_image_reference: String,

    /// Raw manifest payload, possibly empty
    pub docker_image_manifest: String,

    /// Raw image config JSON, empty for schema 1
    pub docker_image_config: String,

    /// Layer entries, ascending after normalization
    pub docker_image_layers: Vec<ImageLayer>,

    pub docker_image_manifest_media_type: String,

    /// Total image size in bytes, computed by normalization
    pub metadata_size: u64,

    pub annotations: HashMap<String, String>,
}

impl Image {
    /// Whether the image's layer list is known to be in ascending order
    fn layers_ascending(&self) -> bool {
        match self.annotations.get(LAYERS_ORDER_ANNOTATION).map(String::as_str) {
            Some("ascending") => true,
            Some(_) => false,
            // No annotation: schema 1 manifests list layers descending.
            None => {
                self.docker_image_manifest_media_type == MEDIA_TYPE_SCHEMA2
                    || self.docker_image_manifest_media_type == MEDIA_TYPE_OCI
            }
        }
    }
}

/// Bring `image` to canonical shape. Idempotent: re-applying leaves the
/// object fixed.
///
/// - fills the layer list from the manifest payload when absent,
/// - reorders layers to ascending and records that in the annotation,
/// - recomputes the total size (config + unique layers for schema 2,
///   plain layer sum otherwise).
pub fn normalize_image(image: &mut Image) -> Result<(), ImageError> {
    let parsed = if image.docker_image_manifest.is_empty() {
        None
    } else {
        Some(parse_manifest(image.docker_image_manifest.as_bytes())?)
    };

    if image.docker_image_layers.is_empty() {
        if let Some(kind) = &parsed {
            image.docker_image_layers = layers_from_manifest(kind)?;
            if image.docker_image_manifest_media_type.is_empty() {
                image.docker_image_manifest_media_type = kind.media_type().to_string();
            }
            // layers_from_manifest returns wire order
            if !kind.layers_ascending() {
                image
                    .annotations
                    .insert(LAYERS_ORDER_ANNOTATION.to_string(), "descending".to_string());
            }
        }
    }

    if !image.layers_ascending() {
        image.docker_image_layers.reverse();
    }
    image
        .annotations
        .insert(LAYERS_ORDER_ANNOTATION.to_string(), "ascending".to_string());

    image.metadata_size = compute_size(image, parsed.as_ref());

    Ok(())
}

fn layers_from_manifest(kind: &ManifestKind) -> Result<Vec<ImageLayer>, ImageError> {
    match kind {
        ManifestKind::Schema1(m) => m
            .fs_layers
            .iter()
            .map(|l| {
                Ok(ImageLayer {
                    name: Digest::parse(&l.blob_sum)?,
                    size: 0,
                    media_type: crate::image::MEDIA_TYPE_LAYER_GZIP.to_string(),
                })
            })
            .collect(),
        ManifestKind::Schema2(m) => m
            .layers
            .iter()
            .map(|l| {
                Ok(ImageLayer {
                    name: Digest::parse(&l.digest)?,
                    size: l.size,
                    media_type: l.media_type.clone(),
                })
            })
            .collect(),
    }
}

fn compute_size(image: &Image, parsed: Option<&ManifestKind>) -> u64 {
    let schema2 = image.docker_image_manifest_media_type == MEDIA_TYPE_SCHEMA2
        || image.docker_image_manifest_media_type == MEDIA_TYPE_OCI;

    if schema2 {
        let config_size = match parsed {
            Some(ManifestKind::Schema2(m)) => m.config.size,
            _ => image.docker_image_config.len() as u64,
        };
        let mut seen = HashSet::new();
        let layer_sum: u64 = image
            .docker_image_layers
            .iter()
            .filter(|l| seen.insert(l.name.clone()))
            .map(|l| l.size)
            .sum();
        config_size + layer_sum
    } else {
        image.docker_image_layers.iter().map(|l| l.size).sum()
    }
}
