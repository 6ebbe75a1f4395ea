//! Image Manifest Parsing
//!
//! Supports Docker schema 1 (signed and unsigned), Docker schema 2 and OCI
//! image manifests. The wire payload is kept opaque; parsing is only used to
//! discover layer references and the config descriptor.
//!
//! Layer order differs by schema: schema 1 lists layers newest-first
//! (descending), schema 2 and OCI list them base-first (ascending).

use crate::image::{Digest, ImageError};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Media type for Docker schema 1 signed manifests
pub const MEDIA_TYPE_SCHEMA1_SIGNED: &str =
    "application/vnd.docker.distribution.manifest.v1+prettyjws";
/// Media type for Docker schema 1 manifests
pub const MEDIA_TYPE_SCHEMA1: &str = "application/vnd.docker.distribution.manifest.v1+json";
/// Media type for Docker schema 2 manifests
pub const MEDIA_TYPE_SCHEMA2: &str = "application/vnd.docker.distribution.manifest.v2+json";
/// Media type for OCI image manifests
pub const MEDIA_TYPE_OCI: &str = "application/vnd.oci.image.manifest.v1+json";
/// Media type for Docker image config blobs
pub const MEDIA_TYPE_IMAGE_CONFIG: &str = "application/vnd.docker.container.image.v1+json";
/// Media type for gzipped layer tarballs
pub const MEDIA_TYPE_LAYER_GZIP: &str = "application/vnd.docker.image.rootfs.diff.tar.gzip";

/// Accept header value offered to upstream registries
pub fn manifest_accept_header() -> String {
    [
        MEDIA_TYPE_SCHEMA2,
        MEDIA_TYPE_OCI,
        MEDIA_TYPE_SCHEMA1_SIGNED,
        MEDIA_TYPE_SCHEMA1,
    ]
    .join(", ")
}

/// Opaque manifest payload with its media type and canonical digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Manifest {
    /// Wire media type of the payload
    pub media_type: String,

    /// Raw canonical payload bytes
    pub payload: Bytes,

    /// Digest computed over the canonical payload
    pub digest: Digest,
}

impl Manifest {
    /// Build a manifest from its wire payload, computing the canonical digest
    pub fn from_payload(media_type: impl Into<String>, payload: Bytes) -> Self {
        let digest = Digest::from_bytes(&payload);
        Self {
            media_type: media_type.into(),
            payload,
            digest,
        }
    }

    /// Parse the payload into its recognized schema kind
    pub fn parse(&self) -> Result<ManifestKind, ImageError> {
        parse_manifest(&self.payload)
    }
}

/// Content descriptor referring to a blob by digest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Descriptor {
    #[serde(rename = "mediaType")]
    pub media_type: String,

    pub digest: String,

    pub size: u64,
}

/// Docker schema 2 / OCI image manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema2Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    #[serde(rename = "mediaType", skip_serializing_if = "Option::is_none")]
    pub media_type: Option<String>,

    /// Reference to the image configuration blob
    pub config: Descriptor,

    /// Layer descriptors, base layer first
    pub layers: Vec<Descriptor>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub annotations: Option<HashMap<String, String>>,
}

/// One layer reference in a schema 1 manifest
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsLayer {
    #[serde(rename = "blobSum")]
    pub blob_sum: String,
}

/// Docker schema 1 manifest (signatures, if present, are not verified)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema1Manifest {
    #[serde(rename = "schemaVersion")]
    pub schema_version: u32,

    pub name: Option<String>,

    pub tag: Option<String>,

    /// Layer references, newest first
    #[serde(rename = "fsLayers")]
    pub fs_layers: Vec<FsLayer>,
}

/// Recognized manifest kinds
#[derive(Debug, Clone)]
pub enum ManifestKind {
    Schema1(Schema1Manifest),
    Schema2(Schema2Manifest),
}

impl ManifestKind {
    /// Layer digests in the order the schema lists them
    pub fn layer_digests(&self) -> Result<Vec<Digest>, ImageError> {
        match self {
            ManifestKind::Schema1(m) => m
                .fs_layers
                .iter()
                .map(|l| Digest::parse(&l.blob_sum))
                .collect(),
            ManifestKind::Schema2(m) => {
                m.layers.iter().map(|l| Digest::parse(&l.digest)).collect()
            }
        }
    }

    /// Whether the schema lists layers in ascending (base-first) order
    pub fn layers_ascending(&self) -> bool {
        matches!(self, ManifestKind::Schema2(_))
    }

    /// The wire media type implied by the schema
    pub fn media_type(&self) -> &'static str {
        match self {
            ManifestKind::Schema1(_) => MEDIA_TYPE_SCHEMA1_SIGNED,
            ManifestKind::Schema2(_) => MEDIA_TYPE_SCHEMA2,
        }
    }
}

/// Parse a manifest payload into its schema kind
pub fn parse_manifest(data: &[u8]) -> Result<ManifestKind, ImageError> {
    #[derive(Deserialize)]
    struct SchemaProbe {
        #[serde(rename = "schemaVersion")]
        schema_version: u32,
    }

    let probe: SchemaProbe = serde_json::from_slice(data)
        .map_err(|e| ImageError::ManifestParse(format!("unrecognized manifest: {}", e)))?;

    match probe.schema_version {
        1 => {
            let m: Schema1Manifest = serde_json::from_slice(data)?;
            Ok(ManifestKind::Schema1(m))
        }
        2 => {
            let m: Schema2Manifest = serde_json::from_slice(data)?;
            Ok(ManifestKind::Schema2(m))
        }
        v => Err(ImageError::ManifestParse(format!(
            "unsupported manifest schema version {}",
            v
        ))),
    }
}
