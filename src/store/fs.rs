//! Filesystem Content-Addressed Store
//!
//! Stores every payload under its digest, sharded by the first two hex
//! characters for filesystem distribution:
//! `<root>/blobs/sha256/ab/abc123...`. Writes go through a temp file and a
//! rename so a crash never leaves a partially-written object visible.

use crate::image::{Descriptor, Digest, Manifest};
use crate::store::{BlobWriter, LocalBlobStore, LocalManifestStore, Result, StoreError};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest as _, Sha256};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;

/// Fallback media type for blobs stored without one
const OCTET_STREAM: &str = "application/octet-stream";

/// Content-addressed store rooted at a directory
pub struct FsStore {
    base_path: PathBuf,
    staging_seq: AtomicU64,
}

impl FsStore {
    /// Create a store at the given path, creating its directory layout
    pub fn new<P: AsRef<Path>>(base_path: P) -> Result<Self> {
        let base = base_path.as_ref().to_path_buf();
        std::fs::create_dir_all(base.join("blobs"))?;
        std::fs::create_dir_all(base.join("manifests"))?;
        std::fs::create_dir_all(base.join("staging"))?;
        Ok(Self {
            base_path: base,
            staging_seq: AtomicU64::new(0),
        })
    }

    fn sharded(&self, kind: &str, digest: &Digest) -> PathBuf {
        let hex = digest.hex();
        let prefix = &hex[..2.min(hex.len())];
        self.base_path
            .join(kind)
            .join(digest.algorithm())
            .join(prefix)
            .join(hex)
    }

    fn blob_path(&self, digest: &Digest) -> PathBuf {
        self.sharded("blobs", digest)
    }

    fn manifest_path(&self, digest: &Digest) -> PathBuf {
        self.sharded("manifests", digest)
    }

    async fn write_atomic(&self, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalManifestStore for FsStore {
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
        let path = self.manifest_path(digest);
        let payload = match tokio::fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::ManifestUnknown(digest.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let media_type = tokio::fs::read_to_string(path.with_extension("mediatype"))
            .await
            .unwrap_or_else(|_| crate::image::MEDIA_TYPE_SCHEMA2.to_string());

        let manifest = Manifest::from_payload(media_type.trim(), Bytes::from(payload));
        if &manifest.digest != digest {
            return Err(StoreError::ContentVerification {
                expected: digest.to_string(),
                actual: manifest.digest.to_string(),
            });
        }
        Ok(manifest)
    }

    async fn put_manifest(&self, manifest: &Manifest) -> Result<()> {
        let path = self.manifest_path(&manifest.digest);
        self.write_atomic(&path, &manifest.payload).await?;
        self.write_atomic(
            &path.with_extension("mediatype"),
            manifest.media_type.as_bytes(),
        )
        .await
    }

    async fn manifest_exists(&self, digest: &Digest) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.manifest_path(digest)).await?)
    }

    async fn delete_manifest(&self, digest: &Digest) -> Result<()> {
        let path = self.manifest_path(digest);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                let _ = tokio::fs::remove_file(path.with_extension("mediatype")).await;
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::ManifestUnknown(digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl LocalBlobStore for FsStore {
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
        match tokio::fs::metadata(self.blob_path(digest)).await {
            Ok(meta) => Ok(Descriptor {
                media_type: OCTET_STREAM.to_string(),
                digest: digest.to_string(),
                size: meta.len(),
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::BlobUnknown(digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn get_blob(&self, digest: &Digest) -> Result<Bytes> {
        let data = match tokio::fs::read(self.blob_path(digest)).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::BlobUnknown(digest.clone()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = Digest::from_bytes(&data);
        if &actual != digest {
            return Err(StoreError::ContentVerification {
                expected: digest.to_string(),
                actual: actual.to_string(),
            });
        }
        Ok(Bytes::from(data))
    }

    async fn put_blob(&self, media_type: &str, data: Bytes) -> Result<Descriptor> {
        let digest = Digest::from_bytes(&data);
        let path = self.blob_path(&digest);
        if !tokio::fs::try_exists(&path).await? {
            self.write_atomic(&path, &data).await?;
        }
        Ok(Descriptor {
            media_type: media_type.to_string(),
            digest: digest.to_string(),
            size: data.len() as u64,
        })
    }

    async fn delete_blob(&self, digest: &Digest) -> Result<()> {
        match tokio::fs::remove_file(self.blob_path(digest)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::BlobUnknown(digest.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn blob_writer(&self) -> Result<Box<dyn BlobWriter>> {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let temp_path = self
            .base_path
            .join("staging")
            .join(format!("upload-{}-{}", std::process::id(), seq));
        let file = tokio::fs::File::create(&temp_path).await?;
        Ok(Box::new(FsBlobWriter {
            base_path: self.base_path.clone(),
            temp_path,
            file: Some(file),
            hasher: Sha256::new(),
            written: 0,
        }))
    }
}

struct FsBlobWriter {
    base_path: PathBuf,
    temp_path: PathBuf,
    file: Option<tokio::fs::File>,
    hasher: Sha256,
    written: u64,
}

#[async_trait]
impl BlobWriter for FsBlobWriter {
    async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| std::io::Error::other("writer already finished"))?;
        file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    async fn commit(mut self: Box<Self>, expected: &Digest) -> Result<Descriptor> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| std::io::Error::other("writer already finished"))?;
        file.flush().await?;
        drop(file);

        let actual = Digest::parse(&format!(
            "sha256:{:x}",
            std::mem::take(&mut self.hasher).finalize()
        ))
        .map_err(|_| std::io::Error::other("digest construction failed"))?;

        if &actual != expected {
            let _ = tokio::fs::remove_file(&self.temp_path).await;
            return Err(StoreError::ContentVerification {
                expected: expected.to_string(),
                actual: actual.to_string(),
            });
        }

        let hex = expected.hex();
        let final_path = self
            .base_path
            .join("blobs")
            .join(expected.algorithm())
            .join(&hex[..2])
            .join(hex);
        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&self.temp_path, &final_path).await?;

        Ok(Descriptor {
            media_type: OCTET_STREAM.to_string(),
            digest: expected.to_string(),
            size: self.written,
        })
    }
}

impl Drop for FsBlobWriter {
    fn drop(&mut self) {
        // An uncommitted staging file must never be promoted.
        if self.file.is_some() {
            let _ = std::fs::remove_file(&self.temp_path);
        }
    }
}
