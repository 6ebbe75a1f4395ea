//! In-Memory Catalog
//!
//! A thread-safe `CatalogClient` backed by process memory. Used by tests and
//! by embedders that run the middleware without a control plane.

use crate::catalog::{
    CatalogClient, CatalogError, ImageStream, Result, TagEvent, TagEventList, TagReference,
};
use crate::image::Image;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// In-memory catalog of image streams and images
#[derive(Default)]
pub struct MemoryCatalog {
    streams: DashMap<(String, String), ImageStream>,
    images: DashMap<String, Image>,
    image_gets: AtomicUsize,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a stream
    pub fn add_image_stream(&self, stream: ImageStream) {
        self.streams
            .insert((stream.namespace.clone(), stream.name.clone()), stream);
    }

    /// Store an image without tagging it into any stream
    pub fn add_untagged_image(&self, image: Image) {
        self.images.insert(image.name.clone(), image);
    }

    /// Store an image and prepend a tag event for it to `tag` in the stream
    /// `namespace/name`. The stream must already exist.
    pub fn tag_image(&self, image: &Image, namespace: &str, name: &str, tag: &str) {
        self.add_untagged_image(image.clone());

        let mut entry = self
            .streams
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap_or_else(|| panic!("image stream {}/{} not found", namespace, name));

        let event = TagEvent {
            created: Utc::now(),
            docker_image_reference: image.docker_image_reference.clone(),
            image: image.name.clone(),
        };

        match entry.status_tags.iter_mut().find(|t| t.tag == tag) {
            Some(list) => list.items.insert(0, event),
            None => entry.status_tags.push(TagEventList {
                tag: tag.to_string(),
                items: vec![event],
            }),
        }
    }

    /// Declare a spec tag (import policy) on an existing stream
    pub fn set_tag_reference(&self, namespace: &str, name: &str, reference: TagReference) {
        let mut entry = self
            .streams
            .get_mut(&(namespace.to_string(), name.to_string()))
            .unwrap_or_else(|| panic!("image stream {}/{} not found", namespace, name));
        entry.spec_tags.retain(|t| t.name != reference.name);
        entry.spec_tags.push(reference);
    }

    /// Number of `get_image` calls served, for request-cache assertions
    pub fn image_get_count(&self) -> usize {
        self.image_gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CatalogClient for MemoryCatalog {
    async fn get_image_stream(&self, namespace: &str, name: &str) -> Result<ImageStream> {
        self.streams
            .get(&(namespace.to_string(), name.to_string()))
            .map(|s| s.clone())
            .ok_or_else(|| CatalogError::NotFound(format!("imagestream {}/{}", namespace, name)))
    }

    async fn create_image_stream(
        &self,
        namespace: &str,
        mut stream: ImageStream,
    ) -> Result<ImageStream> {
        stream.namespace = namespace.to_string();
        let key = (namespace.to_string(), stream.name.clone());
        if self.streams.contains_key(&key) {
            return Err(CatalogError::AlreadyExists(format!(
                "imagestream {}/{}",
                namespace, stream.name
            )));
        }
        self.streams.insert(key, stream.clone());
        Ok(stream)
    }

    async fn get_image(&self, digest: &str) -> Result<Image> {
        self.image_gets.fetch_add(1, Ordering::SeqCst);
        self.images
            .get(digest)
            .map(|i| i.clone())
            .ok_or_else(|| CatalogError::NotFound(format!("image {}", digest)))
    }

    async fn update_image(&self, image: Image) -> Result<Image> {
        if !self.images.contains_key(&image.name) {
            return Err(CatalogError::NotFound(format!("image {}", image.name)));
        }
        self.images.insert(image.name.clone(), image.clone());
        Ok(image)
    }
}
