//! Image Stream Resolution
//!
//! Maps a digest to the upstream reference that imported it and decides the
//! transport policy for pull-through. The stream itself is fetched at most
//! once per request: the first successful `get` is the view every later
//! operation sees.

use crate::catalog::{CatalogClient, CatalogError, ImageStream, TagEvent};
use crate::image::INSECURE_REPOSITORY_ANNOTATION;
use crate::server::{Error, RequestContext, Result};
use std::sync::Arc;
use tokio::sync::Mutex;

/// The tag event a digest resolved to, with the tag it was found under
#[derive(Debug, Clone)]
pub struct ResolvedTag {
    pub tag: String,
    pub event: TagEvent,
}

/// Request-scoped handle to one repository's image stream
pub struct ImageStreamHandle {
    namespace: String,
    name: String,
    catalog: Arc<dyn CatalogClient>,
    cached: Mutex<Option<ImageStream>>,
}

impl ImageStreamHandle {
    pub fn new(namespace: &str, name: &str, catalog: Arc<dyn CatalogClient>) -> Self {
        Self {
            namespace: namespace.to_string(),
            name: name.to_string(),
            catalog,
            cached: Mutex::new(None),
        }
    }

    /// Fetch the stream, memoizing the first successful result for the
    /// lifetime of the request
    pub async fn get(&self) -> std::result::Result<ImageStream, CatalogError> {
        let mut cached = self.cached.lock().await;
        if let Some(stream) = &*cached {
            return Ok(stream.clone());
        }
        let stream = self
            .catalog
            .get_image_stream(&self.namespace, &self.name)
            .await?;
        *cached = Some(stream.clone());
        Ok(stream)
    }

    /// Fetch the stream, creating it with the requesting user's credentials
    /// when it does not exist. Two concurrent creators converge on the same
    /// stream: the loser of the race re-reads what the winner created.
    pub async fn get_or_create(&self, ctx: &RequestContext) -> Result<ImageStream> {
        match self.get().await {
            Ok(stream) => return Ok(stream),
            Err(CatalogError::NotFound(_)) => {}
            Err(e) => return Err(Error::from_catalog(e)),
        }

        let user_client = ctx.user_client().ok_or_else(|| {
            Error::Unknown(
                "cannot auto provision image stream: user client to the catalog unavailable"
                    .to_string(),
            )
        })?;

        let stream = ImageStream {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
            ..Default::default()
        };

        match user_client
            .create_image_stream(&self.namespace, stream)
            .await
        {
            Ok(created) => {
                let mut cached = self.cached.lock().await;
                *cached = Some(created.clone());
                Ok(created)
            }
            Err(e) if e.is_already_exists() => {
                tracing::info!(
                    "conflict while creating image stream {}/{}: {}",
                    self.namespace,
                    self.name,
                    e
                );
                self.get().await.map_err(Error::from_catalog)
            }
            Err(e) if e.is_denied() => {
                tracing::error!("denied creating image stream: {}", e);
                Err(Error::Denied(e.to_string()))
            }
            Err(e) => {
                tracing::error!(
                    "error auto provisioning image stream {}/{}: {}",
                    self.namespace,
                    self.name,
                    e
                );
                Err(Error::Unknown(e.to_string()))
            }
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Resolve an image ID against a stream's status tags.
///
/// `id` may be a full `alg:hex` digest or a bare hex prefix. Every tag
/// history is scanned; when several events reference the same image the
/// most recently created one wins (earlier position on equal timestamps).
/// A prefix matching more than one distinct image is a conflict.
pub fn resolve_image_id(stream: &ImageStream, id: &str) -> Result<ResolvedTag> {
    let mut best: Option<ResolvedTag> = None;
    let mut matched_image: Option<&str> = None;

    for tag_list in &stream.status_tags {
        for event in &tag_list.items {
            if !event_matches(event, id) {
                continue;
            }

            match matched_image {
                Some(image) if image != event.image => {
                    return Err(Error::Conflict(format!(
                        "multiple images match the prefix {}",
                        id
                    )));
                }
                _ => matched_image = Some(&event.image),
            }

            let newer = match &best {
                Some(current) => event.created > current.event.created,
                None => true,
            };
            if newer {
                best = Some(ResolvedTag {
                    tag: tag_list.tag.clone(),
                    event: event.clone(),
                });
            }
        }
    }

    best.ok_or_else(|| {
        Error::NotFound(format!(
            "image {} in image stream {}/{}",
            id, stream.namespace, stream.name
        ))
    })
}

fn event_matches(event: &TagEvent, id: &str) -> bool {
    if event.image == id {
        return true;
    }
    if id.contains(':') {
        return false;
    }
    event
        .image
        .split_once(':')
        .map(|(_, hex)| hex.starts_with(id))
        .unwrap_or(false)
}

/// Whether pull-through for the resolved tag may use the insecure
/// transport. The stream-level annotation wins over everything; a tag-level
/// `insecure: false` cannot downgrade it because a literal false is
/// indistinguishable from the default.
pub fn pullthrough_insecure(stream: &ImageStream, tag: Option<&str>) -> bool {
    if stream
        .annotations
        .get(INSECURE_REPOSITORY_ANNOTATION)
        .map(String::as_str)
        == Some("true")
    {
        return true;
    }
    match tag {
        Some(tag) => stream
            .tag_reference(tag)
            .map(|t| t.import_policy.insecure)
            .unwrap_or(false),
        None => false,
    }
}
