//! Remote Blob Getter
//!
//! Given a digest, finds the upstream repositories that might hold it —
//! every reference in the request's image stream, then anything the
//! process-wide digest cache remembers — and probes them in order. The
//! first success wins and is recorded. Upstream clients are memoized per
//! request so repeated probes against one host reuse the handshake.

use crate::image::{Descriptor, Digest, ImageReference};
use crate::registry::{
    RegistryError, RemoteBlob, TransportKind, UpstreamClientFactory, UpstreamRepository,
};
use crate::server::{
    pullthrough_insecure, DigestRepositoryCache, Error, ImageStreamHandle, RequestContext, Result,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

/// One upstream repository that may hold a digest
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    host: String,
    path: String,
    kind: TransportKind,
}

impl Candidate {
    /// Identifier recorded in the digest cache on a successful probe
    fn identifier(&self) -> String {
        format!("{}/{}", self.host, self.path)
    }
}

/// Probes candidate upstream repositories for blobs
pub struct RemoteBlobGetter {
    stream: Arc<ImageStreamHandle>,
    upstream: Arc<dyn UpstreamClientFactory>,
    digest_cache: Arc<DigestRepositoryCache>,

    // Upstream clients opened by this request, keyed by host and transport.
    clients: Mutex<HashMap<(String, String, TransportKind), Arc<dyn UpstreamRepository>>>,
}

impl RemoteBlobGetter {
    pub fn new(
        stream: Arc<ImageStreamHandle>,
        upstream: Arc<dyn UpstreamClientFactory>,
        digest_cache: Arc<DigestRepositoryCache>,
    ) -> Self {
        Self {
            stream,
            upstream,
            digest_cache,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Candidate repositories for `digest`: the stream's references in
    /// status-tag order, then cached associations
    async fn candidates(&self, digest: &Digest) -> Result<Vec<Candidate>> {
        let stream = self.stream.get().await.map_err(|e| {
            tracing::debug!(
                "no image stream {}/{} for remote blob lookup: {}",
                self.stream.namespace(),
                self.stream.name(),
                e
            );
            Error::BlobUnknown(digest.clone())
        })?;

        let mut candidates: Vec<Candidate> = Vec::new();
        let mut push_unique = |candidate: Candidate, out: &mut Vec<Candidate>| {
            if !out.contains(&candidate) {
                out.push(candidate);
            }
        };

        for tag_list in &stream.status_tags {
            let kind = if pullthrough_insecure(&stream, Some(&tag_list.tag)) {
                TransportKind::Insecure
            } else {
                TransportKind::Secure
            };
            for event in &tag_list.items {
                let Ok(reference) = ImageReference::parse(&event.docker_image_reference) else {
                    continue;
                };
                let Some(host) = reference.registry.clone() else {
                    continue;
                };
                push_unique(
                    Candidate {
                        host,
                        path: reference.repository_path(),
                        kind,
                    },
                    &mut candidates,
                );
            }
        }

        let cached_kind = if pullthrough_insecure(&stream, None) {
            TransportKind::Insecure
        } else {
            TransportKind::Secure
        };
        for name in self.digest_cache.repositories(digest) {
            let Ok(reference) = ImageReference::parse(&name) else {
                continue;
            };
            // Local repository names have no host and cannot be probed.
            let Some(host) = reference.registry.clone() else {
                continue;
            };
            push_unique(
                Candidate {
                    host,
                    path: reference.repository_path(),
                    kind: cached_kind,
                },
                &mut candidates,
            );
        }

        Ok(candidates)
    }

    async fn client_for(&self, candidate: &Candidate) -> Arc<dyn UpstreamRepository> {
        let key = (
            candidate.host.clone(),
            candidate.path.clone(),
            candidate.kind,
        );
        let mut clients = self.clients.lock().await;
        clients
            .entry(key)
            .or_insert_with(|| {
                self.upstream
                    .repository(&candidate.host, &candidate.path, candidate.kind)
            })
            .clone()
    }

    /// Probe candidates for `digest` and describe the first hit
    pub async fn stat(&self, ctx: &RequestContext, digest: &Digest) -> Result<Descriptor> {
        self.probe(ctx, digest, |client, digest| async move {
            client.stat_blob(&digest).await
        })
        .await
    }

    /// Probe candidates for `digest` and open the first hit for streaming
    pub async fn open(&self, ctx: &RequestContext, digest: &Digest) -> Result<RemoteBlob> {
        self.probe(ctx, digest, |client, digest| async move {
            client.open_blob(&digest).await
        })
        .await
    }

    async fn probe<T, F, Fut>(&self, ctx: &RequestContext, digest: &Digest, op: F) -> Result<T>
    where
        F: Fn(Arc<dyn UpstreamRepository>, Digest) -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, RegistryError>>,
    {
        let candidates = self.candidates(digest).await?;
        let mut last_error: Option<RegistryError> = None;

        for candidate in candidates {
            ctx.check_cancelled()?;

            let client = self.client_for(&candidate).await;
            match op(client, digest.clone()).await {
                Ok(found) => {
                    self.digest_cache.add_digest(digest, &candidate.identifier());
                    return Ok(found);
                }
                Err(e) if e.is_not_found() => {
                    tracing::debug!("blob {} not on {}", digest, candidate.identifier());
                    continue;
                }
                Err(e) if e.is_transient() => {
                    tracing::warn!(
                        "transient error probing {} for {}: {}",
                        candidate.identifier(),
                        digest,
                        e
                    );
                    last_error = Some(e);
                    continue;
                }
                // Permanent failures (policy rejections, protocol errors)
                // short-circuit the probe.
                Err(e) => return Err(Error::Upstream(e)),
            }
        }

        match last_error {
            Some(e) => Err(Error::Upstream(e)),
            None => Err(Error::BlobUnknown(digest.clone())),
        }
    }
}
