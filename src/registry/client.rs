//! Upstream Registry Client
//!
//! Implements the consumed slice of the Docker registry v2 API:
//! - GET /v2/<name>/manifests/<digest> with schema 1/2 Accept headers
//! - HEAD /v2/<name>/blobs/<digest> for Stat
//! - GET /v2/<name>/blobs/<digest> for streaming reads
//!
//! Clients are created on demand and are cheap: the underlying transports
//! are shared process-wide (see `transport`).

use crate::image::{manifest_accept_header, Descriptor, Digest, Manifest};
use crate::registry::{classify_reqwest_error, RegistryError, Result};
use crate::registry::transport::{transport_for, TransportKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::{ACCEPT, CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::Arc;

/// Fallback media type when an upstream response carries none
const OCTET_STREAM: &str = "application/octet-stream";

/// A blob opened on an upstream registry
pub struct RemoteBlob {
    pub descriptor: Descriptor,

    /// Body chunks; errors unwind the transfer
    pub stream: BoxStream<'static, std::io::Result<Bytes>>,
}

/// One upstream repository, scoped to a host, repository path and transport
#[async_trait]
pub trait UpstreamRepository: Send + Sync {
    /// Fetch a manifest by digest
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest>;

    /// Probe for a blob without transferring it
    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor>;

    /// Open a blob for streaming
    async fn open_blob(&self, digest: &Digest) -> Result<RemoteBlob>;
}

/// Creates upstream repository clients. The production factory speaks HTTP
/// over the shared transports; tests substitute recording fakes.
pub trait UpstreamClientFactory: Send + Sync {
    fn repository(
        &self,
        host: &str,
        repository: &str,
        kind: TransportKind,
    ) -> Arc<dyn UpstreamRepository>;
}

/// Basic credentials scoped per upstream host
#[derive(Debug, Clone, Default)]
pub struct UpstreamCredentials {
    logins: HashMap<String, (String, String)>,
}

impl UpstreamCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a username and password for a particular upstream host
    pub fn login(&mut self, host: impl Into<String>, username: String, password: String) {
        self.logins.insert(host.into(), (username, password));
    }

    fn lookup(&self, host: &str) -> Option<&(String, String)> {
        self.logins.get(host)
    }
}

/// Production factory building reqwest-backed upstream clients
#[derive(Default)]
pub struct HttpUpstreamFactory {
    credentials: UpstreamCredentials,
}

impl HttpUpstreamFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_credentials(credentials: UpstreamCredentials) -> Self {
        Self { credentials }
    }
}

impl UpstreamClientFactory for HttpUpstreamFactory {
    fn repository(
        &self,
        host: &str,
        repository: &str,
        kind: TransportKind,
    ) -> Arc<dyn UpstreamRepository> {
        Arc::new(HttpUpstreamRepository {
            base_url: format!("{}://{}/v2/{}", kind.scheme(), host, repository),
            kind,
            credentials: self.credentials.lookup(host).cloned(),
        })
    }
}

struct HttpUpstreamRepository {
    base_url: String,
    kind: TransportKind,
    credentials: Option<(String, String)>,
}

impl HttpUpstreamRepository {
    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        let mut req = transport_for(self.kind).request(method, url);
        if let Some((user, pass)) = &self.credentials {
            req = req.basic_auth(user, Some(pass));
        }
        req
    }

    async fn send(&self, req: reqwest::RequestBuilder, what: &str) -> Result<reqwest::Response> {
        let response = req
            .send()
            .await
            .map_err(|e| classify_reqwest_error(e, self.kind))?;

        match response.status() {
            StatusCode::NOT_FOUND => Err(RegistryError::NotFound(what.to_string())),
            status if status.is_success() => Ok(response),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(RegistryError::UpstreamStatus {
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    fn blob_descriptor(response: &reqwest::Response, digest: &Digest) -> Descriptor {
        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(OCTET_STREAM)
            .to_string();
        let size = response
            .headers()
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        Descriptor {
            media_type,
            digest: digest.to_string(),
            size,
        }
    }
}

#[async_trait]
impl UpstreamRepository for HttpUpstreamRepository {
    async fn get_manifest(&self, digest: &Digest) -> Result<Manifest> {
        let url = format!("{}/manifests/{}", self.base_url, digest);
        tracing::debug!("fetching upstream manifest {}", url);

        let response = self
            .send(
                self.request(reqwest::Method::GET, &url)
                    .header(ACCEPT, manifest_accept_header()),
                &format!("manifest {}", digest),
            )
            .await?;

        let media_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(crate::image::MEDIA_TYPE_SCHEMA1_SIGNED)
            .to_string();

        let payload = response
            .bytes()
            .await
            .map_err(|e| classify_reqwest_error(e, self.kind))?;

        Ok(Manifest::from_payload(media_type, payload))
    }

    async fn stat_blob(&self, digest: &Digest) -> Result<Descriptor> {
        let url = format!("{}/blobs/{}", self.base_url, digest);

        let response = self
            .send(
                self.request(reqwest::Method::HEAD, &url),
                &format!("blob {}", digest),
            )
            .await?;

        Ok(Self::blob_descriptor(&response, digest))
    }

    async fn open_blob(&self, digest: &Digest) -> Result<RemoteBlob> {
        let url = format!("{}/blobs/{}", self.base_url, digest);
        tracing::debug!("opening upstream blob {}", url);

        let response = self
            .send(
                self.request(reqwest::Method::GET, &url),
                &format!("blob {}", digest),
            )
            .await?;

        let descriptor = Self::blob_descriptor(&response, digest);
        let stream = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(RemoteBlob { descriptor, stream })
    }
}
