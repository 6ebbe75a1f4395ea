//! Upstream Registry Access
//!
//! Short-lived clients for fetching manifests and blobs from remote
//! registries over the two shared transports.

mod client;
pub mod transport;

pub use client::{
    HttpUpstreamFactory, RemoteBlob, UpstreamClientFactory, UpstreamCredentials,
    UpstreamRepository,
};
pub use transport::{transport_for, TransportKind};

use thiserror::Error;

/// Errors from upstream registry operations
#[derive(Error, Debug)]
pub enum RegistryError {
    /// The upstream does not have the content
    #[error("{0} not found on upstream")]
    NotFound(String),

    /// A TLS-verifying transport was pointed at a plain-HTTP upstream.
    /// Surfaced verbatim so callers and their tests can match the message.
    #[error("server gave HTTP response to HTTPS client")]
    InsecureTransportRejected,

    /// Network-class failure worth retrying against another candidate
    #[error("transient upstream error: {0}")]
    Transient(String),

    /// The upstream answered with an unexpected status
    #[error("upstream returned status {status}: {body}")]
    UpstreamStatus { status: u16, body: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("image error: {0}")]
    Image(#[from] crate::image::ImageError),
}

impl RegistryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RegistryError::NotFound(_))
    }

    /// Whether the next candidate upstream is worth probing
    pub fn is_transient(&self) -> bool {
        matches!(self, RegistryError::Transient(_))
    }
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// Map a transport-level reqwest failure onto the registry error taxonomy.
///
/// A connect failure whose cause chain names TLS while the secure transport
/// was in use means the upstream spoke plain HTTP where HTTPS was required.
pub(crate) fn classify_reqwest_error(err: reqwest::Error, kind: TransportKind) -> RegistryError {
    if kind == TransportKind::Secure && err.is_connect() && is_tls_failure(&err) {
        tracing::debug!("TLS handshake rejected: {}", err);
        return RegistryError::InsecureTransportRejected;
    }
    if err.is_connect() || err.is_timeout() {
        return RegistryError::Transient(err.to_string());
    }
    RegistryError::Http(err)
}

fn is_tls_failure(err: &(dyn std::error::Error + 'static)) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(e) = current {
        let message = e.to_string().to_lowercase();
        if ["tls", "ssl", "handshake", "certificate", "corrupt message", "wrong version", "record"]
            .iter()
            .any(|needle| message.contains(needle))
        {
            return true;
        }
        current = e.source();
    }
    false
}
