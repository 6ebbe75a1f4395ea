//! Transport Pool
//!
//! Exactly two process-global HTTP transports are shared by every upstream
//! client: one that verifies TLS and one that skips verification for
//! registries marked insecure. Both keep the default connection pooling.
//! Initialization happens once; failure to build a transport is fatal.

use std::sync::OnceLock;

/// Which of the two shared transports an upstream fetch must use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Platform default transport, TLS verification on
    Secure,
    /// TLS verification off, plain HTTP upstreams permitted
    Insecure,
}

impl TransportKind {
    /// URL scheme spoken over this transport
    pub fn scheme(&self) -> &'static str {
        match self {
            TransportKind::Secure => "https",
            TransportKind::Insecure => "http",
        }
    }
}

struct TransportPool {
    secure: reqwest::Client,
    insecure: reqwest::Client,
}

static TRANSPORTS: OnceLock<TransportPool> = OnceLock::new();

fn pool() -> &'static TransportPool {
    TRANSPORTS.get_or_init(|| {
        let secure = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .build()
            .expect("unable to configure the default transport for pull-through");
        let insecure = reqwest::Client::builder()
            .pool_max_idle_per_host(10)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("unable to configure a transport for importing insecure images");
        TransportPool { secure, insecure }
    })
}

/// The shared client for the given transport kind
pub fn transport_for(kind: TransportKind) -> &'static reqwest::Client {
    match kind {
        TransportKind::Secure => &pool().secure,
        TransportKind::Insecure => &pool().insecure,
    }
}
