//! Content Digest Identifiers
//!
//! A digest is the primary key for manifests and blobs: an algorithm
//! prefix followed by a lowercase hex hash, e.g.
//! `sha256:77af778b51abd4a3c51c5ddd97204a9c3ae614ebccb75a606c3b6865aed6744e`.

use crate::image::ImageError;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::fmt;
use std::str::FromStr;

/// Content-addressed identifier with an algorithm prefix and a hex digest.
///
/// Equality is string equality; digests are immutable once created.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    /// Parse and validate an `alg:hex` digest string
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let (alg, hex) = s
            .split_once(':')
            .ok_or_else(|| ImageError::InvalidDigest(s.to_string()))?;

        let alg_ok = !alg.is_empty()
            && alg
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_+.".contains(c));
        let hex_ok = hex.len() >= 32
            && hex
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c));

        if !alg_ok || !hex_ok {
            return Err(ImageError::InvalidDigest(s.to_string()));
        }

        Ok(Digest(s.to_string()))
    }

    /// Compute the sha256 digest of raw content
    pub fn from_bytes(data: &[u8]) -> Self {
        Digest(format!("sha256:{:x}", Sha256::digest(data)))
    }

    /// The full `alg:hex` string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The algorithm portion (e.g. "sha256")
    pub fn algorithm(&self) -> &str {
        self.0.split_once(':').map(|(a, _)| a).unwrap_or("")
    }

    /// The hex portion
    pub fn hex(&self) -> &str {
        self.0.split_once(':').map(|(_, h)| h).unwrap_or("")
    }

    /// Whether `prefix` matches this digest, either as the full `alg:hex`
    /// form or as a bare hex prefix. Used by the image stream resolver to
    /// match abbreviated image IDs.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        if prefix.contains(':') {
            self.0 == prefix
        } else {
            self.hex().starts_with(prefix)
        }
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Digest {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
