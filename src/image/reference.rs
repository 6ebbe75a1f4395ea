//! Image Reference Parsing
//!
//! Parses Docker-style pull specs like:
//! - myproject/myapp
//! - myproject/myapp:v1.0
//! - registry.example.com:5000/myproject/myapp:v1.0
//! - registry.example.com/myproject/myapp@sha256:abc...

use crate::image::{Digest, ImageError};

/// Parsed pull spec
///
/// At most one of `tag`/`id` needs to be set to refer to a unique image.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ImageReference {
    /// Registry host with optional port (e.g. "registry.example.com:5000")
    pub registry: Option<String>,

    /// First path component (project or user)
    pub namespace: String,

    /// Repository name within the namespace
    pub name: String,

    /// Tag, if the pull spec carried one
    pub tag: Option<String>,

    /// Canonical digest, if the pull spec was digest-qualified
    pub id: Option<Digest>,
}

impl ImageReference {
    /// Parse a pull spec `[host[:port]/]namespace/name[:tag][@digest]`
    ///
    /// The first path segment is treated as a registry host when it
    /// contains a `.` or `:` or equals `localhost`.
    pub fn parse(s: &str) -> Result<Self, ImageError> {
        let s = s.trim();

        if s.is_empty() {
            return Err(ImageError::InvalidReference(
                "empty image reference".to_string(),
            ));
        }

        // Split off digest if present
        let (ref_part, id) = match s.split_once('@') {
            Some((r, d)) => (r, Some(Digest::parse(d)?)),
            None => (s, None),
        };

        let segments: Vec<&str> = ref_part.split('/').collect();
        if segments.iter().any(|p| p.is_empty()) {
            return Err(ImageError::InvalidReference(s.to_string()));
        }

        let (registry, path) = match segments.as_slice() {
            [first, rest @ ..] if !rest.is_empty() && looks_like_registry(first) => {
                (Some(first.to_string()), rest.to_vec())
            }
            _ => (None, segments),
        };

        // The remaining path must split into namespace/name
        let (namespace, rest) = match path.as_slice() {
            [ns, name_part] => (ns.to_string(), *name_part),
            _ => {
                return Err(ImageError::InvalidReference(format!(
                    "{}: expected <namespace>/<name>",
                    s
                )))
            }
        };

        // A tag separator in the last segment
        let (name, tag) = match rest.split_once(':') {
            Some((n, t)) if !n.is_empty() && !t.is_empty() => (n.to_string(), Some(t.to_string())),
            Some(_) => return Err(ImageError::InvalidReference(s.to_string())),
            None => (rest.to_string(), None),
        };

        Ok(Self {
            registry,
            namespace,
            name,
            tag,
            id,
        })
    }

    /// The tag to pull, defaulting to "latest" when callers require one
    pub fn tag_or_latest(&self) -> &str {
        self.tag.as_deref().unwrap_or("latest")
    }

    /// The `namespace/name` repository path
    pub fn repository_path(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// The reference to use against the registry API (digest wins over tag)
    pub fn api_reference(&self) -> String {
        match &self.id {
            Some(id) => id.to_string(),
            None => self.tag_or_latest().to_string(),
        }
    }
}

fn looks_like_registry(segment: &str) -> bool {
    segment.contains('.') || segment.contains(':') || segment == "localhost"
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if let Some(registry) = &self.registry {
            write!(f, "{}/", registry)?;
        }
        write!(f, "{}/{}", self.namespace, self.name)?;
        if let Some(tag) = &self.tag {
            write!(f, ":{}", tag)?;
        }
        if let Some(id) = &self.id {
            write!(f, "@{}", id)?;
        }
        Ok(())
    }
}

impl std::str::FromStr for ImageReference {
    type Err = ImageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespace_name() {
        let r = ImageReference::parse("myproject/myapp").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.namespace, "myproject");
        assert_eq!(r.name, "myapp");
        assert_eq!(r.tag, None);
        assert_eq!(r.tag_or_latest(), "latest");
    }

    #[test]
    fn test_with_tag() {
        let r = ImageReference::parse("myproject/myapp:v1.0").unwrap();
        assert_eq!(r.tag.as_deref(), Some("v1.0"));
    }

    #[test]
    fn test_registry_with_port() {
        let r = ImageReference::parse("registry.example.com:5000/myproject/myapp:v1").unwrap();
        assert_eq!(r.registry.as_deref(), Some("registry.example.com:5000"));
        assert_eq!(r.namespace, "myproject");
        assert_eq!(r.name, "myapp");
        assert_eq!(r.tag.as_deref(), Some("v1"));
    }

    #[test]
    fn test_localhost_registry() {
        let r = ImageReference::parse("localhost/ns/app").unwrap();
        assert_eq!(r.registry.as_deref(), Some("localhost"));
        assert_eq!(r.repository_path(), "ns/app");
    }

    #[test]
    fn test_digest_reference() {
        let digest = Digest::from_bytes(b"manifest");
        let spec = format!("registry.example.com/ns/app@{}", digest);
        let r = ImageReference::parse(&spec).unwrap();
        assert_eq!(r.id.as_ref(), Some(&digest));
        assert_eq!(r.api_reference(), digest.to_string());
        assert_eq!(r.to_string(), spec);
    }

    #[test]
    fn test_plain_segment_is_not_registry() {
        let r = ImageReference::parse("user/app").unwrap();
        assert_eq!(r.registry, None);
        assert_eq!(r.namespace, "user");
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(ImageReference::parse("").is_err());
        assert!(ImageReference::parse("justonename").is_err());
        assert!(ImageReference::parse("a//b").is_err());
        assert!(ImageReference::parse("a/b:").is_err());
        assert!(ImageReference::parse("host.example.com/app").is_err());
        assert!(ImageReference::parse("ns/app@sha256:nothex").is_err());
    }

    #[test]
    fn test_display_round_trip() {
        for spec in [
            "myproject/myapp",
            "myproject/myapp:v1.0",
            "registry.example.com:5000/ns/app:latest",
        ] {
            let r = ImageReference::parse(spec).unwrap();
            assert_eq!(r.to_string(), spec);
        }
    }
}
