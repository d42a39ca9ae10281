//! Image reference parsing.
//!
//! Parses image references like `registry.example.com/team/app:v1.2` into
//! structured components, and canonicalizes Docker Hub aliases when a
//! reference is rendered back to a string.

use gantry_core::error::{GantryError, Result};

/// Default registry when none is specified.
const DEFAULT_REGISTRY: &str = "docker.io";

/// Canonical host for Docker Hub.
const DOCKER_INDEX_HOST: &str = "index.docker.io";

/// Default tag when none is specified.
const DEFAULT_TAG: &str = "latest";

/// Parsed image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    /// Registry hostname, with port if present (e.g., "docker.io", "registry.local:5000")
    pub registry: String,
    /// Repository path (e.g., "library/busybox", "rancher/rancher")
    pub repository: String,
    /// Tag (e.g., "latest", "v2.5.9")
    pub tag: Option<String>,
    /// Digest (e.g., "sha256:82bec...")
    pub digest: Option<String>,
}

impl ImageReference {
    /// Parse an image reference string.
    ///
    /// Supports formats:
    /// - `busybox` → docker.io/library/busybox:latest
    /// - `busybox:1.36` → docker.io/library/busybox:1.36
    /// - `rancher/rancher:v2.5.9` → docker.io/rancher/rancher:v2.5.9
    /// - `registry.local:5000/team/app:v1` → registry.local:5000/team/app:v1
    /// - `busybox@sha256:abc...` → docker.io/library/busybox@sha256:abc...
    pub fn parse(reference: &str) -> Result<Self> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(GantryError::Reference {
                reference: reference.to_string(),
                message: "empty reference".to_string(),
            });
        }

        // Split off digest first (@ separator)
        let (name_tag, digest) = match reference.rfind('@') {
            Some(at_pos) => {
                let digest_part = &reference[at_pos + 1..];
                if !digest_part.contains(':') {
                    return Err(GantryError::Reference {
                        reference: reference.to_string(),
                        message: "digest must be of the form algorithm:hex".to_string(),
                    });
                }
                (&reference[..at_pos], Some(digest_part.to_string()))
            }
            None => (reference, None),
        };

        // Split tag on the last colon after the last slash; a colon before the
        // last slash belongs to a registry port.
        let tag_split_from = name_tag.rfind('/').map(|p| p + 1).unwrap_or(0);
        let (name, tag) = match name_tag[tag_split_from..].rfind(':') {
            Some(colon_pos) => {
                let colon_pos = tag_split_from + colon_pos;
                (
                    &name_tag[..colon_pos],
                    Some(name_tag[colon_pos + 1..].to_string()),
                )
            }
            None => (name_tag, None),
        };

        let (registry, repository) = Self::split_registry_repository(name)?;

        // Apply default tag if no tag and no digest
        let tag = if tag.is_none() && digest.is_none() {
            Some(DEFAULT_TAG.to_string())
        } else {
            tag
        };

        Ok(ImageReference {
            registry,
            repository,
            tag,
            digest,
        })
    }

    /// Split a name into registry and repository components.
    fn split_registry_repository(name: &str) -> Result<(String, String)> {
        // The first component is a registry hostname if it contains a dot or
        // colon, or is "localhost"; otherwise the whole name is a Docker Hub
        // repository.
        if let Some(slash_pos) = name.find('/') {
            let first = &name[..slash_pos];
            if first.contains('.') || first.contains(':') || first == "localhost" {
                let repository = name[slash_pos + 1..].to_string();
                if repository.is_empty() {
                    return Err(GantryError::Reference {
                        reference: name.to_string(),
                        message: "empty repository".to_string(),
                    });
                }
                return Ok((first.to_string(), repository));
            }
        }

        if name.is_empty() {
            return Err(GantryError::Reference {
                reference: name.to_string(),
                message: "empty repository".to_string(),
            });
        }

        // Docker Hub: single-segment names live in the implicit "library" namespace
        let repository = if name.contains('/') {
            name.to_string()
        } else {
            format!("library/{}", name)
        };

        Ok((DEFAULT_REGISTRY.to_string(), repository))
    }

    /// The canonical registry host, resolving Docker Hub aliases to
    /// `index.docker.io`.
    pub fn canonical_registry(&self) -> String {
        canonical_host(&self.registry)
    }

    /// Render the fully-qualified reference with the canonical registry host.
    pub fn name(&self) -> String {
        let mut s = format!("{}/{}", self.canonical_registry(), self.repository);
        if let Some(ref tag) = self.tag {
            s.push(':');
            s.push_str(tag);
        }
        if let Some(ref digest) = self.digest {
            s.push('@');
            s.push_str(digest);
        }
        s
    }

    /// Return a copy of this reference with a different repository,
    /// preserving registry and tag/digest.
    pub fn with_repository(&self, repository: impl Into<String>) -> Self {
        Self {
            registry: self.registry.clone(),
            repository: repository.into(),
            tag: self.tag.clone(),
            digest: self.digest.clone(),
        }
    }

    /// The scheme used to reach this reference's registry when none is
    /// configured: loopback hosts default to http unless on port 443.
    pub fn default_scheme(&self) -> &'static str {
        default_scheme(&self.registry)
    }
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Resolve Docker Hub aliases to the canonical index host.
pub(crate) fn canonical_host(registry: &str) -> String {
    let r = registry.trim().to_lowercase();
    if r == "docker.io" || r == "registry-1.docker.io" {
        DOCKER_INDEX_HOST.to_string()
    } else {
        r
    }
}

/// Split a `host[:port]` string, tolerating bracketed IPv6 literals.
pub(crate) fn split_host_port(host: &str) -> (&str, Option<u16>) {
    if let Some(end) = host.rfind(']') {
        // [::1]:5000 or bare [::1]
        match host[end..].find(':') {
            Some(colon) => {
                let port = host[end + colon + 1..].parse().ok();
                (&host[..=end], port)
            }
            None => (host, None),
        }
    } else {
        match host.rfind(':') {
            Some(colon) => match host[colon + 1..].parse() {
                Ok(port) => (&host[..colon], Some(port)),
                Err(_) => (host, None),
            },
            None => (host, None),
        }
    }
}

/// Whether the host half of a registry address is localhost or a loopback IP.
fn is_loopback_host(host: &str) -> bool {
    if host == "localhost" {
        return true;
    }
    if let Ok(ip) = host.parse::<std::net::Ipv4Addr>() {
        return ip.is_loopback();
    }
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<std::net::Ipv6Addr>()
        .map(|ip| ip.is_loopback())
        .unwrap_or(false)
}

/// The scheme to assume for a registry address that has none configured.
///
/// Loopback addresses with a non-default port get http; everything else,
/// including loopback on port 443, gets https.
pub(crate) fn default_scheme(registry: &str) -> &'static str {
    let (host, port) = split_host_port(registry);
    if is_loopback_host(host) {
        match port {
            Some(443) | None => "https",
            Some(_) => "http",
        }
    } else {
        "https"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_simple_name() {
        let r = ImageReference::parse("busybox").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, Some("latest".to_string()));
        assert_eq!(r.digest, None);
    }

    #[test]
    fn test_parse_name_with_tag() {
        let r = ImageReference::parse("busybox:1.36").unwrap();
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, Some("1.36".to_string()));
    }

    #[test]
    fn test_parse_namespaced_repo() {
        let r = ImageReference::parse("rancher/rancher:v2.5.9").unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "rancher/rancher");
        assert_eq!(r.tag, Some("v2.5.9".to_string()));
    }

    #[test]
    fn test_parse_custom_registry() {
        let r = ImageReference::parse("registry.example.com/busybox").unwrap();
        assert_eq!(r.registry, "registry.example.com");
        assert_eq!(r.repository, "busybox");
        assert_eq!(r.tag, Some("latest".to_string()));
    }

    #[test]
    fn test_parse_registry_with_port() {
        let r = ImageReference::parse("registry.local:5000/team/app:v1").unwrap();
        assert_eq!(r.registry, "registry.local:5000");
        assert_eq!(r.repository, "team/app");
        assert_eq!(r.tag, Some("v1".to_string()));
    }

    #[test]
    fn test_parse_localhost_registry() {
        let r = ImageReference::parse("localhost/myimage:test").unwrap();
        assert_eq!(r.registry, "localhost");
        assert_eq!(r.repository, "myimage");
    }

    #[test]
    fn test_parse_digest_only() {
        let r = ImageReference::parse(
            "busybox@sha256:82becede498899ec668628e7cb0ad87b6e1c371cb8a1e597d83a47fac21d6af3",
        )
        .unwrap();
        assert_eq!(r.registry, "docker.io");
        assert_eq!(r.repository, "library/busybox");
        assert_eq!(r.tag, None);
        assert_eq!(
            r.digest,
            Some("sha256:82becede498899ec668628e7cb0ad87b6e1c371cb8a1e597d83a47fac21d6af3".to_string())
        );
    }

    #[test]
    fn test_parse_tag_and_digest() {
        let r = ImageReference::parse("ghcr.io/org/app:v1.0@sha256:abcdef1234567890").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/app");
        assert_eq!(r.tag, Some("v1.0".to_string()));
        assert_eq!(r.digest, Some("sha256:abcdef1234567890".to_string()));
    }

    #[test]
    fn test_parse_empty_reference() {
        assert!(ImageReference::parse("").is_err());
    }

    #[test]
    fn test_parse_invalid_digest() {
        assert!(ImageReference::parse("busybox@invaliddigest").is_err());
    }

    #[test]
    fn test_name_canonicalizes_docker_hub() {
        let r = ImageReference::parse("busybox").unwrap();
        assert_eq!(r.name(), "index.docker.io/library/busybox:latest");
    }

    #[test]
    fn test_name_preserves_other_registries() {
        let r = ImageReference::parse("registry.local/test").unwrap();
        assert_eq!(r.name(), "registry.local/test:latest");
    }

    #[test]
    fn test_name_with_digest() {
        let r = ImageReference::parse(
            "busybox@sha256:82becede498899ec668628e7cb0ad87b6e1c371cb8a1e597d83a47fac21d6af3",
        )
        .unwrap();
        assert_eq!(
            r.name(),
            "index.docker.io/library/busybox@sha256:82becede498899ec668628e7cb0ad87b6e1c371cb8a1e597d83a47fac21d6af3"
        );
    }

    #[test]
    fn test_with_repository() {
        let r = ImageReference::parse("rancher/rancher:v2.5.9").unwrap();
        let rewritten = r.with_repository("rancher/prod/rancher");
        assert_eq!(rewritten.name(), "index.docker.io/rancher/prod/rancher:v2.5.9");
        assert_eq!(rewritten.registry, "docker.io");
    }

    #[test]
    fn test_display() {
        let r = ImageReference::parse("busybox:1.36").unwrap();
        assert_eq!(format!("{}", r), "index.docker.io/library/busybox:1.36");
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("registry.local:5000"), ("registry.local", Some(5000)));
        assert_eq!(split_host_port("registry.local"), ("registry.local", None));
        assert_eq!(split_host_port("[::1]:5000"), ("[::1]", Some(5000)));
        assert_eq!(split_host_port("[::1]"), ("[::1]", None));
    }

    #[test]
    fn test_default_scheme_loopback() {
        assert_eq!(default_scheme("localhost:5000"), "http");
        assert_eq!(default_scheme("localhost:443"), "https");
        assert_eq!(default_scheme("127.0.0.1:5000"), "http");
        assert_eq!(default_scheme("127.0.0.1:443"), "https");
        assert_eq!(default_scheme("[::1]:5000"), "http");
        assert_eq!(default_scheme("registry.example.com"), "https");
        assert_eq!(default_scheme("registry.example.com:5000"), "https");
    }

    #[test]
    fn test_canonical_host_aliases() {
        assert_eq!(canonical_host("docker.io"), "index.docker.io");
        assert_eq!(canonical_host("registry-1.docker.io"), "index.docker.io");
        assert_eq!(canonical_host("index.docker.io"), "index.docker.io");
        assert_eq!(canonical_host("quay.io"), "quay.io");
    }
}
