//! Private registry resolution.
//!
//! This module owns the registries configuration document and everything
//! derived from it: repository rewrites, mirror endpoint ordering,
//! credential resolution, and per-endpoint transports.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                    PrivateRegistry                        │
//! │                                                           │
//! │  reference ──► rewrite ──► endpoints ──► pull cascade     │
//! │                  │             │             │            │
//! │            rewrites map   mirrors map   transport cache   │
//! │                            configs map  keychain chain    │
//! └──────────────────────────────────────────────────────────┘
//! ```

mod endpoint;
mod keychain;
mod registry;
mod rewrite;
mod transport;

pub use endpoint::Endpoint;
pub use keychain::{
    CompositeKeychain, ConfigKeychain, Credential, FileKeychain, Keychain, Resource,
};
pub use registry::{PrivateRegistry, PullOptions};
pub use transport::TransportFactory;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use gantry_core::error::{GantryError, Result};
use serde::{Deserialize, Serialize};

/// Root registries configuration document.
///
/// Loaded once at startup and held immutable for the process lifetime.
/// Keys of all three maps are host patterns: an exact host, a host:port
/// pair, or the literal `"*"` wildcard.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Registry {
    /// Mirror endpoints and repository rewrites, per registry host.
    #[serde(default)]
    pub mirrors: HashMap<String, Mirror>,

    /// Credentials and TLS settings, per registry or endpoint host.
    #[serde(default)]
    pub configs: HashMap<String, RegistryConfig>,

    /// Basic-auth fallback entries consulted after `configs`.
    #[serde(default)]
    pub auths: HashMap<String, AuthConfig>,
}

/// Alternate endpoints plus repository rewrites for a single registry host.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Mirror {
    /// Ordered registry API roots to try before the default endpoint.
    /// Empty means "use only the default endpoint for this host".
    #[serde(default)]
    pub endpoints: Vec<String>,

    /// Regex pattern → replacement template applied to the repository
    /// portion of a reference. Patterns are evaluated in sorted order.
    #[serde(default)]
    pub rewrites: HashMap<String, String>,
}

/// Per-host credentials and TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Registry credentials, basic or token.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Base64-encoded `username:password`, used when the split fields are absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

/// Per-host TLS settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<PathBuf>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<PathBuf>,

    #[serde(default)]
    pub insecure_skip_verify: bool,
}

impl Registry {
    /// Load a registries configuration document from a YAML file.
    ///
    /// A missing file is not an error; it yields an empty configuration.
    /// A malformed document is fatal.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = match std::fs::read_to_string(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No registries configuration file");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };

        serde_yaml::from_str(&data).map_err(|source| GantryError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Look up the mirror for a registry host: `host:port` first, then
    /// `host`, then nothing. The wildcard entry is only consulted where the
    /// caller asks for it (endpoint resolution, not rewrites).
    pub(crate) fn mirror_for(&self, registry: &str) -> Option<&Mirror> {
        for form in host_lookup_forms(registry) {
            if let Some(mirror) = self.mirrors.get(form.as_str()) {
                return Some(mirror);
            }
        }
        None
    }

    /// Look up the per-host config for a registry or endpoint address,
    /// trying `host:port`, then `host`, then `*`. The first entry wins,
    /// so an empty exact-host entry shadows wildcard settings.
    pub(crate) fn config_for(&self, address: &str) -> Option<&RegistryConfig> {
        for form in host_lookup_forms_wildcard(address) {
            if let Some(config) = self.configs.get(form.as_str()) {
                return Some(config);
            }
        }
        None
    }

    /// Look up credentials for a registry or endpoint address, walking the
    /// same forms as [`Self::config_for`] but skipping entries that carry
    /// no credentials.
    pub(crate) fn auth_for(&self, address: &str) -> Option<&AuthConfig> {
        for form in host_lookup_forms_wildcard(address) {
            if let Some(auth) = self.configs.get(form.as_str()).and_then(|c| c.auth.as_ref()) {
                return Some(auth);
            }
        }
        None
    }
}

/// Lookup forms for a host pattern, most specific first, without wildcard.
pub(crate) fn host_lookup_forms(address: &str) -> Vec<String> {
    let (host, port) = crate::reference::split_host_port(address);
    match port {
        Some(port) => vec![format!("{}:{}", host, port), host.to_string()],
        None => vec![host.to_string()],
    }
}

/// Lookup forms for a host pattern, most specific first, wildcard last.
pub(crate) fn host_lookup_forms_wildcard(address: &str) -> Vec<String> {
    let mut forms = host_lookup_forms(address);
    forms.push("*".to_string());
    forms
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    const SAMPLE: &str = r#"
mirrors:
  docker.io:
    endpoints: ["https://mirror.example.com/v2", "https://index.docker.io/v2"]
    rewrites:
      "^rancher/(.*)": "rancher/prod/$1"
  "*":
    endpoints: ["https://corp-mirror.example.com/v2"]
configs:
  "mirror.example.com":
    auth: {username: u, password: p}
    tls:  {ca_file: /etc/ca.pem, insecure_skip_verify: false}
"#;

    #[test]
    fn test_from_file_missing_is_empty() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::from_file(dir.path().join("registries.yaml")).unwrap();
        assert!(registry.mirrors.is_empty());
        assert!(registry.configs.is_empty());
        assert!(registry.auths.is_empty());
    }

    #[test]
    fn test_from_file_parses_sample() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registries.yaml");
        let mut f = std::fs::File::create(&path).unwrap();
        f.write_all(SAMPLE.as_bytes()).unwrap();

        let registry = Registry::from_file(&path).unwrap();
        assert_eq!(registry.mirrors.len(), 2);
        assert_eq!(
            registry.mirrors["docker.io"].endpoints,
            vec!["https://mirror.example.com/v2", "https://index.docker.io/v2"]
        );
        assert_eq!(
            registry.mirrors["docker.io"].rewrites["^rancher/(.*)"],
            "rancher/prod/$1"
        );
        let config = &registry.configs["mirror.example.com"];
        assert_eq!(config.auth.as_ref().unwrap().username.as_deref(), Some("u"));
        assert_eq!(
            config.tls.as_ref().unwrap().ca_file.as_deref(),
            Some(std::path::Path::new("/etc/ca.pem"))
        );
        assert!(!config.tls.as_ref().unwrap().insecure_skip_verify);
    }

    #[test]
    fn test_from_file_malformed_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registries.yaml");
        std::fs::write(&path, "mirrors: [not, a, map]").unwrap();

        let err = Registry::from_file(&path).unwrap_err();
        assert!(matches!(err, GantryError::ConfigParse { .. }));
    }

    #[test]
    fn test_round_trip_is_equivalent() {
        let registry: Registry = serde_yaml::from_str(SAMPLE).unwrap();
        let serialized = serde_yaml::to_string(&registry).unwrap();
        let reloaded: Registry = serde_yaml::from_str(&serialized).unwrap();
        assert_eq!(registry, reloaded);
    }

    #[test]
    fn test_mirror_lookup_prefers_host_port() {
        let mut registry = Registry::default();
        registry.mirrors.insert(
            "registry.local:5000".to_string(),
            Mirror {
                endpoints: vec!["https://a.example.com/v2".to_string()],
                ..Default::default()
            },
        );
        registry.mirrors.insert(
            "registry.local".to_string(),
            Mirror {
                endpoints: vec!["https://b.example.com/v2".to_string()],
                ..Default::default()
            },
        );

        let mirror = registry.mirror_for("registry.local:5000").unwrap();
        assert_eq!(mirror.endpoints[0], "https://a.example.com/v2");
        let mirror = registry.mirror_for("registry.local").unwrap();
        assert_eq!(mirror.endpoints[0], "https://b.example.com/v2");
    }

    #[test]
    fn test_config_lookup_falls_back_to_wildcard() {
        let mut registry = Registry::default();
        registry.configs.insert(
            "*".to_string(),
            RegistryConfig {
                tls: Some(TlsConfig {
                    insecure_skip_verify: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
        );

        let config = registry.config_for("registry.example.com").unwrap();
        assert!(config.tls.as_ref().unwrap().insecure_skip_verify);
    }
}
