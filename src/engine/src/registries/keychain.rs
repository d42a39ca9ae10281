//! Credential sources and composition.
//!
//! Several unrelated credential sources can apply to one pull: the
//! registries configuration document, a docker-config style file, or an
//! opaque caller-supplied provider. Each is modeled as a [`Keychain`] that
//! resolves a target resource to a credential (or nothing, meaning
//! anonymous), and a composer tries sources in order. The composer never
//! caches; individual sources may.

use std::collections::HashMap;
use std::path::PathBuf;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use gantry_core::error::{GantryError, Result};
use oci_distribution::secrets::RegistryAuth;
use serde::Deserialize;

use super::{host_lookup_forms_wildcard, AuthConfig, Registry};
use crate::reference::canonical_host;

/// The target a credential is requested for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Registry host, with port if present.
    pub registry: String,
    /// Repository within the registry.
    pub repository: String,
}

/// A resolved registry credential.
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    Basic { username: String, password: String },
    Bearer { token: String },
}

impl Credential {
    pub(crate) fn to_registry_auth(&self) -> RegistryAuth {
        match self {
            Credential::Basic { username, password } => {
                RegistryAuth::Basic(username.clone(), password.clone())
            }
            Credential::Bearer { token } => RegistryAuth::Bearer(token.clone()),
        }
    }
}

// Secrets stay out of logs and error chains.
impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credential::Basic { username, .. } => f
                .debug_struct("Basic")
                .field("username", username)
                .field("password", &"<redacted>")
                .finish(),
            Credential::Bearer { .. } => f
                .debug_struct("Bearer")
                .field("token", &"<redacted>")
                .finish(),
        }
    }
}

impl AuthConfig {
    /// Materialize the configured credential, decoding the combined `auth`
    /// field when the split fields are absent.
    pub fn credential(&self) -> Result<Option<Credential>> {
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            return Ok(Some(Credential::Basic {
                username: username.clone(),
                password: password.clone(),
            }));
        }

        if let Some(auth) = &self.auth {
            let decoded = BASE64
                .decode(auth)
                .map_err(|e| GantryError::ConfigInvalid(format!("invalid auth field: {}", e)))?;
            let decoded = String::from_utf8(decoded)
                .map_err(|e| GantryError::ConfigInvalid(format!("invalid auth field: {}", e)))?;
            let (username, password) = decoded.split_once(':').ok_or_else(|| {
                GantryError::ConfigInvalid("auth field must decode to user:pass".to_string())
            })?;
            return Ok(Some(Credential::Basic {
                username: username.to_string(),
                password: password.to_string(),
            }));
        }

        if let Some(token) = &self.identity_token {
            return Ok(Some(Credential::Bearer {
                token: token.clone(),
            }));
        }

        Ok(None)
    }
}

/// A source of credentials addressable by (host, repository).
pub trait Keychain: Send + Sync {
    /// Resolve a credential for the resource; `None` means anonymous.
    fn resolve(&self, resource: &Resource) -> Option<Credential>;
}

/// Keychain over the registries configuration document: per-host `configs`
/// entries first, then the `auths` basic-auth fallback map, each walked
/// `host:port` → `host` → `*`.
pub struct ConfigKeychain {
    configs: HashMap<String, Option<AuthConfig>>,
    auths: HashMap<String, AuthConfig>,
}

impl ConfigKeychain {
    pub fn new(registry: &Registry) -> Self {
        Self {
            configs: registry
                .configs
                .iter()
                .map(|(host, config)| (host.clone(), config.auth.clone()))
                .collect(),
            auths: registry.auths.clone(),
        }
    }

    fn materialize(auth: &AuthConfig, host: &str) -> Option<Credential> {
        match auth.credential() {
            Ok(credential) => credential,
            Err(e) => {
                tracing::warn!(host = %host, error = %e, "Ignoring unusable credential entry");
                None
            }
        }
    }
}

impl Keychain for ConfigKeychain {
    fn resolve(&self, resource: &Resource) -> Option<Credential> {
        for form in host_lookup_forms_wildcard(&resource.registry) {
            if let Some(Some(auth)) = self.configs.get(form.as_str()) {
                return Self::materialize(auth, &form);
            }
        }
        for form in host_lookup_forms_wildcard(&resource.registry) {
            if let Some(auth) = self.auths.get(form.as_str()) {
                return Self::materialize(auth, &form);
            }
        }
        None
    }
}

/// Tries each source in order; the first credential wins.
pub struct CompositeKeychain {
    sources: Vec<Box<dyn Keychain>>,
}

impl CompositeKeychain {
    pub fn new(sources: Vec<Box<dyn Keychain>>) -> Self {
        Self { sources }
    }
}

impl Keychain for CompositeKeychain {
    fn resolve(&self, resource: &Resource) -> Option<Credential> {
        self.sources.iter().find_map(|s| s.resolve(resource))
    }
}

/// Docker-config style file keychain (`~/.docker/config.json`).
///
/// The file is re-read on every resolution so external logins are picked
/// up without restarting. Entry keys may carry a scheme and path
/// (`https://index.docker.io/v1/`); only the host is matched.
pub struct FileKeychain {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct DockerConfigFile {
    #[serde(default)]
    auths: HashMap<String, DockerAuthEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerAuthEntry {
    username: Option<String>,
    password: Option<String>,
    auth: Option<String>,
    identitytoken: Option<String>,
}

impl FileKeychain {
    /// Create a file keychain at a custom path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a file keychain at the default path (`~/.docker/config.json`).
    pub fn default_path() -> Result<Self> {
        let home = dirs::home_dir().ok_or_else(|| {
            GantryError::Other("Cannot determine home directory for docker config".to_string())
        })?;
        Ok(Self::new(home.join(".docker").join("config.json")))
    }

    fn load(&self) -> Result<DockerConfigFile> {
        if !self.path.exists() {
            return Ok(DockerConfigFile::default());
        }
        let data = std::fs::read_to_string(&self.path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

impl Keychain for FileKeychain {
    fn resolve(&self, resource: &Resource) -> Option<Credential> {
        let file = match self.load() {
            Ok(file) => file,
            Err(e) => {
                tracing::warn!(path = %self.path.display(), error = %e, "Failed to read docker config");
                return None;
            }
        };

        let wanted = canonical_host(&resource.registry);
        for (key, entry) in &file.auths {
            let host = key
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or_default();
            if canonical_host(host) != wanted {
                continue;
            }

            let auth = AuthConfig {
                username: entry.username.clone(),
                password: entry.password.clone(),
                auth: entry.auth.clone(),
                identity_token: entry.identitytoken.clone(),
            };
            match auth.credential() {
                Ok(Some(credential)) => return Some(credential),
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(host = %key, error = %e, "Ignoring unusable docker config entry");
                    continue;
                }
            }
        }
        None
    }
}
