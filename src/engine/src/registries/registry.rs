//! Registry façade.
//!
//! Owns the immutable registries configuration and the caches derived
//! from it, and drives the pull cascade: rewrite the reference, resolve
//! the endpoint list, then try each endpoint in order until one yields an
//! image. Transient failures move on to the next endpoint; a credential
//! rejection stops the cascade so credentials are never replayed against
//! the remaining mirrors.

use std::path::Path;
use std::time::Duration;

use gantry_core::error::{GantryError, Result};
use oci_distribution::errors::OciDistributionError;
use oci_distribution::manifest;
use oci_distribution::secrets::RegistryAuth;
use oci_distribution::Reference;
use tokio_util::sync::CancellationToken;

use super::endpoint::{resolve_endpoints, Endpoint};
use super::keychain::{CompositeKeychain, ConfigKeychain, Keychain, Resource};
use super::rewrite::Rewriter;
use super::transport::TransportFactory;
use super::Registry;
use crate::image::RemoteImage;
use crate::reference::ImageReference;

/// Layer media types the puller accepts.
const ACCEPTED_LAYER_TYPES: &[&str] = &[
    manifest::IMAGE_LAYER_MEDIA_TYPE,
    manifest::IMAGE_LAYER_GZIP_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_TAR_MEDIA_TYPE,
    manifest::IMAGE_DOCKER_LAYER_GZIP_MEDIA_TYPE,
];

/// Options governing a single pull.
#[derive(Debug, Clone)]
pub struct PullOptions {
    /// Target architecture used to select from multi-platform images.
    pub architecture: String,
    /// Target operating system used to select from multi-platform images.
    pub os: String,
    /// Per-request deadline for HTTP exchanges.
    pub timeout: Duration,
    /// Cooperative cancellation signal, checked between requests and at
    /// tar entry boundaries during extraction.
    pub cancel: CancellationToken,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            architecture: default_architecture().to_string(),
            os: std::env::consts::OS.to_string(),
            timeout: Duration::from_secs(30),
            cancel: CancellationToken::new(),
        }
    }
}

/// The host architecture in image-platform vocabulary.
fn default_architecture() -> &'static str {
    match std::env::consts::ARCH {
        "x86_64" => "amd64",
        "aarch64" => "arm64",
        arch => arch,
    }
}

/// Pulls images through the endpoints and credentials described by a
/// registries configuration document.
pub struct PrivateRegistry {
    registry: Registry,
    keychain: CompositeKeychain,
    transports: TransportFactory,
    rewriter: Rewriter,
}

impl PrivateRegistry {
    /// Load the registries configuration from a YAML file. A missing file
    /// yields a registry that only knows default endpoints.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Registry::from_file(path)?))
    }

    /// Build a registry façade over an already-loaded configuration.
    pub fn new(registry: Registry) -> Self {
        let keychain = CompositeKeychain::new(vec![Box::new(ConfigKeychain::new(&registry))]);
        Self {
            registry,
            keychain,
            transports: TransportFactory::new(),
            rewriter: Rewriter::default(),
        }
    }

    /// Install a fallback keychain consulted when neither the endpoint nor
    /// the configuration provides credentials (e.g. a docker-config file
    /// keychain or an external credential provider).
    pub fn with_default_keychain(mut self, delegate: Box<dyn Keychain>) -> Self {
        self.keychain = CompositeKeychain::new(vec![
            Box::new(ConfigKeychain::new(&self.registry)),
            delegate,
        ]);
        self
    }

    /// The loaded configuration document.
    pub fn config(&self) -> &Registry {
        &self.registry
    }

    /// Apply the configured repository rewrites to a reference.
    pub fn rewrite(&self, reference: &ImageReference) -> ImageReference {
        self.rewriter.rewrite(&self.registry, reference)
    }

    /// The ordered endpoint list for a reference, ending with the default
    /// endpoint for its registry.
    pub fn endpoints(&self, reference: &ImageReference) -> Result<Vec<Endpoint>> {
        resolve_endpoints(&self.registry, reference)
    }

    /// Pull an image, trying each resolved endpoint in order.
    pub async fn image(
        &self,
        reference: &ImageReference,
        options: &PullOptions,
    ) -> Result<RemoteImage> {
        let rewritten = self.rewrite(reference);
        let endpoints = self.endpoints(reference)?;
        let mut last_failure: Option<(String, OciDistributionError)> = None;

        for endpoint in &endpoints {
            if options.cancel.is_cancelled() {
                return Err(GantryError::Canceled);
            }

            let client = self.transports.client_for(endpoint, options)?;
            let auth = self.authenticator(endpoint, &rewritten.repository);
            let offered = !matches!(auth, RegistryAuth::Anonymous);
            let target = endpoint_reference(endpoint, &rewritten);

            tracing::debug!(
                reference = %rewritten,
                endpoint = %endpoint.url(),
                "Trying registry endpoint"
            );

            match client
                .pull(&target, &auth, ACCEPTED_LAYER_TYPES.to_vec())
                .await
            {
                Ok(data) => {
                    tracing::info!(
                        reference = %rewritten,
                        endpoint = %endpoint.url(),
                        layers = data.layers.len(),
                        "Pulled image"
                    );
                    return Ok(RemoteImage::new(rewritten, data));
                }
                Err(err) if offered && is_auth_failure(&err) => {
                    tracing::warn!(
                        endpoint = %endpoint.url(),
                        "Registry rejected the offered credentials"
                    );
                    return Err(GantryError::AuthFailure {
                        endpoint: endpoint.url().to_string(),
                    });
                }
                Err(err) => {
                    tracing::warn!(
                        endpoint = %endpoint.url(),
                        error = %err,
                        "Endpoint failed, trying next"
                    );
                    last_failure = Some((endpoint.url().to_string(), err));
                }
            }
        }

        match last_failure {
            Some((endpoint, source)) => Err(GantryError::EndpointFailure {
                reference: rewritten.name(),
                endpoint,
                source,
            }),
            // The endpoint list always ends with the default endpoint, so
            // the loop ran at least once.
            None => Err(GantryError::Other(format!(
                "no endpoints resolved for {}",
                rewritten.name()
            ))),
        }
    }

    /// Resolve the credential to offer an endpoint: endpoint-level
    /// configuration first, then the keychain chain, then anonymous.
    fn authenticator(&self, endpoint: &Endpoint, repository: &str) -> RegistryAuth {
        if let Some(auth) = &endpoint.auth {
            match auth.credential() {
                Ok(Some(credential)) => return credential.to_registry_auth(),
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(
                        endpoint = %endpoint.url(),
                        error = %e,
                        "Ignoring unusable endpoint credentials"
                    );
                }
            }
        }

        let resource = Resource {
            registry: endpoint.registry_host().to_string(),
            repository: repository.to_string(),
        };
        self.keychain
            .resolve(&resource)
            .map(|credential| credential.to_registry_auth())
            .unwrap_or(RegistryAuth::Anonymous)
    }
}

/// Address the rewritten reference at a specific endpoint.
fn endpoint_reference(endpoint: &Endpoint, reference: &ImageReference) -> Reference {
    let registry = endpoint.host_port();
    let repository = reference.repository.clone();
    match (&reference.digest, &reference.tag) {
        (Some(digest), _) => Reference::with_digest(registry, repository, digest.clone()),
        (None, Some(tag)) => Reference::with_tag(registry, repository, tag.clone()),
        (None, None) => Reference::with_tag(registry, repository, "latest".to_string()),
    }
}

/// Whether a registry client failure means the credentials were rejected.
fn is_auth_failure(err: &OciDistributionError) -> bool {
    matches!(
        err,
        OciDistributionError::UnauthorizedError { .. }
            | OciDistributionError::AuthenticationFailure(_)
    )
}
