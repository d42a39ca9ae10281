//! Registry client transports.
//!
//! Builds one registry client per (host, TLS profile) and caches it for
//! the process lifetime. The cache is write-once per key under a mutex;
//! clients hold no reference back to the registry that owns the cache.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use gantry_core::error::{GantryError, Result};
use oci_distribution::client::{Certificate, CertificateEncoding, ClientConfig, ClientProtocol};
use oci_distribution::Client;

use super::endpoint::Endpoint;
use super::registry::PullOptions;

/// Everything that shapes a client: the endpoint host and scheme, the TLS
/// profile, the platform the puller selects from index manifests, and the
/// request deadline.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TransportKey {
    host: String,
    scheme: String,
    ca_file: Option<PathBuf>,
    cert_file: Option<PathBuf>,
    key_file: Option<PathBuf>,
    insecure_skip_verify: bool,
    architecture: String,
    os: String,
    timeout: Duration,
}

impl TransportKey {
    fn new(endpoint: &Endpoint, options: &PullOptions) -> Self {
        let tls = endpoint.tls();
        Self {
            host: endpoint.host_port(),
            scheme: endpoint.scheme().to_string(),
            ca_file: tls.and_then(|t| t.ca_file.clone()),
            cert_file: tls.and_then(|t| t.cert_file.clone()),
            key_file: tls.and_then(|t| t.key_file.clone()),
            insecure_skip_verify: tls.map(|t| t.insecure_skip_verify).unwrap_or(false),
            architecture: options.architecture.clone(),
            os: options.os.clone(),
            timeout: options.timeout,
        }
    }
}

/// Builds and caches registry clients keyed by host and TLS profile.
#[derive(Default)]
pub struct TransportFactory {
    clients: Mutex<HashMap<TransportKey, Arc<Client>>>,
}

impl TransportFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached client for the endpoint's transport profile,
    /// building it on first use.
    pub(crate) fn client_for(
        &self,
        endpoint: &Endpoint,
        options: &PullOptions,
    ) -> Result<Arc<Client>> {
        let key = TransportKey::new(endpoint, options);

        {
            let clients = self.clients.lock().expect("transport cache poisoned");
            if let Some(client) = clients.get(&key) {
                return Ok(client.clone());
            }
        }

        // Built outside the lock; on a race the first insert wins.
        let client = Arc::new(build_client(endpoint, options)?);
        let mut clients = self.clients.lock().expect("transport cache poisoned");
        Ok(clients.entry(key).or_insert(client).clone())
    }
}

fn build_client(endpoint: &Endpoint, options: &PullOptions) -> Result<Client> {
    let mut config = ClientConfig::default();
    config.protocol = if endpoint.scheme() == "http" {
        ClientProtocol::Http
    } else {
        ClientProtocol::Https
    };
    config.read_timeout = Some(options.timeout);
    config.connect_timeout = Some(options.timeout);

    if let Some(tls) = endpoint.tls() {
        if tls.insecure_skip_verify {
            config.accept_invalid_certificates = true;
        }

        if let Some(ca_file) = &tls.ca_file {
            let data = std::fs::read(ca_file).map_err(|e| {
                GantryError::ConfigInvalid(format!(
                    "cannot read CA file {}: {}",
                    ca_file.display(),
                    e
                ))
            })?;
            config.extra_root_certificates.push(Certificate {
                encoding: CertificateEncoding::Pem,
                data,
            });
        }

        match (&tls.cert_file, &tls.key_file) {
            (Some(cert_file), Some(key_file)) => {
                // Surface unreadable files at first use, even though the
                // underlying client cannot present a client certificate.
                std::fs::read(cert_file).map_err(|e| {
                    GantryError::ConfigInvalid(format!(
                        "cannot read cert file {}: {}",
                        cert_file.display(),
                        e
                    ))
                })?;
                std::fs::read(key_file).map_err(|e| {
                    GantryError::ConfigInvalid(format!(
                        "cannot read key file {}: {}",
                        key_file.display(),
                        e
                    ))
                })?;
                tracing::warn!(
                    endpoint = %endpoint.url(),
                    "Client certificate authentication is not supported by the registry transport; ignoring cert_file/key_file"
                );
            }
            (None, None) => {}
            _ => {
                return Err(GantryError::ConfigInvalid(
                    "cert_file and key_file must be configured together".to_string(),
                ));
            }
        }
    }

    let architecture = options.architecture.clone();
    let os = options.os.clone();
    config.platform_resolver = Some(Box::new(move |entries| {
        entries
            .iter()
            .find(|entry| {
                entry
                    .platform
                    .as_ref()
                    .map(|p| p.architecture == architecture && p.os == os)
                    .unwrap_or(false)
            })
            .map(|entry| entry.digest.clone())
    }));

    Ok(Client::new(config))
}
