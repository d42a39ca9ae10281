//! Gantry - pulls and unpacks container images to the local filesystem.
//!
//! Supports repository rewrites, mirror endpoint overrides with
//! per-endpoint TLS and credentials, loading from local image tarballs,
//! and selective extraction of the merged root filesystem through a
//! source→destination directory map.
//!
//! The typical flow: load the registries configuration, build an
//! [`ImagePuller`], and hand it a reference plus the host paths to
//! populate. Local archives are consulted first; otherwise each
//! configured mirror endpoint is tried in order before the registry's
//! default endpoint.

pub mod extract;
pub mod image;
pub mod pull;
pub mod reference;
pub mod registries;
pub mod tarfile;

// Re-export common types
pub use extract::{extract, extract_dirs, extract_dirs_cancelable};
pub use image::{Image, RemoteImage};
pub use pull::ImagePuller;
pub use reference::ImageReference;
pub use registries::{
    AuthConfig, CompositeKeychain, ConfigKeychain, Credential, Endpoint, FileKeychain, Keychain,
    Mirror, PrivateRegistry, PullOptions, Registry, RegistryConfig, Resource, TlsConfig,
};
pub use tarfile::{find_image, TarballImage};

/// Gantry version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
