use std::path::PathBuf;

use thiserror::Error;

/// Gantry error types
#[derive(Error, Debug)]
pub enum GantryError {
    /// Registry configuration file is malformed
    #[error("Failed to parse registry configuration {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Registry configuration references something unusable (bad CA file, etc.)
    #[error("Invalid registry configuration: {0}")]
    ConfigInvalid(String),

    /// Image reference could not be parsed
    #[error("Invalid image reference {reference}: {message}")]
    Reference { reference: String, message: String },

    /// No local tarball satisfies the reference
    #[error("No local image available for {reference}: not found in {}", .dir.display())]
    NotFound { reference: String, dir: PathBuf },

    /// Local tarball lookup was given a digest-pinned reference
    #[error("No local image available for {0}: reference is not a tag")]
    NotImageTag(String),

    /// All endpoints for a reference failed
    #[error("Failed to pull {reference} from {endpoint}: {source}")]
    EndpointFailure {
        reference: String,
        endpoint: String,
        #[source]
        source: oci_distribution::errors::OciDistributionError,
    },

    /// Registry rejected the credentials that were offered
    #[error("Authentication failed for {endpoint}")]
    AuthFailure { endpoint: String },

    /// Archive entry or mapping escapes its destination
    #[error("Illegal path in archive: {0}")]
    IllegalPath(String),

    /// Compressed tarball requires a larger zstd window than the decoder allows
    #[error("Zstd window size exceeds decoder limit for {}", .path.display())]
    WindowExceeded { path: PathBuf },

    /// Caller-requested cancellation
    #[error("Operation canceled")]
    Canceled,

    /// I/O error
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Result type alias for gantry operations
pub type Result<T> = std::result::Result<T, GantryError>;
