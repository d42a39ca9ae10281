//! High-level image pull orchestration.
//!
//! Combines the local tarball loader and the registry façade into a
//! single workflow: a reference is satisfied from the images directory
//! when possible, and pulled through the configured mirror endpoints
//! otherwise. The resulting image can then be unpacked through a
//! directory map.

use std::collections::HashMap;
use std::path::PathBuf;

use gantry_core::error::{GantryError, Result};

use crate::extract::extract_dirs_cancelable;
use crate::image::Image;
use crate::reference::ImageReference;
use crate::registries::{PrivateRegistry, PullOptions};
use crate::tarfile;

/// High-level image puller: local archives first, then the registry.
pub struct ImagePuller {
    registry: PrivateRegistry,
    images_dir: Option<PathBuf>,
}

impl ImagePuller {
    /// Create a puller that always goes to the registry.
    pub fn new(registry: PrivateRegistry) -> Self {
        Self {
            registry,
            images_dir: None,
        }
    }

    /// Check a directory of image archives before contacting any registry.
    pub fn with_images_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.images_dir = Some(dir.into());
        self
    }

    /// Resolve an image for the reference.
    ///
    /// A missing local archive falls through to the registry; a digest
    /// reference skips the archive lookup entirely since archives are
    /// addressed by tag.
    pub async fn pull(&self, reference: &str, options: &PullOptions) -> Result<Box<dyn Image>> {
        let reference = ImageReference::parse(reference)?;

        if let Some(images_dir) = &self.images_dir {
            match tarfile::find_image(images_dir, &reference) {
                Ok(image) => {
                    tracing::info!(reference = %reference, "Using local image archive");
                    return Ok(Box::new(image));
                }
                Err(GantryError::NotFound { .. }) => {
                    tracing::debug!(
                        reference = %reference,
                        "No local archive matches; falling back to registry"
                    );
                }
                Err(GantryError::NotImageTag(_)) => {
                    tracing::warn!(
                        reference = %reference,
                        "Local archives are addressed by tag; pulling digest reference from registry"
                    );
                }
                Err(e) => return Err(e),
            }
        }

        if options.cancel.is_cancelled() {
            return Err(GantryError::Canceled);
        }

        tracing::info!(reference = %reference, "Pulling image from registry");
        let image = self.registry.image(&reference, options).await?;
        Ok(Box::new(image))
    }

    /// Pull an image and unpack it through the directory map.
    pub async fn pull_to(
        &self,
        reference: &str,
        dirs: &HashMap<String, String>,
        options: &PullOptions,
    ) -> Result<()> {
        let image = self.pull(reference, options).await?;
        extract_dirs_cancelable(image.as_ref(), dirs, &options.cancel)
    }
}
