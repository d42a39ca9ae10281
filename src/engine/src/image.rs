//! Image contract shared by the remote and tarball backends.
//!
//! Consumers see a container image as its manifest metadata plus a single
//! flattened tar stream of the merged root filesystem. The merge resolves
//! the layer stack before the stream is emitted: whiteout markers delete
//! paths from lower layers, opaque markers reset directories, and each
//! surviving path appears exactly once, taken from the newest layer that
//! carries it. Extraction never sees a marker file.

use std::collections::HashMap;
use std::io::{Read, Seek, SeekFrom, Write};

use flate2::read::GzDecoder;
use gantry_core::error::Result;
use oci_distribution::client::ImageData;
use oci_distribution::manifest::OciImageManifest;
use tar::EntryType;

use crate::reference::ImageReference;

/// Prefix marking a deleted path in the layer below.
const WHITEOUT_PREFIX: &str = ".wh.";

/// Marker resetting the enclosing directory: lower layers contribute
/// nothing under it.
const OPAQUE_WHITEOUT: &str = ".wh..wh..opq";

/// A container image whose merged root filesystem can be streamed as a
/// tar archive.
pub trait Image: Send + Sync {
    /// Digest of the image manifest, when known.
    fn digest(&self) -> Option<String>;

    /// Raw image config JSON.
    fn config_data(&self) -> Result<Vec<u8>>;

    /// Open the merged root filesystem as a tar stream. Every call yields
    /// a fresh stream positioned at the first entry.
    fn rootfs(&self) -> Result<Box<dyn Read + Send>>;
}

/// Image pulled from a remote registry.
pub struct RemoteImage {
    reference: ImageReference,
    data: ImageData,
}

impl RemoteImage {
    pub(crate) fn new(reference: ImageReference, data: ImageData) -> Self {
        Self { reference, data }
    }

    /// The (rewritten) reference this image was pulled as.
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// The image manifest, when the registry returned one.
    pub fn manifest(&self) -> Option<&OciImageManifest> {
        self.data.manifest.as_ref()
    }
}

impl Image for RemoteImage {
    fn digest(&self) -> Option<String> {
        self.data.digest.clone()
    }

    fn config_data(&self) -> Result<Vec<u8>> {
        Ok(self.data.config.data.clone())
    }

    fn rootfs(&self) -> Result<Box<dyn Read + Send>> {
        // Layers are merged newest-first into a spooled archive, so large
        // images do not need to be held in memory twice.
        let mut spool = tempfile::tempfile()?;
        {
            let mut merger = LayerMerger::new(&mut spool);
            for layer in self.data.layers.iter().rev() {
                let reader = decompress_layer(&layer.media_type, &layer.data[..])?;
                merger.add_layer(reader)?;
            }
            merger.finish()?;
        }
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }
}

/// Wrap a raw layer blob in the decoder its media type calls for.
fn decompress_layer<'a>(media_type: &str, data: &'a [u8]) -> Result<Box<dyn Read + 'a>> {
    if media_type.ends_with("+gzip") || media_type.ends_with(".gzip") {
        Ok(Box::new(GzDecoder::new(data)))
    } else if media_type.ends_with("+zstd") || media_type.ends_with(".zstd") {
        Ok(Box::new(zstd::stream::read::Decoder::new(data)?))
    } else {
        Ok(Box::new(data))
    }
}

/// Merges a layer stack into one tar stream.
///
/// Layers are fed newest-first. Each emitted path is recorded so older
/// copies are dropped, a `.wh.<name>` marker tombstones `<name>` for the
/// layers below it, and a `.wh..wh..opq` marker hides everything older
/// inside its directory. Markers themselves are never emitted. Opaque
/// markers take effect when the layer that carries them has been fully
/// read, so they do not hide their own layer's siblings.
pub(crate) struct LayerMerger<W: Write> {
    builder: tar::Builder<W>,
    /// Cleaned path → final. Final paths (files and tombstones) also hide
    /// everything beneath them; directories stay open for older children.
    paths: HashMap<String, bool>,
    /// Directories reset by opaque markers in newer layers.
    opaque: Vec<String>,
}

impl<W: Write> LayerMerger<W> {
    pub(crate) fn new(writer: W) -> Self {
        Self {
            builder: tar::Builder::new(writer),
            paths: HashMap::new(),
            opaque: Vec::new(),
        }
    }

    /// Merge the next layer down the stack.
    pub(crate) fn add_layer(&mut self, reader: impl Read) -> Result<()> {
        let mut pending_opaque = Vec::new();

        let mut archive = tar::Archive::new(reader);
        for entry in archive.entries()? {
            let entry = entry?;
            let name = clean_layer_path(&entry.path()?.to_string_lossy());
            if name.is_empty() {
                continue;
            }

            let (dir, base) = match name.rfind('/') {
                Some(pos) => (&name[..pos], &name[pos + 1..]),
                None => ("", name.as_str()),
            };

            if base == OPAQUE_WHITEOUT {
                pending_opaque.push(dir.to_string());
                continue;
            }
            if let Some(hidden) = base.strip_prefix(WHITEOUT_PREFIX) {
                let target = if dir.is_empty() {
                    hidden.to_string()
                } else {
                    format!("{}/{}", dir, hidden)
                };
                tracing::debug!(path = %target, "Applying whiteout");
                self.paths.insert(target, true);
                continue;
            }

            if self.hidden(&name) {
                continue;
            }

            let is_dir = entry.header().entry_type() == EntryType::Directory;
            self.paths.insert(name, !is_dir);

            let mut header = entry.header().clone();
            let path = entry.path()?.into_owned();
            self.builder.append_data(&mut header, path, entry)?;
        }

        self.opaque.append(&mut pending_opaque);
        Ok(())
    }

    /// Whether a newer layer already settled this path: emitted it,
    /// tombstoned it, finalized an ancestor, or reset an ancestor
    /// directory.
    fn hidden(&self, name: &str) -> bool {
        if self.paths.contains_key(name) {
            return true;
        }
        let mut current = name;
        while let Some(pos) = current.rfind('/') {
            current = &current[..pos];
            if self.paths.get(current).copied().unwrap_or(false) {
                return true;
            }
            if self.opaque.iter().any(|dir| dir == current) {
                return true;
            }
        }
        false
    }

    pub(crate) fn finish(mut self) -> Result<()> {
        self.builder.finish()?;
        Ok(())
    }
}

/// Strip `.`, empty components, and leading slashes from a layer entry
/// path so whiteout targets and duplicates compare reliably.
fn clean_layer_path(raw: &str) -> String {
    raw.split('/')
        .filter(|component| !component.is_empty() && *component != ".")
        .collect::<Vec<_>>()
        .join("/")
}
