//! Local image tarball loading.
//!
//! Finds a tagged image inside the archives stored in a directory,
//! auto-detecting the compression format from the file suffix. Archives
//! use the docker-save layout: a `manifest.json` describing repo tags and
//! layer tars, a config blob, and one tar per layer.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use gantry_core::error::{GantryError, Result};
use serde::Deserialize;

use crate::image::{Image, LayerMerger};
use crate::reference::ImageReference;

/// zstd streams are decoded with a 32 MiB window cap so low-memory hosts
/// are not taken down by archives compressed with huge windows. The cap
/// must be at least as large as the compressor's window, or decoding
/// fails with a window-size error.
const MAX_DECODER_WINDOW_LOG: u32 = 25;

/// Suffixes the loader understands; keep in sync with the decoder table.
const EXTENSION_LIST: &str = ".tar .tar.lz4 .tar.bz2 .tbz .tar.gz .tgz .tar.zst .tzst";

/// Opens a fresh decompressed stream over one stored archive.
type Opener = Box<dyn Fn() -> Result<Box<dyn Read + Send>> + Send + Sync>;

/// One image in a docker-save manifest.
#[derive(Debug, Clone, Deserialize)]
struct ArchiveDescriptor {
    #[serde(rename = "Config")]
    config: String,
    #[serde(rename = "RepoTags", default)]
    repo_tags: Vec<String>,
    #[serde(rename = "Layers", default)]
    layers: Vec<String>,
}

/// Search the archives under `images_dir` for an image matching the
/// tagged reference. The first archive containing the tag wins.
///
/// Files with a `.txt` suffix are ignored; they conventionally carry
/// lookup hints next to the archives rather than image data. Files with
/// unrecognized suffixes are reported and skipped.
pub fn find_image(images_dir: impl AsRef<Path>, reference: &ImageReference) -> Result<TarballImage> {
    let images_dir = images_dir.as_ref();

    if reference.digest.is_some() {
        return Err(GantryError::NotImageTag(reference.name()));
    }
    if !images_dir.is_dir() {
        return Err(GantryError::NotFound {
            reference: reference.name(),
            dir: images_dir.to_path_buf(),
        });
    }

    tracing::info!(
        dir = %images_dir.display(),
        reference = %reference,
        "Checking local image archives"
    );

    let mut files = Vec::new();
    collect_files(images_dir, &mut files)?;
    files.sort();

    for path in files {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();

        if name.ends_with(".txt") {
            tracing::debug!(file = %path.display(), "Ignoring lookup-hint file");
            continue;
        }

        let Some(opener) = opener_for(&path) else {
            tracing::info!(
                file = %path.display(),
                "Unhandled file type; supported extensions: {}",
                EXTENSION_LIST
            );
            continue;
        };

        match TarballImage::find_in(opener, reference) {
            Ok(Some(image)) => {
                tracing::debug!(
                    reference = %reference,
                    file = %path.display(),
                    "Found image in local archive"
                );
                return Ok(image);
            }
            Ok(None) => {}
            Err(e) => {
                if let GantryError::IoError(ioe) = &e {
                    if is_zstd_window_error(ioe) {
                        return Err(GantryError::WindowExceeded { path });
                    }
                }
                tracing::info!(
                    reference = %reference,
                    file = %path.display(),
                    error = %e,
                    "Failed to find image in archive"
                );
            }
        }
    }

    Err(GantryError::NotFound {
        reference: reference.name(),
        dir: images_dir.to_path_buf(),
    })
}

/// Recursively gather regular files under a directory.
fn collect_files(dir: &Path, files: &mut Vec<PathBuf>) -> Result<()> {
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            collect_files(&path, files)?;
        } else {
            files.push(path);
        }
    }
    Ok(())
}

/// Pick a decompressor for a stored archive by suffix, case-insensitive.
fn opener_for(path: &Path) -> Option<Opener> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_lowercase())
        .unwrap_or_default();
    let path = path.to_path_buf();

    if name.ends_with(".tar") {
        Some(Box::new(move || {
            let file = File::open(&path)?;
            Ok(Box::new(file) as Box<dyn Read + Send>)
        }))
    } else if name.ends_with(".tar.lz4") {
        Some(Box::new(move || {
            let file = File::open(&path)?;
            Ok(Box::new(lz4_flex::frame::FrameDecoder::new(file)) as Box<dyn Read + Send>)
        }))
    } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") {
        Some(Box::new(move || {
            let file = File::open(&path)?;
            Ok(Box::new(bzip2::read::BzDecoder::new(file)) as Box<dyn Read + Send>)
        }))
    } else if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
        Some(Box::new(move || {
            let file = File::open(&path)?;
            Ok(Box::new(flate2::read::GzDecoder::new(file)) as Box<dyn Read + Send>)
        }))
    } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        Some(Box::new(move || {
            let file = File::open(&path)?;
            let mut decoder = zstd::stream::read::Decoder::new(file)?;
            decoder.window_log_max(MAX_DECODER_WINDOW_LOG)?;
            Ok(Box::new(decoder) as Box<dyn Read + Send>)
        }))
    } else {
        None
    }
}

/// Whether an I/O failure is the zstd decoder refusing an oversized window.
fn is_zstd_window_error(err: &std::io::Error) -> bool {
    let message = err.to_string();
    message.contains("too much memory") || message.contains("window size")
}

/// Image stored in a local docker-save archive.
///
/// Holds an opener rather than an open handle; every stream over the
/// archive uses a fresh file handle that is closed when the stream is
/// dropped.
pub struct TarballImage {
    opener: Opener,
    descriptor: ArchiveDescriptor,
    reference: ImageReference,
}

impl TarballImage {
    /// Look for the tagged reference inside one archive. Returns `None`
    /// when the archive is readable but holds no matching tag.
    fn find_in(opener: Opener, reference: &ImageReference) -> Result<Option<Self>> {
        let wanted = reference.name();
        let descriptors = load_manifest(&opener)?;

        for descriptor in descriptors {
            let matched = descriptor.repo_tags.iter().any(|repo_tag| {
                ImageReference::parse(repo_tag)
                    .map(|parsed| parsed.name() == wanted)
                    .unwrap_or(false)
            });
            if matched {
                return Ok(Some(Self {
                    opener,
                    descriptor,
                    reference: reference.clone(),
                }));
            }
        }
        Ok(None)
    }

    /// The reference this image was looked up as.
    pub fn reference(&self) -> &ImageReference {
        &self.reference
    }

    /// Read one file out of the archive by exact path.
    fn read_file(&self, wanted: &str) -> Result<Vec<u8>> {
        let mut archive = tar::Archive::new((self.opener)()?);
        for entry in archive.entries()? {
            let mut entry = entry?;
            if entry.path()?.as_ref() == Path::new(wanted) {
                let mut data = Vec::new();
                entry.read_to_end(&mut data)?;
                return Ok(data);
            }
        }
        Err(GantryError::Other(format!(
            "archive entry {} is missing",
            wanted
        )))
    }
}

impl Image for TarballImage {
    fn digest(&self) -> Option<String> {
        None
    }

    fn config_data(&self) -> Result<Vec<u8>> {
        self.read_file(&self.descriptor.config)
    }

    fn rootfs(&self) -> Result<Box<dyn Read + Send>> {
        use std::io::{Seek, SeekFrom};

        let mut spool = tempfile::tempfile()?;
        {
            // Newest layer first, so whiteouts settle paths before older
            // layers are read.
            let mut merger = LayerMerger::new(&mut spool);
            for layer in self.descriptor.layers.iter().rev() {
                let mut archive = tar::Archive::new((self.opener)()?);
                let mut found = false;
                for entry in archive.entries()? {
                    let entry = entry?;
                    if entry.path()?.as_ref() == Path::new(layer) {
                        merger.add_layer(entry)?;
                        found = true;
                        break;
                    }
                }
                if !found {
                    return Err(GantryError::Other(format!(
                        "layer {} is missing from archive",
                        layer
                    )));
                }
            }
            merger.finish()?;
        }
        spool.seek(SeekFrom::Start(0))?;
        Ok(Box::new(spool))
    }
}

/// Read and parse `manifest.json` from the root of the archive.
fn load_manifest(opener: &Opener) -> Result<Vec<ArchiveDescriptor>> {
    let mut archive = tar::Archive::new(opener()?);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.as_ref() == Path::new("manifest.json") {
            let mut data = Vec::new();
            entry.read_to_end(&mut data)?;
            return Ok(serde_json::from_slice(&data)?);
        }
    }
    Err(GantryError::Other(
        "archive has no manifest.json".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    /// Build a docker-save style archive, one inner tar per layer, oldest
    /// layer first.
    fn archive_bytes(repo_tag: &str, layers: &[&[(&str, &[u8])]]) -> Vec<u8> {
        let mut layer_blobs = Vec::new();
        for files in layers {
            let mut layer = tar::Builder::new(Vec::new());
            for (name, content) in *files {
                let mut header = tar::Header::new_gnu();
                header.set_size(content.len() as u64);
                header.set_mode(0o644);
                header.set_cksum();
                layer.append_data(&mut header, name, *content).unwrap();
            }
            layer_blobs.push(layer.into_inner().unwrap());
        }

        let config = br#"{"architecture":"amd64","os":"linux"}"#.to_vec();
        let layer_paths: Vec<String> = (0..layer_blobs.len())
            .map(|i| format!("layer{}/layer.tar", i))
            .collect();
        let manifest = format!(
            r#"[{{"Config":"config.json","RepoTags":["{}"],"Layers":[{}]}}]"#,
            repo_tag,
            layer_paths
                .iter()
                .map(|p| format!("\"{}\"", p))
                .collect::<Vec<_>>()
                .join(",")
        );

        let mut outer = tar::Builder::new(Vec::new());
        let mut files: Vec<(&str, &[u8])> = vec![
            ("manifest.json", manifest.as_bytes()),
            ("config.json", config.as_slice()),
        ];
        for (path, blob) in layer_paths.iter().zip(&layer_blobs) {
            files.push((path.as_str(), blob.as_slice()));
        }
        for (name, content) in files {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_cksum();
            outer.append_data(&mut header, name, content).unwrap();
        }
        outer.into_inner().unwrap()
    }

    fn write_layered_archive(
        dir: &Path,
        name: &str,
        repo_tag: &str,
        layers: &[&[(&str, &[u8])]],
    ) {
        std::fs::write(dir.join(name), archive_bytes(repo_tag, layers)).unwrap();
    }

    fn write_archive(dir: &Path, name: &str, repo_tag: &str) {
        let bytes = archive_bytes(repo_tag, &[&[("bin/sh", b"shell")]]);
        let path = dir.join(name);

        if name.ends_with(".tar.gz") || name.ends_with(".tgz") {
            let file = File::create(path).unwrap();
            let mut encoder =
                flate2::write::GzEncoder::new(file, flate2::Compression::default());
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        } else if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
            let data = zstd::encode_all(&bytes[..], 0).unwrap();
            std::fs::write(path, data).unwrap();
        } else if name.ends_with(".tar.bz2") || name.ends_with(".tbz") {
            let file = File::create(path).unwrap();
            let mut encoder = bzip2::write::BzEncoder::new(file, bzip2::Compression::default());
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        } else if name.ends_with(".tar.lz4") {
            let file = File::create(path).unwrap();
            let mut encoder = lz4_flex::frame::FrameEncoder::new(file);
            encoder.write_all(&bytes).unwrap();
            encoder.finish().unwrap();
        } else {
            std::fs::write(path, bytes).unwrap();
        }
    }

    fn busybox() -> ImageReference {
        ImageReference::parse("busybox:latest").unwrap()
    }

    #[test]
    fn test_digest_reference_rejected() {
        let dir = TempDir::new().unwrap();
        let reference = ImageReference::parse(
            "busybox@sha256:82becede498899ec668628e7cb0ad87b6e1c371cb8a1e597d83a47fac21d6af3",
        )
        .unwrap();

        let err = find_image(dir.path(), &reference).unwrap_err();
        assert!(matches!(err, GantryError::NotImageTag(_)));
    }

    #[test]
    fn test_missing_directory_not_found() {
        let dir = TempDir::new().unwrap();
        let err = find_image(dir.path().join("absent"), &busybox()).unwrap_err();
        assert!(matches!(err, GantryError::NotFound { .. }));
    }

    #[test]
    fn test_finds_image_in_plain_tar() {
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        let image = find_image(dir.path(), &busybox()).unwrap();
        assert_eq!(image.reference().name(), "index.docker.io/library/busybox:latest");
        assert!(image.digest().is_none());
    }

    #[test]
    fn test_finds_image_in_each_compressed_format() {
        for name in [
            "images.tar.gz",
            "images.tgz",
            "images.tar.zst",
            "images.tzst",
            "images.tar.bz2",
            "images.tbz",
            "images.tar.lz4",
        ] {
            let dir = TempDir::new().unwrap();
            write_archive(dir.path(), name, "busybox:latest");
            let image = find_image(dir.path(), &busybox())
                .unwrap_or_else(|e| panic!("failed for {}: {}", name, e));
            assert!(!image.config_data().unwrap().is_empty(), "{}", name);
        }
    }

    #[test]
    fn test_repo_tag_matching_is_canonical() {
        // "busybox:latest" in the archive matches the fully-qualified form
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        let reference = ImageReference::parse("index.docker.io/library/busybox:latest").unwrap();
        assert!(find_image(dir.path(), &reference).is_ok());
    }

    #[test]
    fn test_tag_mismatch_not_found() {
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), "images.tar", "busybox:1.35");

        let err = find_image(dir.path(), &busybox()).unwrap_err();
        assert!(matches!(err, GantryError::NotFound { .. }));
    }

    #[test]
    fn test_txt_files_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("images.txt"), "not an archive").unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        assert!(find_image(dir.path(), &busybox()).is_ok());
    }

    #[test]
    fn test_unknown_suffix_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("images.xyz"), "garbage").unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        assert!(find_image(dir.path(), &busybox()).is_ok());
    }

    #[test]
    fn test_corrupt_archive_skipped() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("broken.tar.gz"), "not gzip at all").unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        assert!(find_image(dir.path(), &busybox()).is_ok());
    }

    #[test]
    fn test_nested_directories_searched() {
        let dir = TempDir::new().unwrap();
        let nested = dir.path().join("nested");
        std::fs::create_dir_all(&nested).unwrap();
        write_archive(&nested, "images.tar", "busybox:latest");

        assert!(find_image(dir.path(), &busybox()).is_ok());
    }

    fn rootfs_names(image: &TarballImage) -> Vec<String> {
        let mut archive = tar::Archive::new(image.rootfs().unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| e.unwrap().path().unwrap().display().to_string())
            .collect()
    }

    #[test]
    fn test_rootfs_streams_layer_contents() {
        let dir = TempDir::new().unwrap();
        write_archive(dir.path(), "images.tar", "busybox:latest");

        let image = find_image(dir.path(), &busybox()).unwrap();
        assert_eq!(rootfs_names(&image), vec!["bin/sh"]);
    }

    #[test]
    fn test_rootfs_applies_whiteouts_across_layers() {
        let dir = TempDir::new().unwrap();
        write_layered_archive(
            dir.path(),
            "images.tar",
            "busybox:latest",
            &[
                &[("bin/gone", b"doomed"), ("bin/keep", b"kept")],
                &[("bin/.wh.gone", b"")],
            ],
        );

        let image = find_image(dir.path(), &busybox()).unwrap();
        assert_eq!(rootfs_names(&image), vec!["bin/keep"]);
    }

    #[test]
    fn test_rootfs_opaque_marker_resets_directory() {
        let dir = TempDir::new().unwrap();
        write_layered_archive(
            dir.path(),
            "images.tar",
            "busybox:latest",
            &[
                &[("etc/old1", b"o1"), ("etc/old2", b"o2")],
                &[("etc/.wh..wh..opq", b""), ("etc/new", b"n")],
            ],
        );

        let image = find_image(dir.path(), &busybox()).unwrap();
        let mut names = rootfs_names(&image);
        names.sort();
        assert_eq!(names, vec!["etc/new"]);
    }

    #[test]
    fn test_rootfs_newest_layer_wins() {
        let dir = TempDir::new().unwrap();
        write_layered_archive(
            dir.path(),
            "images.tar",
            "busybox:latest",
            &[&[("etc/config", b"old")], &[("etc/config", b"new")]],
        );

        let image = find_image(dir.path(), &busybox()).unwrap();
        let mut archive = tar::Archive::new(image.rootfs().unwrap());
        let contents: Vec<String> = archive
            .entries()
            .unwrap()
            .map(|e| {
                let mut data = String::new();
                e.unwrap().read_to_string(&mut data).unwrap();
                data
            })
            .collect();
        assert_eq!(contents, vec!["new"]);
    }
}
