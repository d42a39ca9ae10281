//! Merged rootfs extraction.
//!
//! Streams an image's merged root filesystem tar and writes selected
//! entries to the host through a source→destination directory map. Only
//! directories and regular files are materialized; everything else is
//! skipped. Entry paths are lexically cleaned and must stay inside their
//! mapped destination.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Read;
use std::path::{Path, PathBuf};

use gantry_core::error::{GantryError, Result};
use tar::EntryType;
use tokio_util::sync::CancellationToken;

use crate::image::Image;

/// Extract the entire root filesystem of the image to one directory.
pub fn extract(img: &dyn Image, dir: impl AsRef<Path>) -> Result<()> {
    let mut dirs = HashMap::new();
    dirs.insert(
        "/".to_string(),
        dir.as_ref().to_string_lossy().into_owned(),
    );
    extract_dirs(img, &dirs)
}

/// Extract image content, honoring the directory map when deciding where
/// on the local filesystem to place each entry. For example:
/// `{"/bin": "/usr/local/bin", "/etc": "/etc", "/etc/rancher": "/opt/rancher/etc"}`
pub fn extract_dirs(img: &dyn Image, dirs: &HashMap<String, String>) -> Result<()> {
    extract_dirs_cancelable(img, dirs, &CancellationToken::new())
}

/// Like [`extract_dirs`], aborting with [`GantryError::Canceled`] at the
/// next tar entry boundary once the token fires. Partial files are left
/// in place for the caller to clean up.
pub fn extract_dirs_cancelable(
    img: &dyn Image,
    dirs: &HashMap<String, String>,
    cancel: &CancellationToken,
) -> Result<()> {
    let dirs = clean_dirs(dirs)?;

    let mut archive = tar::Archive::new(img.rootfs()?);
    for entry in archive.entries()? {
        if cancel.is_cancelled() {
            return Err(GantryError::Canceled);
        }

        let mut entry = entry?;
        let raw = entry.path()?.to_string_lossy().into_owned();
        let name = clean_entry_name(&raw)?;

        // Walk up the entry's parents until a mapped source prefix matches.
        let Some((source, base)) = match_mapping(&name, &dirs) else {
            tracing::debug!(entry = %name, "Skipping unmapped entry");
            continue;
        };
        let relative = name
            .strip_prefix(source)
            .unwrap_or(name.as_str())
            .trim_start_matches('/');
        let destination = base.join(relative);
        if !destination.starts_with(base) {
            return Err(GantryError::IllegalPath(raw));
        }

        match entry.header().entry_type() {
            EntryType::Directory => make_dir(&destination)?,
            EntryType::Regular => {
                tracing::info!(entry = %name, destination = %destination.display(), "Extracting file");
                let mode = entry.header().mode()? & 0o755;
                write_file(&destination, mode, &mut entry)?;
            }
            other => {
                tracing::debug!(entry = %name, entry_type = ?other, "Skipping unsupported entry type");
            }
        }
    }

    Ok(())
}

/// Clean the directory map so source and destination reliably have no
/// trailing slashes (unless the path is root) and destinations are
/// absolute. Required to make matching reliable while walking up the
/// source path.
fn clean_dirs(dirs: &HashMap<String, String>) -> Result<HashMap<String, PathBuf>> {
    let mut clean = HashMap::with_capacity(dirs.len());
    for (source, destination) in dirs {
        let source = if source == "/" {
            source.clone()
        } else {
            source.trim_end_matches('/').to_string()
        };
        let destination = if destination == "/" {
            PathBuf::from("/")
        } else {
            std::path::absolute(destination.trim_end_matches('/'))?
        };
        clean.insert(source, destination);
    }
    Ok(clean)
}

/// Anchor an entry name at `/` and resolve `.` and `..` lexically.
/// A name that climbs above the root is illegal.
fn clean_entry_name(raw: &str) -> Result<String> {
    let mut parts: Vec<&str> = Vec::new();
    for component in raw.split('/') {
        match component {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(GantryError::IllegalPath(raw.to_string()));
                }
            }
            component => parts.push(component),
        }
    }
    Ok(format!("/{}", parts.join("/")))
}

/// Find the mapped source prefix owning an entry by walking up its parent
/// directories; the walk ends unmatched at `/`.
fn match_mapping<'a>(
    name: &str,
    dirs: &'a HashMap<String, PathBuf>,
) -> Option<(&'a str, &'a PathBuf)> {
    let mut current = parent_of(name);
    loop {
        if let Some((source, destination)) = dirs.get_key_value(current) {
            return Some((source.as_str(), destination));
        }
        if current == "/" {
            return None;
        }
        current = parent_of(current);
    }
}

/// The parent of a `/`-anchored path string; the parent of `/` is `/`.
fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(pos) => &path[..pos],
    }
}

fn make_dir(destination: &Path) -> Result<()> {
    let mut builder = std::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::DirBuilderExt;
        builder.mode(0o755);
    }
    builder.create(destination)?;
    Ok(())
}

fn write_file(destination: &Path, mode: u32, data: &mut impl Read) -> Result<()> {
    if let Some(parent) = destination.parent() {
        make_dir(parent)?;
    }

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(mode);
    }
    #[cfg(not(unix))]
    let _ = mode;

    let mut file = options.open(destination)?;
    std::io::copy(data, &mut file)?;
    Ok(())
}
