//! Path fingerprints used as unique lookup keys for albums and media.

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};
use xxhash_rust::xxh3::xxh3_128;

/// Digest of the path's byte sequence, hex encoded.
pub fn fingerprint(path: &Path) -> Result<String> {
    let key = path.to_string_lossy();
    if key.is_empty() {
        return Err(Error::Fingerprint("cannot fingerprint an empty path".into()));
    }
    Ok(format!("{:032x}", xxh3_128(key.as_bytes())))
}

/// Fingerprint of a media file's content path, i.e. with the retouch marker removed.
pub fn media_fingerprint(path: &Path, marker: &str) -> Result<String> {
    fingerprint(&strip_marker(path, marker))
}

/// Removes the retouch marker that sits between the file stem and its extension.
pub fn strip_marker(path: &Path, marker: &str) -> PathBuf {
    if marker.is_empty() {
        return path.to_path_buf();
    }
    let (stem, ext) = split_name(path);
    match stem.strip_suffix(marker) {
        Some(base) if !base.is_empty() => path.with_file_name(join_name(base, ext)),
        _ => path.to_path_buf(),
    }
}

/// Adds the retouch marker unless it is already present.
pub fn add_marker(path: &Path, marker: &str) -> PathBuf {
    let (stem, ext) = split_name(path);
    if marker.is_empty() || stem.ends_with(marker) {
        return path.to_path_buf();
    }
    path.with_file_name(join_name(&format!("{stem}{marker}"), ext))
}

/// The counterpart of `path` under the opposite retouch state.
pub fn toggle_marker(path: &Path, marker: &str) -> PathBuf {
    let stripped = strip_marker(path, marker);
    if stripped == path {
        add_marker(path, marker)
    } else {
        stripped
    }
}

fn split_name(path: &Path) -> (String, Option<String>) {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let ext = path.extension().map(|s| s.to_string_lossy().to_string());
    (stem, ext)
}

fn join_name(stem: &str, ext: Option<String>) -> String {
    match ext {
        Some(ext) => format!("{stem}.{ext}"),
        None => stem.to_string(),
    }
}
