//! Local filesystem operations for item sources.
//!
//! This module provides:
//! - Enumerating a source directory tree into [`SourceItem`]s
//! - Opening an enumerated item for reading
//! - Guessing MIME types from file extensions

use chrono::{DateTime, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::warn;

use crate::error::ScanError;
use crate::model::SourceItem;

/// Enumerate every regular file under `root`.
///
/// Item ids are `/`-separated paths relative to `root`, and items are
/// returned sorted by id so repeated scans of an unchanged tree yield the
/// same order. Hidden entries (leading `.`) are ignored. A subdirectory that
/// cannot be read is logged and skipped; failure to read `root` itself is
/// an error.
pub fn enumerate_tree(root: &Path) -> Result<Vec<SourceItem>, ScanError> {
    let mut items = Vec::new();

    fn recurse(path: &Path, rel_path: &str, items: &mut Vec<SourceItem>) -> io::Result<()> {
        for entry in fs::read_dir(path)? {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().into_owned();
            if file_name.starts_with('.') {
                continue;
            }

            let metadata = entry.metadata()?;
            let rel_full_path = if rel_path.is_empty() {
                file_name.clone()
            } else {
                format!("{}/{}", rel_path, file_name)
            };
            let entry_path = entry.path();

            if metadata.is_dir() {
                // An unreadable subtree should not hide the rest of the source
                if let Err(e) = recurse(&entry_path, &rel_full_path, items) {
                    warn!(path = %entry_path.display(), error = %e, "skipping unreadable directory");
                }
            } else if metadata.is_file() {
                items.push(SourceItem {
                    id: rel_full_path.clone(),
                    display_name: Some(file_name.clone()),
                    mime_type: guess_mime_type(&file_name).map(str::to_string),
                    taken_at: metadata.modified().ok().map(DateTime::<Utc>::from),
                    size_bytes: Some(metadata.len()),
                    relative_path: Some(rel_full_path),
                });
            }
        }
        Ok(())
    }

    recurse(root, "", &mut items).map_err(|source| ScanError {
        root: root.to_path_buf(),
        source,
    })?;
    items.sort_by(|a, b| a.id.cmp(&b.id));
    Ok(items)
}

/// Resolve an item back to its path under `root`.
pub fn item_path(root: &Path, item: &SourceItem) -> io::Result<PathBuf> {
    let relative = item.relative_path.as_deref().unwrap_or(&item.id);
    let mut path = root.to_path_buf();
    for segment in relative.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("item path escapes source root: {}", relative),
            ));
        }
        path.push(segment);
    }
    Ok(path)
}

/// Open an enumerated item for reading.
pub fn open_item(root: &Path, item: &SourceItem) -> io::Result<fs::File> {
    fs::File::open(item_path(root, item)?)
}

/// MIME type for common photo, video and document extensions.
pub fn guess_mime_type(file_name: &str) -> Option<&'static str> {
    let (_, ext) = file_name.rsplit_once('.')?;
    let mime = match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "webp" => "image/webp",
        "tif" | "tiff" => "image/tiff",
        "dng" => "image/x-adobe-dng",
        "mp4" => "video/mp4",
        "mov" => "video/quicktime",
        "3gp" => "video/3gpp",
        "mkv" => "video/x-matroska",
        "pdf" => "application/pdf",
        "txt" => "text/plain",
        _ => return None,
    };
    Some(mime)
}
