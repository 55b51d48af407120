//! Atomic, verified uploads.
//!
//! Content is written to a staging file next to its final name, verified,
//! and only then renamed into place. A failed transfer never leaves content
//! visible under the final name; the staging file is removed best-effort.

use std::io::{self, Read, Write};
use tracing::{debug, warn};

use crate::checksums::{create_hasher, digest_reader, ChecksumAlgorithm, ChecksumValue};
use crate::destination::RemoteFs;
use crate::error::{IntegrityFailure, TransferError};

/// Chunk size for streaming copies
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

/// Suffix of the hidden staging file written next to the final name.
pub const STAGING_SUFFIX: &str = ".sharesync-partial";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferOptions {
    pub algorithm: ChecksumAlgorithm,
    pub chunk_size: usize,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            algorithm: ChecksumAlgorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

/// A committed upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub remote_path: String,
    pub bytes_written: u64,
    pub checksum: ChecksumValue,
}

/// Validate a `/`-separated remote path and return it in canonical form.
///
/// Leading, trailing and repeated separators are dropped. `.` and `..`
/// segments are rejected. The empty path names the session root.
pub fn normalize_remote_path(path: &str) -> Result<String, TransferError> {
    let mut segments = Vec::new();
    for segment in path.split('/').filter(|s| !s.is_empty()) {
        if segment == "." || segment == ".." || segment.contains('\\') {
            return Err(TransferError::InvalidPath(path.to_string()));
        }
        segments.push(segment);
    }
    Ok(segments.join("/"))
}

/// Join a base path and a relative path with a single separator.
pub fn join_remote(base: &str, relative: &str) -> String {
    let base = base.trim_matches('/');
    let relative = relative.trim_start_matches('/');
    if base.is_empty() {
        relative.to_string()
    } else if relative.is_empty() {
        base.to_string()
    } else {
        format!("{}/{}", base, relative)
    }
}

/// Staging name for a destination: `.<filename>.sharesync-partial` in the
/// same directory.
pub fn staging_path(destination_path: &str) -> Result<String, TransferError> {
    let normalized = normalize_remote_path(destination_path)?;
    let (parent, file_name) = match normalized.rsplit_once('/') {
        Some((parent, name)) => (parent, name),
        None => ("", normalized.as_str()),
    };
    if file_name.is_empty() {
        return Err(TransferError::InvalidPath(destination_path.to_string()));
    }
    Ok(join_remote(parent, &format!(".{}{}", file_name, STAGING_SUFFIX)))
}

/// Upload `source` to `destination_path` through `fs`.
///
/// Steps: create missing parent directories, stream into the staging file
/// while hashing, check the declared length, re-read the staging file and
/// compare size and digest, then rename over the final name.
pub fn transfer(
    fs: &dyn RemoteFs,
    destination_path: &str,
    expected_length: Option<u64>,
    source: &mut dyn Read,
    options: &TransferOptions,
    on_progress: &mut dyn FnMut(u64),
) -> Result<TransferReceipt, TransferError> {
    let final_path = normalize_remote_path(destination_path)?;
    let staging = staging_path(&final_path)?;

    ensure_parent_directories(fs, &final_path)?;

    let staged = stage_and_verify(fs, &final_path, &staging, expected_length, source, options, on_progress);
    let (bytes_written, checksum) = match staged {
        Ok(staged) => staged,
        Err(e) => {
            discard_staging(fs, &staging);
            return Err(e);
        }
    };

    if let Err(e) = fs.rename(&staging, &final_path) {
        discard_staging(fs, &staging);
        return Err(TransferError::remote(final_path, e));
    }

    debug!(path = %final_path, bytes = bytes_written, checksum = %checksum, "transfer committed");
    Ok(TransferReceipt {
        remote_path: final_path,
        bytes_written,
        checksum,
    })
}

fn ensure_parent_directories(fs: &dyn RemoteFs, final_path: &str) -> Result<(), TransferError> {
    let Some((parent, _)) = final_path.rsplit_once('/') else {
        return Ok(());
    };

    let mut current = String::new();
    for segment in parent.split('/') {
        current = join_remote(&current, segment);
        match fs.create_dir(&current) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
            Err(e) => return Err(TransferError::remote(current, e)),
        }
    }
    Ok(())
}

fn stage_and_verify(
    fs: &dyn RemoteFs,
    final_path: &str,
    staging: &str,
    expected_length: Option<u64>,
    source: &mut dyn Read,
    options: &TransferOptions,
    on_progress: &mut dyn FnMut(u64),
) -> Result<(u64, ChecksumValue), TransferError> {
    let chunk_size = options.chunk_size.max(1);
    let mut writer = fs
        .open_write(staging)
        .map_err(|e| TransferError::remote(staging, e))?;
    let mut hasher = create_hasher(options.algorithm);
    let mut buffer = vec![0u8; chunk_size];
    let mut written = 0u64;

    loop {
        let n = match source.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(TransferError::SourceRead(e)),
        };
        writer
            .write_all(&buffer[..n])
            .map_err(|e| TransferError::remote(staging, e))?;
        hasher.update(&buffer[..n]);
        written += n as u64;
        on_progress(written);
    }

    writer.flush().map_err(|e| TransferError::remote(staging, e))?;
    drop(writer);
    let checksum = hasher.finalize();

    let integrity = |failure| TransferError::Integrity {
        path: final_path.to_string(),
        failure,
    };

    if let Some(expected) = expected_length {
        if expected != written {
            return Err(integrity(IntegrityFailure::Truncated {
                expected,
                actual: written,
            }));
        }
    }

    let reported = fs
        .file_size(staging)
        .map_err(|e| TransferError::remote(staging, e))?;
    if reported != written {
        return Err(integrity(IntegrityFailure::SizeMismatch { reported, written }));
    }

    let mut reader = fs
        .open_read(staging)
        .map_err(|e| TransferError::remote(staging, e))?;
    let (read_back, actual) = digest_reader(&mut reader, options.algorithm, chunk_size)
        .map_err(|e| TransferError::remote(staging, e))?;
    if read_back != written {
        return Err(integrity(IntegrityFailure::SizeMismatch {
            reported: read_back,
            written,
        }));
    }
    if actual != checksum {
        return Err(integrity(IntegrityFailure::ChecksumMismatch {
            expected: checksum.hex().to_string(),
            actual: actual.hex().to_string(),
        }));
    }

    Ok((written, checksum))
}

fn discard_staging(fs: &dyn RemoteFs, staging: &str) {
    match fs.remove_file(staging) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %staging, error = %e, "failed to remove staging file"),
    }
}
