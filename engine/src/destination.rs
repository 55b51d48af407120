//! Protocol adapters for remote destinations.
//!
//! A destination is reached through two layers:
//! - [`RemoteFs`]: the primitive file operations of one concrete protocol
//!   session (create a directory, write a file, rename, ...)
//! - [`ProtocolAdapter`]: the capability surface the engine uses
//!   (`test_connection`, `list_directories`, `upload_file`), where uploads go
//!   through the staged, verified transfer protocol in [`crate::transfer`]
//!
//! [`MountedShare`] is the shipped protocol: a network share mounted into the
//! local filesystem under `<mount_root>/<host>/<share>`.

use chrono::{DateTime, Utc};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{AuthenticationRejected, FailureKind, TransferError};
use crate::model::{Credentials, Destination};
use crate::transfer::{self, TransferOptions, TransferReceipt};

/// File name inside a share root listing the usernames allowed to write to it.
pub const ACCESS_LIST_FILE: &str = ".sharesync-access";

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Primitive operations of a remote filesystem session.
///
/// Paths are `/`-separated and relative to the session root; callers pass
/// paths already validated by [`transfer::normalize_remote_path`].
pub trait RemoteFs: Send + Sync {
    /// Human-readable location, for logs.
    fn describe(&self) -> String;

    /// Cheap round trip proving the session root is reachable.
    fn probe(&self) -> io::Result<()>;

    /// Create one directory level. Existing directories yield `AlreadyExists`.
    fn create_dir(&self, path: &str) -> io::Result<()>;

    /// Open a file for writing, creating it or truncating existing content.
    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>>;

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>>;

    /// Size as reported by the remote side.
    fn file_size(&self, path: &str) -> io::Result<u64>;

    /// Rename `from` to `to`, replacing any existing file at `to`.
    fn rename(&self, from: &str, to: &str) -> io::Result<()>;

    fn remove_file(&self, path: &str) -> io::Result<()>;

    fn list_dir(&self, path: &str) -> io::Result<Vec<RemoteEntry>>;

    /// Stamp a modification time on a committed file, where supported.
    fn set_modified(&self, _path: &str, _at: DateTime<Utc>) -> io::Result<()> {
        Err(io::Error::from(io::ErrorKind::Unsupported))
    }
}

/// A share mounted into the local filesystem.
#[derive(Debug, Clone)]
pub struct MountedShare {
    root: PathBuf,
}

impl MountedShare {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        MountedShare { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &str) -> io::Result<PathBuf> {
        let mut resolved = self.root.clone();
        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if segment == "." || segment == ".." || segment.contains('\\') {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("path escapes share root: {}", path),
                ));
            }
            resolved.push(segment);
        }
        Ok(resolved)
    }
}

/// Staging file handle that forces data to stable storage on flush.
struct SyncedFile(File);

impl Write for SyncedFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.0.flush()?;
        self.0.sync_data()
    }
}

impl RemoteFs for MountedShare {
    fn describe(&self) -> String {
        self.root.display().to_string()
    }

    fn probe(&self) -> io::Result<()> {
        let metadata = fs::metadata(&self.root)?;
        if metadata.is_dir() {
            Ok(())
        } else {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("share root is not a directory: {}", self.root.display()),
            ))
        }
    }

    fn create_dir(&self, path: &str) -> io::Result<()> {
        fs::create_dir(self.resolve(path)?)
    }

    fn open_write(&self, path: &str) -> io::Result<Box<dyn Write + Send>> {
        let file = File::create(self.resolve(path)?)?;
        Ok(Box::new(SyncedFile(file)))
    }

    fn open_read(&self, path: &str) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(File::open(self.resolve(path)?)?))
    }

    fn file_size(&self, path: &str) -> io::Result<u64> {
        Ok(fs::metadata(self.resolve(path)?)?.len())
    }

    fn rename(&self, from: &str, to: &str) -> io::Result<()> {
        fs::rename(self.resolve(from)?, self.resolve(to)?)
    }

    fn remove_file(&self, path: &str) -> io::Result<()> {
        fs::remove_file(self.resolve(path)?)
    }

    fn list_dir(&self, path: &str) -> io::Result<Vec<RemoteEntry>> {
        let mut entries = Vec::new();
        for entry in fs::read_dir(self.resolve(path)?)? {
            let entry = entry?;
            let metadata = entry.metadata()?;
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir: metadata.is_dir(),
                size: if metadata.is_dir() { 0 } else { metadata.len() },
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    fn set_modified(&self, path: &str, at: DateTime<Utc>) -> io::Result<()> {
        let mtime = filetime::FileTime::from_unix_time(at.timestamp(), at.timestamp_subsec_nanos());
        filetime::set_file_mtime(self.resolve(path)?, mtime)
    }
}

/// Outcome of a successful connection test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionReport {
    pub location: String,
    /// Top-level directories visible at the destination base path
    pub top_level_directories: usize,
}

/// What to upload and where.
#[derive(Debug, Clone)]
pub struct UploadRequest<'a> {
    pub destination_path: &'a str,
    pub expected_length: Option<u64>,
    /// Stamped on the committed file when the protocol supports it
    pub modified_at: Option<DateTime<Utc>>,
}

/// Capability surface of one concrete remote-filesystem protocol.
pub trait ProtocolAdapter: Send {
    fn test_connection(&self) -> Result<ConnectionReport, TransferError>;

    /// Names of the directories directly under `path`, sorted.
    fn list_directories(&self, path: &str) -> Result<Vec<String>, TransferError>;

    /// Atomically upload `source` to the requested path. Blocks for the
    /// duration of the transfer.
    fn upload_file(
        &self,
        request: &UploadRequest<'_>,
        source: &mut dyn Read,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<TransferReceipt, TransferError>;
}

/// [`ProtocolAdapter`] over any [`RemoteFs`] session.
pub struct ShareAdapter<F: RemoteFs> {
    fs: F,
    base_path: String,
    options: TransferOptions,
}

impl<F: RemoteFs> ShareAdapter<F> {
    pub fn new(fs: F, base_path: impl Into<String>, options: TransferOptions) -> Self {
        ShareAdapter {
            fs,
            base_path: base_path.into(),
            options,
        }
    }

    pub fn remote_fs(&self) -> &F {
        &self.fs
    }
}

impl<F: RemoteFs> ProtocolAdapter for ShareAdapter<F> {
    fn test_connection(&self) -> Result<ConnectionReport, TransferError> {
        let location = self.fs.describe();
        self.fs
            .probe()
            .map_err(|e| TransferError::remote(location.clone(), e))?;
        let top_level_directories = self.list_directories(&self.base_path)?.len();
        debug!(%location, top_level_directories, "connection test succeeded");
        Ok(ConnectionReport {
            location,
            top_level_directories,
        })
    }

    fn list_directories(&self, path: &str) -> Result<Vec<String>, TransferError> {
        let normalized = transfer::normalize_remote_path(path)?;
        let entries = self
            .fs
            .list_dir(&normalized)
            .map_err(|e| TransferError::remote(normalized.clone(), e))?;
        Ok(entries
            .into_iter()
            .filter(|e| e.is_dir && !e.name.starts_with('.'))
            .map(|e| e.name)
            .collect())
    }

    fn upload_file(
        &self,
        request: &UploadRequest<'_>,
        source: &mut dyn Read,
        on_progress: &mut dyn FnMut(u64),
    ) -> Result<TransferReceipt, TransferError> {
        let receipt = transfer::transfer(
            &self.fs,
            request.destination_path,
            request.expected_length,
            source,
            &self.options,
            on_progress,
        )?;

        if let Some(at) = request.modified_at {
            match self.fs.set_modified(&receipt.remote_path, at) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Unsupported => {}
                Err(e) => warn!(path = %receipt.remote_path, error = %e, "failed to set modification time"),
            }
        }

        Ok(receipt)
    }
}

/// Opens a protocol session for a resolved destination.
pub trait AdapterFactory: Send + Sync {
    fn connect(
        &self,
        destination: &Destination,
        credentials: &Credentials,
        options: &TransferOptions,
    ) -> Result<Box<dyn ProtocolAdapter>, TransferError>;
}

/// Connects to shares mounted under `<mount_root>/<host>/<share>`.
///
/// A missing host directory is reported as an unreachable host and a
/// missing share as a missing destination. If the share root carries an
/// access list file, the credentials' username must appear in it.
#[derive(Debug, Clone)]
pub struct MountedShareConnector {
    mount_root: PathBuf,
}

impl MountedShareConnector {
    pub fn new(mount_root: impl Into<PathBuf>) -> Self {
        MountedShareConnector {
            mount_root: mount_root.into(),
        }
    }

    pub fn mount_root(&self) -> &Path {
        &self.mount_root
    }

    fn check_access(share_root: &Path, destination: &Destination, username: &str) -> io::Result<()> {
        let list = match fs::read_to_string(share_root.join(ACCESS_LIST_FILE)) {
            Ok(list) => list,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if list.lines().map(str::trim).any(|line| line == username) {
            Ok(())
        } else {
            Err(AuthenticationRejected {
                host: destination.host.clone(),
            }
            .into_io_error())
        }
    }
}

fn single_segment(value: &str, what: &str) -> Result<(), TransferError> {
    if value.is_empty() || value == "." || value == ".." || value.contains(['/', '\\']) {
        return Err(TransferError::InvalidPath(format!("{} '{}'", what, value)));
    }
    Ok(())
}

impl AdapterFactory for MountedShareConnector {
    fn connect(
        &self,
        destination: &Destination,
        credentials: &Credentials,
        options: &TransferOptions,
    ) -> Result<Box<dyn ProtocolAdapter>, TransferError> {
        single_segment(&destination.host, "host")?;
        single_segment(&destination.share, "share")?;

        let host_root = self.mount_root.join(&destination.host);
        if !host_root.is_dir() {
            return Err(TransferError::Remote {
                kind: FailureKind::HostUnreachable,
                path: destination.host.clone(),
                source: io::Error::new(
                    io::ErrorKind::NotConnected,
                    format!("host is not mounted at {}", host_root.display()),
                ),
            });
        }

        let share_root = host_root.join(&destination.share);
        let location = format!("{}/{}", destination.host, destination.share);
        let share = MountedShare::new(&share_root);
        share
            .probe()
            .map_err(|e| TransferError::remote(location.clone(), e))?;
        Self::check_access(&share_root, destination, &credentials.username)
            .map_err(|e| TransferError::remote(location.clone(), e))?;

        debug!(%location, "connected to mounted share");
        Ok(Box::new(ShareAdapter::new(
            share,
            destination.base_path.clone(),
            *options,
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn destination(host: &str, share: &str) -> Destination {
        Destination {
            destination_id: "nas".to_string(),
            host: host.to_string(),
            share: share.to_string(),
            base_path: "backup".to_string(),
            username: "alice".to_string(),
            credential_alias: "nas".to_string(),
        }
    }

    fn credentials(username: &str) -> Credentials {
        Credentials {
            username: username.to_string(),
            secret: "secret".to_string(),
        }
    }

    #[test]
    fn test_mounted_share_rejects_escaping_paths() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let share = MountedShare::new(temp_dir.path());
        let err = share.open_write("../outside.txt").err().expect("must fail");
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_list_dir_is_sorted() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir(temp_dir.path().join("b")).expect("mkdir b");
        fs::create_dir(temp_dir.path().join("a")).expect("mkdir a");
        fs::write(temp_dir.path().join("c.txt"), b"abc").expect("write c");

        let share = MountedShare::new(temp_dir.path());
        let entries = share.list_dir("").expect("list");
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c.txt"]);
        assert_eq!(entries[2].size, 3);
        assert!(!entries[2].is_dir);
    }

    #[test]
    fn test_connector_classifies_missing_host_and_share() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let connector = MountedShareConnector::new(temp_dir.path());

        let err = connector
            .connect(&destination("nas", "photos"), &credentials("alice"), &TransferOptions::default())
            .err()
            .expect("host missing");
        assert_eq!(err.kind(), FailureKind::HostUnreachable);

        fs::create_dir(temp_dir.path().join("nas")).expect("mkdir host");
        let err = connector
            .connect(&destination("nas", "photos"), &credentials("alice"), &TransferOptions::default())
            .err()
            .expect("share missing");
        assert_eq!(err.kind(), FailureKind::DestinationNotFound);
    }

    #[test]
    fn test_connector_enforces_access_list() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let share_root = temp_dir.path().join("nas").join("photos");
        fs::create_dir_all(&share_root).expect("mkdir share");
        fs::write(share_root.join(ACCESS_LIST_FILE), "alice\n").expect("write access list");

        let connector = MountedShareConnector::new(temp_dir.path());
        assert!(connector
            .connect(&destination("nas", "photos"), &credentials("alice"), &TransferOptions::default())
            .is_ok());

        let err = connector
            .connect(&destination("nas", "photos"), &credentials("mallory"), &TransferOptions::default())
            .err()
            .expect("rejected");
        assert_eq!(err.kind(), FailureKind::AuthenticationFailed);
    }

    #[test]
    fn test_adapter_lists_directories_and_tests_connection() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        fs::create_dir_all(temp_dir.path().join("backup/2024")).expect("mkdir");
        fs::create_dir_all(temp_dir.path().join("backup/.hidden")).expect("mkdir hidden");
        fs::write(temp_dir.path().join("backup/readme.txt"), b"x").expect("write");

        let adapter = ShareAdapter::new(
            MountedShare::new(temp_dir.path()),
            "backup",
            TransferOptions::default(),
        );
        assert_eq!(adapter.list_directories("backup").expect("list"), vec!["2024"]);

        let report = adapter.test_connection().expect("connection");
        assert_eq!(report.top_level_directories, 1);
    }

    #[test]
    fn test_upload_stamps_modification_time() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let adapter = ShareAdapter::new(
            MountedShare::new(temp_dir.path()),
            "",
            TransferOptions::default(),
        );
        let taken_at = DateTime::parse_from_rfc3339("2021-06-01T12:00:00Z")
            .expect("timestamp")
            .with_timezone(&Utc);
        let request = UploadRequest {
            destination_path: "2021/06/a.jpg",
            expected_length: Some(5),
            modified_at: Some(taken_at),
        };

        let receipt = adapter
            .upload_file(&request, &mut &b"hello"[..], &mut |_| {})
            .expect("upload");
        assert_eq!(receipt.bytes_written, 5);

        let metadata = fs::metadata(temp_dir.path().join("2021/06/a.jpg")).expect("metadata");
        let mtime = filetime::FileTime::from_last_modification_time(&metadata);
        assert_eq!(mtime.unix_seconds(), taken_at.timestamp());
    }
}
