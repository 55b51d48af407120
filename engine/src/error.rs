//! Error types for the transfer engine.
//!
//! The primary error type is `EngineError`, which represents run-level errors
//! that prevent the engine from recording a run at all (the ledger itself is
//! unusable, an unknown run is resumed). Configuration, scan and per-item
//! failures are recorded on the Run, not returned as EngineError.

use std::io;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Errors from the run ledger and dedup ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("run not found: {0}")]
    NotFound(Uuid),

    /// A dedup record already exists for this (job, item) pair.
    #[error("dedup record already exists for job '{job_id}', item '{item_id}'")]
    Conflict { job_id: String, item_id: String },

    #[error("sqlite error: {0}")]
    Sql(#[from] rusqlite::Error),

    /// A persisted value could not be decoded.
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),

    #[error("ledger schema version {found} is newer than supported {supported}")]
    UnsupportedSchema { found: i64, supported: i64 },

    #[error("ledger connection lock poisoned")]
    LockPoisoned,
}

/// Missing or invalid job/destination/credential configuration.
///
/// Fatal for the run: it is finalized as FAILED with scanned=0.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("job '{0}' is not configured")]
    JobNotFound(String),

    #[error("no destination configured for job '{job_id}' (destination '{destination_id}')")]
    DestinationMissing { job_id: String, destination_id: String },

    #[error("no credentials stored under alias '{0}'")]
    CredentialsMissing(String),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Source item enumeration failed; fatal for the run.
#[derive(Debug, Error)]
#[error("failed to enumerate items under {}: {source}", root.display())]
pub struct ScanError {
    pub root: PathBuf,
    #[source]
    pub source: io::Error,
}

/// Classification of a failed remote operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FailureKind {
    #[error("host unreachable")]
    HostUnreachable,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("destination not found")]
    DestinationNotFound,
    #[error("permission denied")]
    PermissionDenied,
    /// Timed out or interrupted mid-operation
    #[error("timed out")]
    TimedOut,
    #[error("unknown failure")]
    Unknown,
}

/// Marker payload adapters wrap in an `io::Error` when the remote side
/// rejected the supplied credentials.
#[derive(Debug, Error)]
#[error("authentication rejected by {host}")]
pub struct AuthenticationRejected {
    pub host: String,
}

impl AuthenticationRejected {
    pub fn into_io_error(self) -> io::Error {
        io::Error::new(io::ErrorKind::PermissionDenied, self)
    }
}

impl FailureKind {
    /// Classify an I/O error raised by a protocol adapter.
    pub fn classify(err: &io::Error) -> Self {
        use io::ErrorKind;
        if err
            .get_ref()
            .is_some_and(|inner| inner.is::<AuthenticationRejected>())
        {
            return Self::AuthenticationFailed;
        }
        match err.kind() {
            ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::AddrNotAvailable
            | ErrorKind::BrokenPipe => Self::HostUnreachable,
            ErrorKind::NotFound => Self::DestinationNotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::TimedOut | ErrorKind::Interrupted | ErrorKind::WouldBlock => Self::TimedOut,
            _ => Self::Unknown,
        }
    }
}

/// Why a staged upload was rejected before commit.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFailure {
    /// Fewer or more bytes were written than the item declared.
    #[error("truncated: expected {expected} bytes, wrote {actual}")]
    Truncated { expected: u64, actual: u64 },
    /// The staging file's reported size disagrees with the bytes written.
    #[error("size mismatch: staging file reports {reported} bytes, wrote {written}")]
    SizeMismatch { reported: u64, written: u64 },
    /// Re-reading the staging file produced a different digest.
    #[error("checksum mismatch: expected {expected}, read back {actual}")]
    ChecksumMismatch { expected: String, actual: String },
}

/// Failure of a single transfer through the Transfer Channel.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("integrity check failed for {path}: {failure}")]
    Integrity { path: String, failure: IntegrityFailure },

    #[error("{kind} at {path}: {source}")]
    Remote {
        kind: FailureKind,
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read source stream: {0}")]
    SourceRead(#[source] io::Error),

    #[error("invalid destination path '{0}'")]
    InvalidPath(String),
}

impl TransferError {
    /// Wrap an adapter I/O error, classifying it.
    pub fn remote(path: impl Into<String>, source: io::Error) -> Self {
        TransferError::Remote {
            kind: FailureKind::classify(&source),
            path: path.into(),
            source,
        }
    }

    /// Classification used for counters and logs.
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Remote { kind, .. } => *kind,
            Self::InvalidPath(_) => FailureKind::DestinationNotFound,
            Self::Integrity { .. } | Self::SourceRead(_) => FailureKind::Unknown,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::Integrity { .. })
    }
}

/// Errors that stop the engine from executing or recording a run.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("run ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("run {0} does not exist")]
    RunNotFound(Uuid),

    /// A resume was requested for a run that cannot continue.
    #[error("cannot resume run {run_id}: {reason}")]
    InvalidResume { run_id: Uuid, reason: String },
}

/// Errors loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigurationError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_io_errors() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, FailureKind::HostUnreachable),
            (io::ErrorKind::NotFound, FailureKind::DestinationNotFound),
            (io::ErrorKind::PermissionDenied, FailureKind::PermissionDenied),
            (io::ErrorKind::TimedOut, FailureKind::TimedOut),
            (io::ErrorKind::Interrupted, FailureKind::TimedOut),
            (io::ErrorKind::Other, FailureKind::Unknown),
        ];
        for (kind, expected) in cases {
            assert_eq!(FailureKind::classify(&io::Error::new(kind, "x")), expected);
        }

        let auth = AuthenticationRejected { host: "nas".to_string() }.into_io_error();
        assert_eq!(FailureKind::classify(&auth), FailureKind::AuthenticationFailed);
    }

    #[test]
    fn test_transfer_error_messages() {
        let err = TransferError::remote("photos/a.jpg", io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), FailureKind::PermissionDenied);
        assert!(err.to_string().starts_with("permission denied at photos/a.jpg"));

        let err = TransferError::Integrity {
            path: "photos/a.jpg".to_string(),
            failure: IntegrityFailure::ChecksumMismatch {
                expected: "aa".to_string(),
                actual: "bb".to_string(),
            },
        };
        assert!(err.is_integrity());
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_failure_descriptions_are_errors() {
        let truncated = IntegrityFailure::Truncated { expected: 10, actual: 4 };
        assert_eq!(truncated.to_string(), "truncated: expected 10 bytes, wrote 4");
        let mismatch = IntegrityFailure::SizeMismatch { reported: 3, written: 4 };
        assert_eq!(mismatch.to_string(), "size mismatch: staging file reports 3 bytes, wrote 4");

        let as_error: &dyn std::error::Error = &FailureKind::AuthenticationFailed;
        assert_eq!(as_error.to_string(), "authentication failed");
        assert_eq!(FailureKind::Unknown.to_string(), "unknown failure");
    }
}
