//! # ShareSync Engine - Resumable Transfer Library
//!
//! A headless engine that copies a job's source items to a remote share,
//! surviving crashes and restarts without duplicating transfers or leaving
//! half-written files under their final names.
//! Designed as the foundation for multiple front ends (CLI, services, automation).
//!
//! ## Overview
//!
//! - Persisted run lifecycle with heartbeats, counters and continuation cursors
//! - Dedup ledger keyed by (job, item) so re-runs skip what already arrived
//! - Atomic uploads: staged write, size and checksum round-trip, then rename
//! - Cooperative cancellation checked between items
//! - Liveness reconciler that closes runs whose engine died
//! - Progress reporting via callbacks (decoupled from UI technology)
//!
//! ## Basic Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use engine::{
//!     Collaborators, DirectorySource, EngineConfig, EnvCredentialStore, ExecutionMode,
//!     MountedShareConnector, RunEngine, SqliteLedger, TemplateRenderer, TriggerSource,
//! };
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = EngineConfig::load("sharesync.toml")?;
//! let ledger = Arc::new(SqliteLedger::open(&config.database)?);
//! let catalog = Arc::new(config.catalog());
//!
//! let engine = RunEngine::new(
//!     Collaborators {
//!         runs: ledger.clone(),
//!         dedup: ledger,
//!         jobs: catalog.clone(),
//!         destinations: catalog,
//!         credentials: Arc::new(EnvCredentialStore::default()),
//!         items: Arc::new(DirectorySource),
//!         renderer: Arc::new(TemplateRenderer),
//!         adapters: Arc::new(MountedShareConnector::new(&config.mount_root)),
//!     },
//!     config.engine_settings(),
//! );
//!
//! let outcome = engine.start_run("camera", TriggerSource::Manual, ExecutionMode::Foreground, None)?;
//! println!("{}: {:?}", outcome.run().status, outcome.run().counters);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (Run, RunStatus, DedupRecord, SourceItem)
//! - **error**: Error types and failure classification
//! - **ledger**: Run ledger and dedup ledger persistence (SQLite)
//! - **job**: Run engine (start, pause, resume)
//! - **control**: Cooperative stop requests
//! - **reconciler**: Heartbeat staleness sweep
//! - **transfer**: Atomic staged upload protocol
//! - **destination**: Remote filesystem sessions and protocol adapters
//! - **sources**: Job, destination, credential and item collaborators
//! - **fs_ops**: Local source tree enumeration
//! - **config**: TOML configuration
//! - **progress**: Progress callback trait
//! - **checksums**: Checksum computation

pub mod model;
pub mod error;
pub mod ledger;
pub mod job;
pub mod control;
pub mod reconciler;
pub mod transfer;
pub mod destination;
pub mod sources;
pub mod fs_ops;
pub mod config;
pub mod progress;
pub mod checksums;

// Re-export main types and functions
pub use model::{
    ContinuationCursor, Credentials, DedupRecord, Destination, ExecutionMode, JobConfig,
    LogSeverity, Run, RunCounters, RunLogEntry, RunPhase, RunStatus, SourceItem, TriggerSource,
};
pub use error::{
    ConfigError, ConfigurationError, EngineError, FailureKind, IntegrityFailure, LedgerError,
    ScanError, TransferError,
};
pub use ledger::{DedupStore, JobPurge, RunStore, SqliteLedger};
pub use job::{Collaborators, EngineSettings, RunEngine, RunOutcome};
pub use control::{CancellationController, InterruptOutcome, StopOutcome};
pub use reconciler::{LivenessReconciler, ReconcileReport, ReconcilerSettings};
pub use transfer::{join_remote, transfer, TransferOptions, TransferReceipt};
pub use destination::{
    AdapterFactory, ConnectionReport, MountedShare, MountedShareConnector, ProtocolAdapter,
    RemoteFs, ShareAdapter, UploadRequest,
};
pub use sources::{
    resolve_credentials, CredentialStore, DestinationResolver, DirectorySource, EnvCredentialStore, ItemSource,
    JobResolver, MemoryCredentialStore, PathRenderer, RenderContext, TemplateRenderer,
};
pub use config::{Catalog, EngineConfig};
pub use progress::{FailureReason, ItemOutcome, ProgressCallback};
pub use checksums::{ChecksumAlgorithm, ChecksumValue};
