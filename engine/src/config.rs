//! TOML configuration.
//!
//! ```toml
//! database = "sharesync.db"
//! mount_root = "/mnt/shares"
//!
//! [engine]
//! checksum = "md5"
//! chunk_size = 65536
//! time_budget_secs = 540
//!
//! [reconciler]
//! stale_running_after_secs = 3600
//!
//! [[destination]]
//! destination_id = "nas"
//! host = "nas.local"
//! share = "photos"
//! base_path = "backup"
//! username = "alice"
//! credential_alias = "nas"
//!
//! [[job]]
//! job_id = "camera"
//! source_root = "/home/alice/Pictures"
//! path_template = "{year}/{month}/{name}"
//! destination_id = "nas"
//! ```
//!
//! Every key has a default, so an empty file is a valid configuration.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::checksums::ChecksumAlgorithm;
use crate::error::{ConfigError, ConfigurationError};
use crate::job::EngineSettings;
use crate::model::{Destination, JobConfig};
use crate::reconciler::ReconcilerSettings;
use crate::sources::{DestinationResolver, JobResolver};
use crate::transfer::DEFAULT_CHUNK_SIZE;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// SQLite ledger file
    pub database: PathBuf,
    /// Directory holding mounted shares as `<host>/<share>`
    pub mount_root: PathBuf,
    pub engine: EngineSection,
    pub reconciler: ReconcilerSection,
    #[serde(rename = "job")]
    pub jobs: Vec<JobConfig>,
    #[serde(rename = "destination")]
    pub destinations: Vec<Destination>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database: PathBuf::from("sharesync.db"),
            mount_root: PathBuf::from("mounts"),
            engine: EngineSection::default(),
            reconciler: ReconcilerSection::default(),
            jobs: Vec::new(),
            destinations: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineSection {
    pub checksum: ChecksumAlgorithm,
    pub chunk_size: usize,
    /// Pause for continuation after this many seconds; unset runs to completion
    pub time_budget_secs: Option<u64>,
}

impl Default for EngineSection {
    fn default() -> Self {
        EngineSection {
            checksum: ChecksumAlgorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            time_budget_secs: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReconcilerSection {
    pub batch_limit: usize,
    pub stale_cancel_requested_after_secs: u64,
    pub stale_running_after_secs: u64,
    /// Sweep period of `reconcile --watch`
    pub watch_interval_secs: u64,
}

impl Default for ReconcilerSection {
    fn default() -> Self {
        ReconcilerSection {
            batch_limit: 100,
            stale_cancel_requested_after_secs: 15 * 60,
            stale_running_after_secs: 60 * 60,
            watch_interval_secs: 60,
        }
    }
}

// chrono durations are bounded at i64::MAX milliseconds
fn chrono_seconds(secs: u64) -> chrono::Duration {
    let max = (i64::MAX / 1000) as u64;
    chrono::Duration::seconds(secs.min(max) as i64)
}

impl EngineConfig {
    /// Read and validate a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&text, path)
    }

    /// Parse configuration text; `origin` is only used in error messages.
    pub fn parse(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        let invalid = |msg: String| Err(ConfigurationError::Invalid(msg));

        if self.engine.chunk_size == 0 {
            return invalid("engine.chunk_size must be greater than zero".to_string());
        }
        if self.reconciler.batch_limit == 0 {
            return invalid("reconciler.batch_limit must be greater than zero".to_string());
        }
        if self.reconciler.watch_interval_secs == 0 {
            return invalid("reconciler.watch_interval_secs must be greater than zero".to_string());
        }

        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.job_id.is_empty() {
                return invalid("job with empty job_id".to_string());
            }
            if !seen.insert(job.job_id.as_str()) {
                return invalid(format!("duplicate job '{}'", job.job_id));
            }
        }

        let mut seen = HashSet::new();
        for destination in &self.destinations {
            if destination.destination_id.is_empty() {
                return invalid("destination with empty destination_id".to_string());
            }
            if !seen.insert(destination.destination_id.as_str()) {
                return invalid(format!("duplicate destination '{}'", destination.destination_id));
            }
        }
        Ok(())
    }

    pub fn engine_settings(&self) -> EngineSettings {
        EngineSettings {
            checksum: self.engine.checksum,
            chunk_size: self.engine.chunk_size,
            time_budget: self.engine.time_budget_secs.map(Duration::from_secs),
        }
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            batch_limit: self.reconciler.batch_limit,
            stale_cancel_requested_after: chrono_seconds(self.reconciler.stale_cancel_requested_after_secs),
            stale_running_after: chrono_seconds(self.reconciler.stale_running_after_secs),
        }
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_secs(self.reconciler.watch_interval_secs)
    }

    pub fn catalog(&self) -> Catalog {
        Catalog::new(self.jobs.clone(), self.destinations.clone())
    }
}

/// Job and destination lookup over configured entries.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    jobs: HashMap<String, JobConfig>,
    destinations: HashMap<String, Destination>,
}

impl Catalog {
    pub fn new(jobs: Vec<JobConfig>, destinations: Vec<Destination>) -> Self {
        Catalog {
            jobs: jobs.into_iter().map(|j| (j.job_id.clone(), j)).collect(),
            destinations: destinations
                .into_iter()
                .map(|d| (d.destination_id.clone(), d))
                .collect(),
        }
    }

    pub fn destination(&self, destination_id: &str) -> Option<&Destination> {
        self.destinations.get(destination_id)
    }

    pub fn job_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.jobs.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }
}

impl JobResolver for Catalog {
    fn resolve_job(&self, job_id: &str) -> Result<JobConfig, ConfigurationError> {
        self.jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| ConfigurationError::JobNotFound(job_id.to_string()))
    }
}

impl DestinationResolver for Catalog {
    fn resolve_destination(&self, job: &JobConfig) -> Result<Destination, ConfigurationError> {
        self.destinations
            .get(&job.destination_id)
            .cloned()
            .ok_or_else(|| ConfigurationError::DestinationMissing {
                job_id: job.job_id.clone(),
                destination_id: job.destination_id.clone(),
            })
    }
}
