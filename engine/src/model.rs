//! Core data model for runs, run logs and the dedup ledger.
//!
//! This module defines the main data structures shared by every component:
//! - Run: one execution attempt of a job, with its lifecycle status
//! - RunLogEntry: append-only diagnostic record tied to a run
//! - DedupRecord: proof that an item of a job was already transferred
//! - SourceItem, JobConfig, Destination: the contracts of external collaborators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use uuid::Uuid;

/// Lifecycle status of a run.
///
/// `Running` and `CancelRequested` are active; every other status is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Running,
    CancelRequested,
    Success,
    Partial,
    Failed,
    Canceled,
    Interrupted,
}

impl RunStatus {
    /// Statuses a run may hold while an executor is (believed to be) working on it.
    pub const ACTIVE: [RunStatus; 2] = [RunStatus::Running, RunStatus::CancelRequested];

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::CancelRequested => "CANCEL_REQUESTED",
            Self::Success => "SUCCESS",
            Self::Partial => "PARTIAL",
            Self::Failed => "FAILED",
            Self::Canceled => "CANCELED",
            Self::Interrupted => "INTERRUPTED",
        }
    }

    /// Parse the persisted representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "RUNNING" => Some(Self::Running),
            "CANCEL_REQUESTED" => Some(Self::CancelRequested),
            "SUCCESS" => Some(Self::Success),
            "PARTIAL" => Some(Self::Partial),
            "FAILED" => Some(Self::Failed),
            "CANCELED" => Some(Self::Canceled),
            "INTERRUPTED" => Some(Self::Interrupted),
            _ => None,
        }
    }

    /// Returns true if this status is terminal (no further transitions expected).
    pub fn is_terminal(&self) -> bool {
        !self.is_active()
    }

    pub fn is_active(&self) -> bool {
        matches!(self, Self::Running | Self::CancelRequested)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Coarse progress marker of a run, for diagnostics only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Starting,
    Resolving,
    Scanning,
    Transferring,
    Paused,
    Finalizing,
    Finished,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Resolving => "resolving",
            Self::Scanning => "scanning",
            Self::Transferring => "transferring",
            Self::Paused => "paused",
            Self::Finalizing => "finalizing",
            Self::Finished => "finished",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "starting" => Some(Self::Starting),
            "resolving" => Some(Self::Resolving),
            "scanning" => Some(Self::Scanning),
            "transferring" => Some(Self::Transferring),
            "paused" => Some(Self::Paused),
            "finalizing" => Some(Self::Finalizing),
            "finished" => Some(Self::Finished),
            _ => None,
        }
    }
}

impl fmt::Display for RunPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a run to be started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerSource {
    Manual,
    Schedule,
    Startup,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Manual => "manual",
            Self::Schedule => "schedule",
            Self::Startup => "startup",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(Self::Manual),
            "schedule" => Some(Self::Schedule),
            "startup" => Some(Self::Startup),
            _ => None,
        }
    }
}

/// How the host executes the run.
///
/// Background runs are typically subject to an execution-time budget and
/// pause for continuation when it is exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Foreground,
    Background,
}

impl ExecutionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::Background => "background",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "foreground" => Some(Self::Foreground),
            "background" => Some(Self::Background),
            _ => None,
        }
    }
}

/// Per-run item counters. All four are monotonic within a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub scanned: u64,
    pub uploaded: u64,
    pub skipped: u64,
    pub failed: u64,
}

impl RunCounters {
    /// Terminal status for a run that processed items normally.
    ///
    /// Failures with no success or skip at all is `Failed`, failures mixed with
    /// successes or skips is `Partial`, and no failures is `Success`.
    pub fn final_status(&self) -> RunStatus {
        let settled = self.uploaded + self.skipped;
        if self.failed == 0 {
            RunStatus::Success
        } else if settled == 0 {
            RunStatus::Failed
        } else {
            RunStatus::Partial
        }
    }
}

/// One execution attempt of a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub run_id: Uuid,
    pub job_id: String,
    pub status: RunStatus,
    pub phase: RunPhase,
    pub started_at: DateTime<Utc>,
    /// Set exactly once, when the run reaches a terminal status
    pub finished_at: Option<DateTime<Utc>>,
    pub heartbeat_at: DateTime<Utc>,
    pub counters: RunCounters,
    /// First failure message encountered during the run
    pub summary_error: Option<String>,
    pub trigger_source: TriggerSource,
    pub execution_mode: ExecutionMode,
    /// Opaque resume token, see [`ContinuationCursor`]
    pub continuation_cursor: Option<String>,
    pub resume_count: u32,
    pub last_progress_at: Option<DateTime<Utc>>,
}

impl Run {
    /// True while the run holds an active status and has not been finalized.
    pub fn is_active(&self) -> bool {
        self.status.is_active() && self.finished_at.is_none()
    }
}

/// Parameters for creating a run row.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub job_id: String,
    pub trigger_source: TriggerSource,
    pub execution_mode: ExecutionMode,
    pub started_at: DateTime<Utc>,
}

/// Terminal write applied to a run that is still unfinished.
#[derive(Debug, Clone)]
pub struct Finalization {
    pub status: RunStatus,
    pub finished_at: DateTime<Utc>,
    /// Counters to persist alongside the status; `None` keeps the stored ones
    pub counters: Option<RunCounters>,
    pub summary_error: Option<String>,
    pub clear_cursor: bool,
    /// Only apply while the stored status still equals this one
    pub expected_status: Option<RunStatus>,
}

impl Finalization {
    pub fn new(status: RunStatus, finished_at: DateTime<Utc>) -> Self {
        Finalization {
            status,
            finished_at,
            counters: None,
            summary_error: None,
            clear_cursor: true,
            expected_status: None,
        }
    }

    pub fn only_if_status(mut self, status: RunStatus) -> Self {
        self.expected_status = Some(status);
        self
    }
}

/// Severity of a persisted run log entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}

impl LogSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(Self::Info),
            "WARN" => Some(Self::Warn),
            "ERROR" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only diagnostic record tied to a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunLogEntry {
    pub log_id: i64,
    pub run_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub severity: LogSeverity,
    pub message: String,
    pub detail: Option<String>,
}

/// Proof that item `item_id` of job `job_id` was already transferred.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupRecord {
    /// Assigned by the ledger on insert; ignored when inserting
    pub record_id: i64,
    pub job_id: String,
    pub item_id: String,
    pub remote_path: String,
    pub uploaded_at: DateTime<Utc>,
}

/// One source item produced by an item enumerator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceItem {
    /// Stable identity of the item within its job
    pub id: String,
    pub display_name: Option<String>,
    pub mime_type: Option<String>,
    pub taken_at: Option<DateTime<Utc>>,
    pub size_bytes: Option<u64>,
    /// `/`-separated path relative to the source root, if the source has one
    pub relative_path: Option<String>,
}

impl SourceItem {
    /// Minimal item with only an identity.
    pub fn new(id: impl Into<String>) -> Self {
        SourceItem {
            id: id.into(),
            display_name: None,
            mime_type: None,
            taken_at: None,
            size_bytes: None,
            relative_path: None,
        }
    }

    /// Best available file name for the item.
    pub fn file_name(&self) -> &str {
        if let Some(name) = self.display_name.as_deref().filter(|n| !n.is_empty()) {
            return name;
        }
        if let Some(rel) = self.relative_path.as_deref() {
            if let Some(name) = rel.rsplit('/').next().filter(|n| !n.is_empty()) {
                return name;
            }
        }
        self.id.rsplit('/').next().unwrap_or(&self.id)
    }
}

/// A configured transfer task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub job_id: String,
    #[serde(default)]
    pub name: String,
    /// Root the item source enumerates from
    pub source_root: PathBuf,
    #[serde(default = "default_path_template")]
    pub path_template: String,
    pub destination_id: String,
}

fn default_path_template() -> String {
    "{year}/{month}/{name}".to_string()
}

/// Where a job's items are transferred to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Destination {
    pub destination_id: String,
    pub host: String,
    pub share: String,
    #[serde(default)]
    pub base_path: String,
    #[serde(default)]
    pub username: String,
    pub credential_alias: String,
}

/// Credentials resolved for a destination.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub secret: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &"<redacted>")
            .finish()
    }
}

/// Position of the next unprocessed item of a paused run.
///
/// Callers treat the encoded form as an opaque token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContinuationCursor {
    pub next_index: usize,
    pub next_item_id: String,
}

impl ContinuationCursor {
    pub fn encode(&self) -> String {
        // Serializing two plain fields cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(token: &str) -> Option<Self> {
        serde_json::from_str(token).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_round_trips_through_persisted_form() {
        for status in [
            RunStatus::Running,
            RunStatus::CancelRequested,
            RunStatus::Success,
            RunStatus::Partial,
            RunStatus::Failed,
            RunStatus::Canceled,
            RunStatus::Interrupted,
        ] {
            assert_eq!(RunStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(RunStatus::parse("running"), None);
    }

    #[test]
    fn test_only_running_and_cancel_requested_are_active() {
        assert!(RunStatus::Running.is_active());
        assert!(RunStatus::CancelRequested.is_active());
        assert!(RunStatus::Canceled.is_terminal());
        assert!(RunStatus::Interrupted.is_terminal());
        assert!(RunStatus::Success.is_terminal());
    }

    #[test]
    fn test_final_status_aggregation() {
        let partial = RunCounters { scanned: 5, uploaded: 3, skipped: 1, failed: 1 };
        assert_eq!(partial.final_status(), RunStatus::Partial);

        let success = RunCounters { scanned: 5, uploaded: 5, skipped: 0, failed: 0 };
        assert_eq!(success.final_status(), RunStatus::Success);

        let failed = RunCounters { scanned: 1, uploaded: 0, skipped: 0, failed: 1 };
        assert_eq!(failed.final_status(), RunStatus::Failed);

        let skipped_only = RunCounters { scanned: 2, uploaded: 0, skipped: 1, failed: 1 };
        assert_eq!(skipped_only.final_status(), RunStatus::Partial);

        assert_eq!(RunCounters::default().final_status(), RunStatus::Success);
    }

    #[test]
    fn test_item_file_name_prefers_display_name() {
        let mut item = SourceItem::new("content://media/42");
        assert_eq!(item.file_name(), "42");

        item.relative_path = Some("DCIM/Camera/IMG_1.jpg".to_string());
        assert_eq!(item.file_name(), "IMG_1.jpg");

        item.display_name = Some("holiday.jpg".to_string());
        assert_eq!(item.file_name(), "holiday.jpg");
    }

    #[test]
    fn test_cursor_token_decodes() {
        let cursor = ContinuationCursor { next_index: 7, next_item_id: "b.jpg".to_string() };
        let token = cursor.encode();
        assert_eq!(ContinuationCursor::decode(&token), Some(cursor));
        assert_eq!(ContinuationCursor::decode("not a cursor"), None);
    }

    #[test]
    fn test_credentials_debug_redacts_secret() {
        let creds = Credentials { username: "alice".to_string(), secret: "hunter2".to_string() };
        let rendered = format!("{:?}", creds);
        assert!(rendered.contains("alice"));
        assert!(!rendered.contains("hunter2"));
    }
}
