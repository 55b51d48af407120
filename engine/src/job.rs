//! Run orchestration.
//!
//! This module provides the run lifecycle:
//! - Starting a run for a job (resolve, scan, transfer, finalize)
//! - Pausing a run for continuation when its time budget runs out
//! - Resuming a paused run from its continuation cursor
//!
//! Per-item failures are counted and logged; they never abort the run.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;
use crate::destination::{AdapterFactory, ProtocolAdapter, UploadRequest};
use crate::error::{EngineError, FailureKind, TransferError};
use crate::ledger::{DedupStore, RunStore};
use crate::model::{
    ContinuationCursor, Credentials, DedupRecord, Destination, ExecutionMode, Finalization,
    JobConfig, LogSeverity, NewRun, Run, RunPhase, RunStatus, SourceItem, TriggerSource,
};
use crate::progress::{FailureReason, ItemOutcome, ProgressCallback};
use crate::sources::{
    resolve_credentials, CredentialStore, DestinationResolver, ItemSource, JobResolver,
    PathRenderer, RenderContext,
};
use crate::transfer::{TransferOptions, DEFAULT_CHUNK_SIZE};

pub const RUN_STARTED_LOG: &str = "Run started";
pub const RUN_FINISHED_LOG: &str = "Run finished";
pub const RUN_PAUSED_LOG: &str = "Run paused for continuation";
pub const RUN_RESUMED_LOG: &str = "Run resumed";
pub const ITEM_FAILED_LOG: &str = "Item transfer failed";
pub const DEDUP_WRITE_FAILED_LOG: &str = "Uploaded item has no dedup record";

/// Everything the engine talks to, injected at construction.
#[derive(Clone)]
pub struct Collaborators {
    pub runs: Arc<dyn RunStore>,
    pub dedup: Arc<dyn DedupStore>,
    pub jobs: Arc<dyn JobResolver>,
    pub destinations: Arc<dyn DestinationResolver>,
    pub credentials: Arc<dyn CredentialStore>,
    pub items: Arc<dyn ItemSource>,
    pub renderer: Arc<dyn PathRenderer>,
    pub adapters: Arc<dyn AdapterFactory>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineSettings {
    pub checksum: ChecksumAlgorithm,
    pub chunk_size: usize,
    /// Wall-clock budget per invocation; when exceeded between items the
    /// run pauses for continuation instead of finishing.
    pub time_budget: Option<Duration>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings {
            checksum: ChecksumAlgorithm::Md5,
            chunk_size: DEFAULT_CHUNK_SIZE,
            time_budget: None,
        }
    }
}

impl EngineSettings {
    pub fn transfer_options(&self) -> TransferOptions {
        TransferOptions {
            algorithm: self.checksum,
            chunk_size: self.chunk_size,
        }
    }
}

/// How an engine invocation ended.
#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    /// The run reached a terminal status
    Finished(Run),
    /// The run is still RUNNING and continues with `resume_run(run_id, cursor)`
    Paused { run: Run, cursor: String },
}

impl RunOutcome {
    pub fn run(&self) -> &Run {
        match self {
            RunOutcome::Finished(run) => run,
            RunOutcome::Paused { run, .. } => run,
        }
    }
}

/// Resolved configuration for one run.
struct JobContext {
    job: JobConfig,
    destination: Destination,
    credentials: Credentials,
}

/// In-memory state of the run being executed.
struct Execution<'a> {
    run: Run,
    first_error: Option<String>,
    progress: Option<&'a dyn ProgressCallback>,
    invocation_started: Instant,
}

impl Execution<'_> {
    fn run_id(&self) -> Uuid {
        self.run.run_id
    }

    fn record_failure(&mut self, message: &str) {
        self.run.counters.failed += 1;
        self.note_error(message);
    }

    /// Keeps the earliest error, including one carried over from a pause.
    fn note_error(&mut self, message: &str) {
        if self.first_error.is_none() {
            self.first_error = Some(message.to_string());
        }
    }
}

pub struct RunEngine {
    collaborators: Collaborators,
    settings: EngineSettings,
}

impl RunEngine {
    pub fn new(collaborators: Collaborators, settings: EngineSettings) -> Self {
        RunEngine {
            collaborators,
            settings,
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    /// Execute a new run of `job_id`.
    ///
    /// Configuration and enumeration failures finalize the run as FAILED
    /// with scanned=0 and are returned as a finished outcome, not an error.
    /// `EngineError` means the run ledger itself could not be used.
    pub fn start_run(
        &self,
        job_id: &str,
        trigger_source: TriggerSource,
        execution_mode: ExecutionMode,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<RunOutcome, EngineError> {
        let runs = &self.collaborators.runs;
        let run = runs.create_run(&NewRun {
            job_id: job_id.to_string(),
            trigger_source,
            execution_mode,
            started_at: Utc::now(),
        })?;
        runs.append_log(
            run.run_id,
            LogSeverity::Info,
            RUN_STARTED_LOG,
            Some(&format!("trigger={} mode={}", trigger_source.as_str(), execution_mode.as_str())),
            run.started_at,
        )?;
        info!(run_id = %run.run_id, job_id, trigger = trigger_source.as_str(), "run started");

        let mut exec = Execution {
            run,
            first_error: None,
            progress,
            invocation_started: Instant::now(),
        };
        if let Some(callback) = exec.progress {
            callback.on_run_started(&exec.run);
        }

        let context = match self.resolve(&mut exec, job_id)? {
            Some(context) => context,
            None => return self.finish(&mut exec),
        };

        let items = match self.scan(&mut exec, &context)? {
            Some(items) => items,
            None => return self.finish(&mut exec),
        };
        exec.run.counters.scanned = items.len() as u64;

        self.process_items(&mut exec, &context, &items, 0)
    }

    /// Continue a run that paused for continuation.
    ///
    /// The run must still be RUNNING and `cursor` must be the token it
    /// persisted. Items are re-enumerated and processing restarts at the
    /// cursor's item, located by id, or by index if the id is gone.
    pub fn resume_run(
        &self,
        run_id: Uuid,
        cursor: &str,
        progress: Option<&dyn ProgressCallback>,
    ) -> Result<RunOutcome, EngineError> {
        let runs = &self.collaborators.runs;
        let run = runs.get_run(run_id)?.ok_or(EngineError::RunNotFound(run_id))?;

        let invalid = |reason: String| EngineError::InvalidResume { run_id, reason };
        if run.status != RunStatus::Running || run.finished_at.is_some() {
            return Err(invalid(format!("run is {}", run.status)));
        }
        if run.continuation_cursor.as_deref() != Some(cursor) {
            return Err(invalid("cursor does not match the run's continuation".to_string()));
        }
        let position = ContinuationCursor::decode(cursor)
            .ok_or_else(|| invalid("cursor is malformed".to_string()))?;

        let now = Utc::now();
        runs.append_log(
            run_id,
            LogSeverity::Info,
            RUN_RESUMED_LOG,
            Some(&format!(
                "resume {} at item '{}' (index {})",
                run.resume_count, position.next_item_id, position.next_index
            )),
            now,
        )?;
        info!(%run_id, job_id = %run.job_id, next_item = %position.next_item_id, "run resumed");

        let job_id = run.job_id.clone();
        let first_error = run.summary_error.clone();
        let mut exec = Execution {
            run,
            first_error,
            progress,
            invocation_started: Instant::now(),
        };
        if let Some(callback) = exec.progress {
            callback.on_run_started(&exec.run);
        }

        let context = match self.resolve(&mut exec, &job_id)? {
            Some(context) => context,
            None => return self.finish(&mut exec),
        };
        let items = match self.scan(&mut exec, &context)? {
            Some(items) => items,
            None => return self.finish(&mut exec),
        };

        let start = items
            .iter()
            .position(|item| item.id == position.next_item_id)
            .unwrap_or_else(|| position.next_index.min(items.len()));
        exec.run.counters.scanned = exec.run.counters.scanned.max(items.len() as u64);

        self.process_items(&mut exec, &context, &items, start)
    }

    /// Resolve job, destination and credentials. A missing piece is recorded
    /// as the run's fatal error and yields `None`.
    fn resolve(&self, exec: &mut Execution<'_>, job_id: &str) -> Result<Option<JobContext>, EngineError> {
        let c = &self.collaborators;
        c.runs
            .record_progress(exec.run_id(), &exec.run.counters, RunPhase::Resolving, Utc::now())?;

        let resolved = c.jobs.resolve_job(job_id).and_then(|job| {
            let destination = c.destinations.resolve_destination(&job)?;
            let credentials = resolve_credentials(c.credentials.as_ref(), &destination)?;
            Ok(JobContext {
                job,
                destination,
                credentials,
            })
        });

        match resolved {
            Ok(context) => Ok(Some(context)),
            Err(e) => {
                error!(run_id = %exec.run_id(), job_id, error = %e, "run configuration unavailable");
                exec.note_error(&e.to_string());
                exec.run.status = RunStatus::Failed;
                Ok(None)
            }
        }
    }

    fn scan(&self, exec: &mut Execution<'_>, context: &JobContext) -> Result<Option<Vec<SourceItem>>, EngineError> {
        self.collaborators.runs.record_progress(
            exec.run_id(),
            &exec.run.counters,
            RunPhase::Scanning,
            Utc::now(),
        )?;

        match self.collaborators.items.enumerate(&context.job) {
            Ok(items) => {
                debug!(run_id = %exec.run_id(), count = items.len(), "items enumerated");
                Ok(Some(items))
            }
            Err(e) => {
                error!(run_id = %exec.run_id(), job_id = %context.job.job_id, error = %e, "item enumeration failed");
                exec.note_error(&e.to_string());
                exec.run.status = RunStatus::Failed;
                Ok(None)
            }
        }
    }

    fn process_items(
        &self,
        exec: &mut Execution<'_>,
        context: &JobContext,
        items: &[SourceItem],
        start: usize,
    ) -> Result<RunOutcome, EngineError> {
        let runs = &self.collaborators.runs;
        runs.record_progress(exec.run_id(), &exec.run.counters, RunPhase::Transferring, Utc::now())?;
        if let Some(callback) = exec.progress {
            callback.on_scan_completed(&exec.run, items.len().saturating_sub(start));
        }

        let mut adapter: Option<Box<dyn ProtocolAdapter>> = None;

        for (index, item) in items.iter().enumerate().skip(start) {
            if let Some(current) = self.stop_observed(exec)? {
                return self.settle_stopped(exec, current, items.len() - index);
            }

            let budget_spent = self
                .settings
                .time_budget
                .is_some_and(|budget| exec.invocation_started.elapsed() >= budget);
            if budget_spent && index > start {
                return self.pause(exec, items, index);
            }

            if let Some(callback) = exec.progress {
                callback.on_item_started(&exec.run, index, item);
            }

            let outcome = self.process_item(exec, context, item, index, &mut adapter)?;
            match &outcome {
                ItemOutcome::Uploaded { .. } => exec.run.counters.uploaded += 1,
                ItemOutcome::Skipped { .. } => exec.run.counters.skipped += 1,
                ItemOutcome::Failed { reason, message } => {
                    exec.record_failure(message);
                    let (severity, log) = match reason {
                        FailureReason::LedgerWrite => (LogSeverity::Error, DEDUP_WRITE_FAILED_LOG),
                        _ => (LogSeverity::Warn, ITEM_FAILED_LOG),
                    };
                    runs.append_log(
                        exec.run_id(),
                        severity,
                        log,
                        Some(&format!("{}: {}", item.id, message)),
                        Utc::now(),
                    )?;
                }
            }

            exec.run.heartbeat_at = Utc::now();
            runs.record_progress(exec.run_id(), &exec.run.counters, RunPhase::Transferring, exec.run.heartbeat_at)?;

            if let Some(callback) = exec.progress {
                callback.on_item_completed(&exec.run, index, item, &outcome);
            }
        }

        exec.run.status = exec.run.counters.final_status();
        self.finish(exec)
    }

    fn process_item(
        &self,
        exec: &Execution<'_>,
        context: &JobContext,
        item: &SourceItem,
        index: usize,
        adapter_slot: &mut Option<Box<dyn ProtocolAdapter>>,
    ) -> Result<ItemOutcome, EngineError> {
        let c = &self.collaborators;
        let job_id = &context.job.job_id;

        if let Some(record) = c.dedup.find_dedup(job_id, &item.id)? {
            debug!(run_id = %exec.run_id(), item_id = %item.id, "already transferred, skipping");
            return Ok(ItemOutcome::Skipped {
                remote_path: record.remote_path,
            });
        }

        let destination_path = c.renderer.render(
            &context.destination.base_path,
            &context.job.path_template,
            item,
            &RenderContext {
                job: &context.job,
                run_started_at: exec.run.started_at,
            },
        );

        let mut source = match c.items.open(&context.job, item) {
            Ok(source) => source,
            Err(e) => {
                warn!(run_id = %exec.run_id(), item_id = %item.id, error = %e, "source item unreadable");
                return Ok(ItemOutcome::Failed {
                    reason: FailureReason::SourceUnreadable,
                    message: format!("cannot read source item: {}", e),
                });
            }
        };

        let adapter = match adapter_slot.take() {
            Some(adapter) => adapter,
            None => match c.adapters.connect(
                &context.destination,
                &context.credentials,
                &self.settings.transfer_options(),
            ) {
                Ok(adapter) => adapter,
                Err(e) => {
                    warn!(run_id = %exec.run_id(), destination = %context.destination.destination_id, error = %e, "connection failed");
                    return Ok(Self::transfer_failure(&e));
                }
            },
        };

        c.runs
            .record_progress(exec.run_id(), &exec.run.counters, RunPhase::Transferring, Utc::now())?;

        let request = UploadRequest {
            destination_path: &destination_path,
            expected_length: item.size_bytes,
            modified_at: item.taken_at,
        };
        let mut on_bytes = |bytes: u64| {
            if let Some(callback) = exec.progress {
                callback.on_item_progress(&exec.run, index, bytes);
            }
        };
        let result = adapter.upload_file(&request, &mut source, &mut on_bytes);

        let receipt = match result {
            Ok(receipt) => {
                *adapter_slot = Some(adapter);
                receipt
            }
            Err(e) => {
                // Keep the session unless the failure says it is unusable.
                if !matches!(e.kind(), FailureKind::HostUnreachable | FailureKind::AuthenticationFailed) {
                    *adapter_slot = Some(adapter);
                }
                warn!(run_id = %exec.run_id(), item_id = %item.id, path = %destination_path, error = %e, "transfer failed");
                return Ok(Self::transfer_failure(&e));
            }
        };

        let record = DedupRecord {
            record_id: 0,
            job_id: job_id.clone(),
            item_id: item.id.clone(),
            remote_path: receipt.remote_path.clone(),
            uploaded_at: Utc::now(),
        };
        if let Err(e) = c.dedup.insert_dedup(&record) {
            error!(
                run_id = %exec.run_id(),
                item_id = %item.id,
                path = %receipt.remote_path,
                error = %e,
                "upload committed but dedup record write failed"
            );
            return Ok(ItemOutcome::Failed {
                reason: FailureReason::LedgerWrite,
                message: format!(
                    "uploaded to {} but the dedup record could not be written: {}",
                    receipt.remote_path, e
                ),
            });
        }

        debug!(run_id = %exec.run_id(), item_id = %item.id, path = %receipt.remote_path, bytes = receipt.bytes_written, "item uploaded");
        Ok(ItemOutcome::Uploaded {
            remote_path: receipt.remote_path,
            bytes: receipt.bytes_written,
        })
    }

    fn transfer_failure(err: &TransferError) -> ItemOutcome {
        let reason = match err {
            TransferError::Integrity { .. } => FailureReason::Integrity,
            TransferError::SourceRead(_) => FailureReason::SourceUnreadable,
            other => FailureReason::Transfer(other.kind()),
        };
        ItemOutcome::Failed {
            reason,
            message: err.to_string(),
        }
    }

    /// Re-read the run; returns it if it is no longer RUNNING.
    fn stop_observed(&self, exec: &Execution<'_>) -> Result<Option<Run>, EngineError> {
        let current = self
            .collaborators
            .runs
            .get_run(exec.run_id())?
            .ok_or(EngineError::RunNotFound(exec.run_id()))?;
        if current.status == RunStatus::Running && current.finished_at.is_none() {
            Ok(None)
        } else {
            Ok(Some(current))
        }
    }

    /// Stop processing a run whose status changed under the engine. A pending
    /// cancel request is completed as CANCELED; any other status is kept.
    fn settle_stopped(
        &self,
        exec: &mut Execution<'_>,
        current: Run,
        remaining: usize,
    ) -> Result<RunOutcome, EngineError> {
        info!(
            run_id = %exec.run_id(),
            status = %current.status,
            remaining,
            "run stopped between items"
        );
        exec.run.status = match current.status {
            RunStatus::CancelRequested if current.finished_at.is_none() => RunStatus::Canceled,
            status => status,
        };
        self.finish(exec)
    }

    fn pause(&self, exec: &mut Execution<'_>, items: &[SourceItem], index: usize) -> Result<RunOutcome, EngineError> {
        let runs = &self.collaborators.runs;
        let cursor = ContinuationCursor {
            next_index: index,
            next_item_id: items[index].id.clone(),
        }
        .encode();
        let now = Utc::now();

        if !runs.store_continuation(
            exec.run_id(),
            &cursor,
            &exec.run.counters,
            exec.first_error.as_deref(),
            now,
        )? {
            // The run left RUNNING between the stop check and here.
            let current = runs
                .get_run(exec.run_id())?
                .ok_or(EngineError::RunNotFound(exec.run_id()))?;
            return self.settle_stopped(exec, current, items.len() - index);
        }

        runs.append_log(
            exec.run_id(),
            LogSeverity::Info,
            RUN_PAUSED_LOG,
            Some(&format!("{} of {} items remaining", items.len() - index, items.len())),
            now,
        )?;
        info!(run_id = %exec.run_id(), next_index = index, "run paused for continuation");

        let run = runs
            .get_run(exec.run_id())?
            .ok_or(EngineError::RunNotFound(exec.run_id()))?;
        if let Some(callback) = exec.progress {
            callback.on_run_paused(&run, &cursor);
        }
        Ok(RunOutcome::Paused { run, cursor })
    }

    /// Write the terminal status held in `exec.run.status`.
    ///
    /// The write is conditional: if another writer already finalized the
    /// run, its status stands and only the counters are persisted.
    fn finish(&self, exec: &mut Execution<'_>) -> Result<RunOutcome, EngineError> {
        let runs = &self.collaborators.runs;
        let now = Utc::now();
        let status = exec.run.status;
        let counters = exec.run.counters;

        let finalization = Finalization {
            status,
            finished_at: now,
            counters: Some(counters),
            summary_error: exec.first_error.clone(),
            clear_cursor: true,
            expected_status: None,
        };

        if runs.finalize_if_unfinished(exec.run_id(), &finalization)? {
            let severity = match status {
                RunStatus::Success | RunStatus::Canceled => LogSeverity::Info,
                RunStatus::Partial => LogSeverity::Warn,
                _ => LogSeverity::Error,
            };
            let mut detail = format!(
                "status={} scanned={} uploaded={} skipped={} failed={}",
                status, counters.scanned, counters.uploaded, counters.skipped, counters.failed
            );
            if let Some(err) = &exec.first_error {
                detail.push_str(&format!(" error={}", err));
            }
            runs.append_log(exec.run_id(), severity, RUN_FINISHED_LOG, Some(&detail), now)?;
            info!(
                run_id = %exec.run_id(),
                job_id = %exec.run.job_id,
                %status,
                scanned = counters.scanned,
                uploaded = counters.uploaded,
                skipped = counters.skipped,
                failed = counters.failed,
                "run finished"
            );
        } else {
            runs.record_progress(exec.run_id(), &counters, RunPhase::Finished, now)?;
            debug!(run_id = %exec.run_id(), "run was already finalized; keeping its status");
        }

        let run = runs
            .get_run(exec.run_id())?
            .ok_or(EngineError::RunNotFound(exec.run_id()))?;
        if let Some(callback) = exec.progress {
            callback.on_run_completed(&run);
        }
        Ok(RunOutcome::Finished(run))
    }
}
