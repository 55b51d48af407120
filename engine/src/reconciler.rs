//! Liveness reconciliation for abandoned runs.
//!
//! A run whose engine died keeps its active status forever unless something
//! closes it. The reconciler finalizes active runs whose heartbeat is older
//! than a threshold: CANCEL_REQUESTED runs become CANCELED, RUNNING runs
//! become INTERRUPTED. Every write is conditional on the run still being
//! unfinished, so a run that completes between the read and the write keeps
//! its own status and overlapping sweeps finalize each run once.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info};

use crate::error::LedgerError;
use crate::ledger::RunStore;
use crate::model::{Finalization, LogSeverity, Run, RunStatus};

pub const RECONCILED_CANCELED_LOG: &str = "Run finalized as canceled";
pub const RECONCILED_INTERRUPTED_LOG: &str = "Run marked as interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerSettings {
    /// Maximum number of active runs examined per sweep
    pub batch_limit: usize,
    pub stale_cancel_requested_after: Duration,
    pub stale_running_after: Duration,
}

impl Default for ReconcilerSettings {
    fn default() -> Self {
        ReconcilerSettings {
            batch_limit: 100,
            stale_cancel_requested_after: Duration::minutes(15),
            stale_running_after: Duration::minutes(60),
        }
    }
}

/// Counts from one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub examined: usize,
    pub canceled: usize,
    pub interrupted: usize,
}

pub struct LivenessReconciler {
    store: Arc<dyn RunStore>,
    settings: ReconcilerSettings,
}

impl LivenessReconciler {
    pub fn new(store: Arc<dyn RunStore>, settings: ReconcilerSettings) -> Self {
        LivenessReconciler { store, settings }
    }

    pub fn settings(&self) -> &ReconcilerSettings {
        &self.settings
    }

    /// Examine up to `batch_limit` active runs, newest first, and finalize
    /// the stale ones.
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<ReconcileReport, LedgerError> {
        let mut report = ReconcileReport::default();

        for run in self.store.list_active_runs(self.settings.batch_limit)? {
            report.examined += 1;
            if run.finished_at.is_some() {
                continue;
            }

            let age = now.signed_duration_since(run.heartbeat_at);
            match run.status {
                RunStatus::CancelRequested if age >= self.settings.stale_cancel_requested_after => {
                    if self.finalize(&run, RunStatus::Canceled, age, now)? {
                        report.canceled += 1;
                    }
                }
                RunStatus::Running if age >= self.settings.stale_running_after => {
                    if self.finalize(&run, RunStatus::Interrupted, age, now)? {
                        report.interrupted += 1;
                    }
                }
                _ => {}
            }
        }

        debug!(
            examined = report.examined,
            canceled = report.canceled,
            interrupted = report.interrupted,
            "reconciler sweep complete"
        );
        Ok(report)
    }

    fn finalize(
        &self,
        run: &Run,
        status: RunStatus,
        age: Duration,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let finalization = Finalization::new(status, now).only_if_status(run.status);
        if !self.store.finalize_if_unfinished(run.run_id, &finalization)? {
            debug!(run_id = %run.run_id, "run finished or changed status before it could be reconciled");
            return Ok(false);
        }

        let detail = format!(
            "last heartbeat {} ({}s before sweep)",
            run.heartbeat_at.to_rfc3339(),
            age.num_seconds()
        );
        if status == RunStatus::Canceled {
            self.store
                .append_log(run.run_id, LogSeverity::Info, RECONCILED_CANCELED_LOG, Some(&detail), now)?;
            info!(run_id = %run.run_id, job_id = %run.job_id, "stale cancel request finalized");
        } else {
            self.store.append_log(
                run.run_id,
                LogSeverity::Error,
                RECONCILED_INTERRUPTED_LOG,
                Some(&detail),
                now,
            )?;
            error!(run_id = %run.run_id, job_id = %run.job_id, age_secs = age.num_seconds(), "stale run interrupted");
        }
        Ok(true)
    }
}
