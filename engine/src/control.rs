//! Cooperative stop signals for runs.
//!
//! Stopping never interrupts an in-flight transfer. The controller only
//! writes run status; the engine observes it between items.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::RunStore;
use crate::model::{Finalization, LogSeverity, Run, RunStatus};

pub const CANCELED_LOG: &str = "Run canceled by request";
pub const CANCEL_REQUESTED_LOG: &str = "Cancellation requested";
pub const INTERRUPTED_LOG: &str = "Run interrupted";

/// Result of a stop or cancel request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call performed the transition
    Requested,
    /// A stop is already pending for the run
    AlreadyRequested,
    /// The run has already finished
    NotActive,
    NotFound,
}

/// Result of an explicit interruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterruptOutcome {
    Interrupted,
    NotActive,
    NotFound,
}

pub struct CancellationController {
    store: Arc<dyn RunStore>,
}

impl CancellationController {
    pub fn new(store: Arc<dyn RunStore>) -> Self {
        CancellationController { store }
    }

    /// Stop a RUNNING run immediately: it becomes CANCELED with
    /// finished_at set. The engine notices at its next item boundary.
    pub fn stop_run(&self, run_id: Uuid) -> Result<StopOutcome, LedgerError> {
        self.stop_run_at(run_id, Utc::now())
    }

    pub fn stop_run_at(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<StopOutcome, LedgerError> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(StopOutcome::NotFound);
        };
        if let Some(outcome) = Self::pending_outcome(&run) {
            return Ok(outcome);
        }

        let finalization = Finalization::new(RunStatus::Canceled, now);
        if self.store.finalize_if_unfinished(run_id, &finalization)? {
            self.store
                .append_log(run_id, LogSeverity::Info, CANCELED_LOG, None, now)?;
            info!(%run_id, job_id = %run.job_id, "run canceled by request");
            return Ok(StopOutcome::Requested);
        }

        // Lost a race with another writer; report what it left behind.
        self.current_outcome(run_id)
    }

    /// Ask a RUNNING run to stop at its next item boundary by moving it to
    /// CANCEL_REQUESTED. The engine finalizes it as CANCELED; if the engine
    /// is gone, the liveness reconciler does once the heartbeat goes stale.
    pub fn request_cancel(&self, run_id: Uuid) -> Result<StopOutcome, LedgerError> {
        self.request_cancel_at(run_id, Utc::now())
    }

    pub fn request_cancel_at(&self, run_id: Uuid, now: DateTime<Utc>) -> Result<StopOutcome, LedgerError> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(StopOutcome::NotFound);
        };
        if let Some(outcome) = Self::pending_outcome(&run) {
            return Ok(outcome);
        }

        if self
            .store
            .set_status_if(run_id, RunStatus::Running, RunStatus::CancelRequested)?
        {
            self.store
                .append_log(run_id, LogSeverity::Info, CANCEL_REQUESTED_LOG, None, now)?;
            info!(%run_id, job_id = %run.job_id, "cancellation requested");
            return Ok(StopOutcome::Requested);
        }

        self.current_outcome(run_id)
    }

    /// Mark a RUNNING run as INTERRUPTED at once, e.g. when the execution
    /// environment refuses to start its work. Clears any continuation cursor.
    pub fn interrupt_run(&self, run_id: Uuid, reason: &str) -> Result<InterruptOutcome, LedgerError> {
        self.interrupt_run_at(run_id, reason, Utc::now())
    }

    pub fn interrupt_run_at(
        &self,
        run_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<InterruptOutcome, LedgerError> {
        let Some(run) = self.store.get_run(run_id)? else {
            return Ok(InterruptOutcome::NotFound);
        };
        if run.status != RunStatus::Running || run.finished_at.is_some() {
            return Ok(InterruptOutcome::NotActive);
        }

        let mut finalization = Finalization::new(RunStatus::Interrupted, now);
        finalization.summary_error = Some(reason.to_string());
        if !self.store.finalize_if_unfinished(run_id, &finalization)? {
            return Ok(InterruptOutcome::NotActive);
        }

        self.store
            .append_log(run_id, LogSeverity::Error, INTERRUPTED_LOG, Some(reason), now)?;
        error!(%run_id, job_id = %run.job_id, reason, "run interrupted");
        Ok(InterruptOutcome::Interrupted)
    }

    /// Outcome for a run that cannot be stopped by this call, or None if it
    /// is RUNNING and unfinished.
    fn pending_outcome(run: &Run) -> Option<StopOutcome> {
        if run.finished_at.is_some() {
            return Some(StopOutcome::NotActive);
        }
        match run.status {
            RunStatus::Running => None,
            RunStatus::CancelRequested | RunStatus::Canceled => Some(StopOutcome::AlreadyRequested),
            _ => Some(StopOutcome::NotActive),
        }
    }

    fn current_outcome(&self, run_id: Uuid) -> Result<StopOutcome, LedgerError> {
        Ok(match self.store.get_run(run_id)? {
            Some(run) => Self::pending_outcome(&run).unwrap_or(StopOutcome::NotActive),
            None => StopOutcome::NotFound,
        })
    }
}
