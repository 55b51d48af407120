//! Run ledger and dedup ledger persistence.
//!
//! Components talk to persistence through the [`RunStore`] and [`DedupStore`]
//! traits, injected at construction time. [`SqliteLedger`] implements both
//! on a single SQLite database.
//!
//! Every write that moves a run to a terminal status goes through
//! [`RunStore::finalize_if_unfinished`], which only applies while the row is
//! still active and unfinished. Heartbeat and counter updates go through
//! [`RunStore::record_progress`], which never touches status or finished_at.
//! Together these keep the engine, the reconciler and the cancellation
//! controller from overwriting one another's terminal decisions.

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::model::{
    DedupRecord, ExecutionMode, Finalization, LogSeverity, NewRun, Run, RunCounters, RunLogEntry,
    RunPhase, RunStatus, TriggerSource,
};

const LEDGER_SCHEMA_VERSION: i64 = 1;

const RUN_COLUMNS: &str = "run_id, job_id, status, phase, started_at, finished_at, heartbeat_at, \
     scanned, uploaded, skipped, failed, summary_error, trigger_source, execution_mode, \
     continuation_cursor, resume_count, last_progress_at";

/// Persisted run lifecycle records and their logs.
pub trait RunStore: Send + Sync {
    /// Create a RUNNING run and return it with a fresh run_id.
    fn create_run(&self, new_run: &NewRun) -> Result<Run, LedgerError>;

    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, LedgerError>;

    /// Overwrite the full row identified by `run.run_id`.
    fn update_run(&self, run: &Run) -> Result<(), LedgerError>;

    /// Write counters, phase and heartbeat. Counters and heartbeat never move
    /// backwards; status and finished_at are left untouched.
    fn record_progress(
        &self,
        run_id: Uuid,
        counters: &RunCounters,
        phase: RunPhase,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError>;

    /// Persist a continuation cursor for a run that pauses while RUNNING,
    /// bumping resume_count. The first recorded summary error is kept.
    /// Returns false if the run is no longer RUNNING.
    fn store_continuation(
        &self,
        run_id: Uuid,
        cursor: &str,
        counters: &RunCounters,
        summary_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError>;

    /// Apply a terminal status only if the run is still active and
    /// unfinished (and, when given, still holds the expected status).
    /// Counters never move backwards. Returns true if this call performed
    /// the transition.
    fn finalize_if_unfinished(
        &self,
        run_id: Uuid,
        finalization: &Finalization,
    ) -> Result<bool, LedgerError>;

    /// Compare-and-set between two active statuses on an unfinished run.
    fn set_status_if(&self, run_id: Uuid, from: RunStatus, to: RunStatus)
        -> Result<bool, LedgerError>;

    /// Active runs (RUNNING or CANCEL_REQUESTED, finished_at unset), newest first.
    fn list_active_runs(&self, limit: usize) -> Result<Vec<Run>, LedgerError>;

    /// Runs, newest first, optionally restricted to one job.
    fn list_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>, LedgerError>;

    fn append_log(
        &self,
        run_id: Uuid,
        severity: LogSeverity,
        message: &str,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RunLogEntry, LedgerError>;

    fn logs_for_run(&self, run_id: Uuid) -> Result<Vec<RunLogEntry>, LedgerError>;
}

/// Idempotency records keyed by (job_id, item_id).
pub trait DedupStore: Send + Sync {
    fn find_dedup(&self, job_id: &str, item_id: &str) -> Result<Option<DedupRecord>, LedgerError>;

    /// Insert a record; fails with [`LedgerError::Conflict`] if one already
    /// exists for the pair. The returned record carries its record_id.
    fn insert_dedup(&self, record: &DedupRecord) -> Result<DedupRecord, LedgerError>;

    fn dedup_records_for_job(&self, job_id: &str) -> Result<Vec<DedupRecord>, LedgerError>;
}

/// Row counts removed by [`SqliteLedger::delete_job`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct JobPurge {
    pub runs: usize,
    pub logs: usize,
    pub dedup_records: usize,
}

/// SQLite-backed run and dedup ledger.
pub struct SqliteLedger {
    conn: Mutex<Connection>,
}

impl SqliteLedger {
    /// Open (creating if needed) a ledger database file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, LedgerError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |_| Ok(()))?;
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, LedgerError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, LedgerError> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrate(&conn)?;
        Ok(SqliteLedger {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn.lock().map_err(|_| LedgerError::LockPoisoned)
    }

    /// Delete every run, run log and dedup record of a job.
    ///
    /// This is the only deletion path; it mirrors the cascade applied when the
    /// owning job is removed.
    pub fn delete_job(&self, job_id: &str) -> Result<JobPurge, LedgerError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let logs = tx.execute(
            "DELETE FROM run_logs WHERE run_id IN (SELECT run_id FROM runs WHERE job_id = ?1)",
            params![job_id],
        )?;
        let runs = tx.execute("DELETE FROM runs WHERE job_id = ?1", params![job_id])?;
        let dedup_records =
            tx.execute("DELETE FROM dedup_records WHERE job_id = ?1", params![job_id])?;
        tx.commit()?;
        Ok(JobPurge {
            runs,
            logs,
            dedup_records,
        })
    }
}

fn migrate(conn: &Connection) -> Result<(), LedgerError> {
    let current: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if current > LEDGER_SCHEMA_VERSION {
        return Err(LedgerError::UnsupportedSchema {
            found: current,
            supported: LEDGER_SCHEMA_VERSION,
        });
    }

    if current < 1 {
        conn.execute_batch(
            r#"
BEGIN;
CREATE TABLE IF NOT EXISTS runs (
  run_id TEXT PRIMARY KEY,
  job_id TEXT NOT NULL,
  status TEXT NOT NULL,
  phase TEXT NOT NULL,
  started_at TEXT NOT NULL,
  finished_at TEXT NULL,
  heartbeat_at TEXT NOT NULL,
  scanned INTEGER NOT NULL DEFAULT 0,
  uploaded INTEGER NOT NULL DEFAULT 0,
  skipped INTEGER NOT NULL DEFAULT 0,
  failed INTEGER NOT NULL DEFAULT 0,
  summary_error TEXT NULL,
  trigger_source TEXT NOT NULL,
  execution_mode TEXT NOT NULL,
  continuation_cursor TEXT NULL,
  resume_count INTEGER NOT NULL DEFAULT 0,
  last_progress_at TEXT NULL
);

CREATE TABLE IF NOT EXISTS run_logs (
  log_id INTEGER PRIMARY KEY AUTOINCREMENT,
  run_id TEXT NOT NULL REFERENCES runs(run_id) ON DELETE CASCADE,
  timestamp TEXT NOT NULL,
  severity TEXT NOT NULL,
  message TEXT NOT NULL,
  detail TEXT NULL
);

CREATE TABLE IF NOT EXISTS dedup_records (
  record_id INTEGER PRIMARY KEY AUTOINCREMENT,
  job_id TEXT NOT NULL,
  item_id TEXT NOT NULL,
  remote_path TEXT NOT NULL,
  uploaded_at TEXT NOT NULL,
  UNIQUE (job_id, item_id)
);

CREATE INDEX IF NOT EXISTS runs_active_idx ON runs(finished_at, status);
CREATE INDEX IF NOT EXISTS runs_job_idx ON runs(job_id, started_at);
CREATE INDEX IF NOT EXISTS run_logs_run_idx ON run_logs(run_id);
PRAGMA user_version = 1;
COMMIT;
"#,
        )?;
    }

    Ok(())
}

// Fixed-width UTC timestamps sort lexicographically in time order.
fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(value: &str) -> Result<DateTime<Utc>, LedgerError> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LedgerError::Corrupt(format!("bad timestamp '{}': {}", value, e)))
}

fn parse_opt_ts(value: Option<String>) -> Result<Option<DateTime<Utc>>, LedgerError> {
    value.as_deref().map(parse_ts).transpose()
}

fn to_count(value: i64, column: &str) -> Result<u64, LedgerError> {
    u64::try_from(value).map_err(|_| LedgerError::Corrupt(format!("negative {}: {}", column, value)))
}

fn active_status_list() -> String {
    RunStatus::ACTIVE
        .iter()
        .map(|s| format!("'{}'", s.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Raw column values of a run row, decoded outside the rusqlite closure so
/// decoding failures surface as [`LedgerError::Corrupt`].
struct RunRow {
    run_id: String,
    job_id: String,
    status: String,
    phase: String,
    started_at: String,
    finished_at: Option<String>,
    heartbeat_at: String,
    scanned: i64,
    uploaded: i64,
    skipped: i64,
    failed: i64,
    summary_error: Option<String>,
    trigger_source: String,
    execution_mode: String,
    continuation_cursor: Option<String>,
    resume_count: i64,
    last_progress_at: Option<String>,
}

impl RunRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(RunRow {
            run_id: row.get(0)?,
            job_id: row.get(1)?,
            status: row.get(2)?,
            phase: row.get(3)?,
            started_at: row.get(4)?,
            finished_at: row.get(5)?,
            heartbeat_at: row.get(6)?,
            scanned: row.get(7)?,
            uploaded: row.get(8)?,
            skipped: row.get(9)?,
            failed: row.get(10)?,
            summary_error: row.get(11)?,
            trigger_source: row.get(12)?,
            execution_mode: row.get(13)?,
            continuation_cursor: row.get(14)?,
            resume_count: row.get(15)?,
            last_progress_at: row.get(16)?,
        })
    }

    fn into_run(self) -> Result<Run, LedgerError> {
        let corrupt = |what: &str, value: &str| LedgerError::Corrupt(format!("bad {} '{}'", what, value));
        Ok(Run {
            run_id: Uuid::parse_str(&self.run_id).map_err(|_| corrupt("run_id", &self.run_id))?,
            status: RunStatus::parse(&self.status).ok_or_else(|| corrupt("status", &self.status))?,
            phase: RunPhase::parse(&self.phase).ok_or_else(|| corrupt("phase", &self.phase))?,
            started_at: parse_ts(&self.started_at)?,
            finished_at: parse_opt_ts(self.finished_at)?,
            heartbeat_at: parse_ts(&self.heartbeat_at)?,
            counters: RunCounters {
                scanned: to_count(self.scanned, "scanned")?,
                uploaded: to_count(self.uploaded, "uploaded")?,
                skipped: to_count(self.skipped, "skipped")?,
                failed: to_count(self.failed, "failed")?,
            },
            summary_error: self.summary_error,
            trigger_source: TriggerSource::parse(&self.trigger_source)
                .ok_or_else(|| corrupt("trigger_source", &self.trigger_source))?,
            execution_mode: ExecutionMode::parse(&self.execution_mode)
                .ok_or_else(|| corrupt("execution_mode", &self.execution_mode))?,
            continuation_cursor: self.continuation_cursor,
            resume_count: u32::try_from(self.resume_count)
                .map_err(|_| corrupt("resume_count", &self.resume_count.to_string()))?,
            last_progress_at: parse_opt_ts(self.last_progress_at)?,
            job_id: self.job_id,
        })
    }
}

fn query_runs(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<Run>, LedgerError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, RunRow::read)?;
    let mut runs = Vec::new();
    for row in rows {
        runs.push(row?.into_run()?);
    }
    Ok(runs)
}

fn read_log(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String, Option<String>)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?, row.get(5)?))
}

fn read_dedup(row: &Row<'_>) -> rusqlite::Result<(i64, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn dedup_from_raw(raw: (i64, String, String, String, String)) -> Result<DedupRecord, LedgerError> {
    let (record_id, job_id, item_id, remote_path, uploaded_at) = raw;
    Ok(DedupRecord {
        record_id,
        job_id,
        item_id,
        remote_path,
        uploaded_at: parse_ts(&uploaded_at)?,
    })
}

impl RunStore for SqliteLedger {
    fn create_run(&self, new_run: &NewRun) -> Result<Run, LedgerError> {
        let run = Run {
            run_id: Uuid::new_v4(),
            job_id: new_run.job_id.clone(),
            status: RunStatus::Running,
            phase: RunPhase::Starting,
            started_at: new_run.started_at,
            finished_at: None,
            heartbeat_at: new_run.started_at,
            counters: RunCounters::default(),
            summary_error: None,
            trigger_source: new_run.trigger_source,
            execution_mode: new_run.execution_mode,
            continuation_cursor: None,
            resume_count: 0,
            last_progress_at: Some(new_run.started_at),
        };
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO runs ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                RUN_COLUMNS
            ),
            params![
                run.run_id.to_string(),
                run.job_id,
                run.status.as_str(),
                run.phase.as_str(),
                ts(run.started_at),
                run.finished_at.map(ts),
                ts(run.heartbeat_at),
                0i64,
                0i64,
                0i64,
                0i64,
                run.summary_error,
                run.trigger_source.as_str(),
                run.execution_mode.as_str(),
                run.continuation_cursor,
                0i64,
                run.last_progress_at.map(ts),
            ],
        )?;
        Ok(run)
    }

    fn get_run(&self, run_id: Uuid) -> Result<Option<Run>, LedgerError> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                &format!("SELECT {} FROM runs WHERE run_id = ?1", RUN_COLUMNS),
                params![run_id.to_string()],
                RunRow::read,
            )
            .optional()?;
        row.map(RunRow::into_run).transpose()
    }

    fn update_run(&self, run: &Run) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET job_id = ?2, status = ?3, phase = ?4, started_at = ?5, finished_at = ?6, \
             heartbeat_at = ?7, scanned = ?8, uploaded = ?9, skipped = ?10, failed = ?11, \
             summary_error = ?12, trigger_source = ?13, execution_mode = ?14, \
             continuation_cursor = ?15, resume_count = ?16, last_progress_at = ?17 \
             WHERE run_id = ?1",
            params![
                run.run_id.to_string(),
                run.job_id,
                run.status.as_str(),
                run.phase.as_str(),
                ts(run.started_at),
                run.finished_at.map(ts),
                ts(run.heartbeat_at),
                run.counters.scanned as i64,
                run.counters.uploaded as i64,
                run.counters.skipped as i64,
                run.counters.failed as i64,
                run.summary_error,
                run.trigger_source.as_str(),
                run.execution_mode.as_str(),
                run.continuation_cursor,
                run.resume_count as i64,
                run.last_progress_at.map(ts),
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(run.run_id));
        }
        Ok(())
    }

    fn record_progress(
        &self,
        run_id: Uuid,
        counters: &RunCounters,
        phase: RunPhase,
        at: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET \
               scanned = MAX(scanned, ?2), uploaded = MAX(uploaded, ?3), \
               skipped = MAX(skipped, ?4), failed = MAX(failed, ?5), \
               phase = CASE WHEN finished_at IS NULL THEN ?6 ELSE phase END, \
               heartbeat_at = MAX(heartbeat_at, ?7), last_progress_at = ?7 \
             WHERE run_id = ?1",
            params![
                run_id.to_string(),
                counters.scanned as i64,
                counters.uploaded as i64,
                counters.skipped as i64,
                counters.failed as i64,
                phase.as_str(),
                ts(at),
            ],
        )?;
        if changed == 0 {
            return Err(LedgerError::NotFound(run_id));
        }
        Ok(())
    }

    fn store_continuation(
        &self,
        run_id: Uuid,
        cursor: &str,
        counters: &RunCounters,
        summary_error: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET \
               continuation_cursor = ?2, resume_count = resume_count + 1, phase = ?3, \
               scanned = MAX(scanned, ?4), uploaded = MAX(uploaded, ?5), \
               skipped = MAX(skipped, ?6), failed = MAX(failed, ?7), \
               heartbeat_at = MAX(heartbeat_at, ?8), last_progress_at = ?8, \
               summary_error = COALESCE(summary_error, ?10) \
             WHERE run_id = ?1 AND status = ?9 AND finished_at IS NULL",
            params![
                run_id.to_string(),
                cursor,
                RunPhase::Paused.as_str(),
                counters.scanned as i64,
                counters.uploaded as i64,
                counters.skipped as i64,
                counters.failed as i64,
                ts(at),
                RunStatus::Running.as_str(),
                summary_error,
            ],
        )?;
        Ok(changed == 1)
    }

    fn finalize_if_unfinished(
        &self,
        run_id: Uuid,
        finalization: &Finalization,
    ) -> Result<bool, LedgerError> {
        let counters = finalization.counters;
        let conn = self.conn()?;
        let changed = conn.execute(
            &format!(
                "UPDATE runs SET \
                   status = ?2, finished_at = ?3, phase = ?4, \
                   scanned = MAX(scanned, COALESCE(?5, scanned)), \
                   uploaded = MAX(uploaded, COALESCE(?6, uploaded)), \
                   skipped = MAX(skipped, COALESCE(?7, skipped)), \
                   failed = MAX(failed, COALESCE(?8, failed)), \
                   summary_error = COALESCE(?9, summary_error), \
                   continuation_cursor = CASE WHEN ?10 THEN NULL ELSE continuation_cursor END \
                 WHERE run_id = ?1 AND finished_at IS NULL AND status IN ({}) \
                   AND (?11 IS NULL OR status = ?11)",
                active_status_list()
            ),
            params![
                run_id.to_string(),
                finalization.status.as_str(),
                ts(finalization.finished_at),
                RunPhase::Finished.as_str(),
                counters.map(|c| c.scanned as i64),
                counters.map(|c| c.uploaded as i64),
                counters.map(|c| c.skipped as i64),
                counters.map(|c| c.failed as i64),
                finalization.summary_error,
                finalization.clear_cursor,
                finalization.expected_status.map(|s| s.as_str()),
            ],
        )?;
        Ok(changed == 1)
    }

    fn set_status_if(
        &self,
        run_id: Uuid,
        from: RunStatus,
        to: RunStatus,
    ) -> Result<bool, LedgerError> {
        let conn = self.conn()?;
        let changed = conn.execute(
            "UPDATE runs SET status = ?3 WHERE run_id = ?1 AND status = ?2 AND finished_at IS NULL",
            params![run_id.to_string(), from.as_str(), to.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn list_active_runs(&self, limit: usize) -> Result<Vec<Run>, LedgerError> {
        let conn = self.conn()?;
        query_runs(
            &conn,
            &format!(
                "SELECT {} FROM runs WHERE finished_at IS NULL AND status IN ({}) \
                 ORDER BY started_at DESC LIMIT ?1",
                RUN_COLUMNS,
                active_status_list()
            ),
            params![limit as i64],
        )
    }

    fn list_runs(&self, job_id: Option<&str>, limit: usize) -> Result<Vec<Run>, LedgerError> {
        let conn = self.conn()?;
        match job_id {
            Some(job_id) => query_runs(
                &conn,
                &format!(
                    "SELECT {} FROM runs WHERE job_id = ?1 ORDER BY started_at DESC LIMIT ?2",
                    RUN_COLUMNS
                ),
                params![job_id, limit as i64],
            ),
            None => query_runs(
                &conn,
                &format!("SELECT {} FROM runs ORDER BY started_at DESC LIMIT ?1", RUN_COLUMNS),
                params![limit as i64],
            ),
        }
    }

    fn append_log(
        &self,
        run_id: Uuid,
        severity: LogSeverity,
        message: &str,
        detail: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<RunLogEntry, LedgerError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO run_logs (run_id, timestamp, severity, message, detail) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![run_id.to_string(), ts(at), severity.as_str(), message, detail],
        )?;
        Ok(RunLogEntry {
            log_id: conn.last_insert_rowid(),
            run_id,
            timestamp: at,
            severity,
            message: message.to_string(),
            detail: detail.map(str::to_string),
        })
    }

    fn logs_for_run(&self, run_id: Uuid) -> Result<Vec<RunLogEntry>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT log_id, run_id, timestamp, severity, message, detail \
             FROM run_logs WHERE run_id = ?1 ORDER BY log_id ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], read_log)?;
        let mut entries = Vec::new();
        for row in rows {
            let (log_id, _run_id, timestamp, severity, message, detail) = row?;
            entries.push(RunLogEntry {
                log_id,
                run_id,
                timestamp: parse_ts(&timestamp)?,
                severity: LogSeverity::parse(&severity)
                    .ok_or_else(|| LedgerError::Corrupt(format!("bad severity '{}'", severity)))?,
                message,
                detail,
            });
        }
        Ok(entries)
    }
}

impl DedupStore for SqliteLedger {
    fn find_dedup(&self, job_id: &str, item_id: &str) -> Result<Option<DedupRecord>, LedgerError> {
        let conn = self.conn()?;
        let raw = conn
            .query_row(
                "SELECT record_id, job_id, item_id, remote_path, uploaded_at \
                 FROM dedup_records WHERE job_id = ?1 AND item_id = ?2",
                params![job_id, item_id],
                read_dedup,
            )
            .optional()?;
        raw.map(dedup_from_raw).transpose()
    }

    fn insert_dedup(&self, record: &DedupRecord) -> Result<DedupRecord, LedgerError> {
        let conn = self.conn()?;
        let inserted = conn.execute(
            "INSERT INTO dedup_records (job_id, item_id, remote_path, uploaded_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![record.job_id, record.item_id, record.remote_path, ts(record.uploaded_at)],
        );
        match inserted {
            Ok(_) => Ok(DedupRecord {
                record_id: conn.last_insert_rowid(),
                ..record.clone()
            }),
            Err(e) if e.sqlite_error_code() == Some(ErrorCode::ConstraintViolation) => {
                Err(LedgerError::Conflict {
                    job_id: record.job_id.clone(),
                    item_id: record.item_id.clone(),
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    fn dedup_records_for_job(&self, job_id: &str) -> Result<Vec<DedupRecord>, LedgerError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT record_id, job_id, item_id, remote_path, uploaded_at \
             FROM dedup_records WHERE job_id = ?1 ORDER BY record_id ASC",
        )?;
        let rows = stmt.query_map(params![job_id], read_dedup)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(dedup_from_raw(row?)?);
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn new_run(job_id: &str, started_at: DateTime<Utc>) -> NewRun {
        NewRun {
            job_id: job_id.to_string(),
            trigger_source: TriggerSource::Manual,
            execution_mode: ExecutionMode::Foreground,
            started_at,
        }
    }

    fn record(job_id: &str, item_id: &str) -> DedupRecord {
        DedupRecord {
            record_id: 0,
            job_id: job_id.to_string(),
            item_id: item_id.to_string(),
            remote_path: format!("backup/{}", item_id),
            uploaded_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_run_starts_running_with_fresh_id() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let now = Utc::now();
        let a = ledger.create_run(&new_run("job", now)).expect("create a");
        let b = ledger.create_run(&new_run("job", now)).expect("create b");

        assert_ne!(a.run_id, b.run_id);
        assert_eq!(a.status, RunStatus::Running);
        assert!(a.finished_at.is_none());

        let stored = ledger.get_run(a.run_id).expect("get").expect("exists");
        assert_eq!(stored.job_id, "job");
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.heartbeat_at, a.heartbeat_at);
    }

    #[test]
    fn test_update_run_overwrites_full_row() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let mut run = ledger.create_run(&new_run("job", Utc::now())).expect("create");

        run.status = RunStatus::Partial;
        run.finished_at = Some(Utc::now());
        run.counters = RunCounters { scanned: 5, uploaded: 3, skipped: 1, failed: 1 };
        run.summary_error = Some("boom".to_string());
        ledger.update_run(&run).expect("update");

        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored, run);
    }

    #[test]
    fn test_update_unknown_run_is_not_found() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let mut run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        run.run_id = Uuid::new_v4();
        assert!(matches!(ledger.update_run(&run), Err(LedgerError::NotFound(_))));
    }

    #[test]
    fn test_record_progress_never_moves_backwards_or_touches_status() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let start = Utc::now();
        let run = ledger.create_run(&new_run("job", start)).expect("create");

        let later = start + ChronoDuration::seconds(30);
        let counters = RunCounters { scanned: 4, uploaded: 2, skipped: 0, failed: 1 };
        ledger
            .record_progress(run.run_id, &counters, RunPhase::Transferring, later)
            .expect("progress");
        ledger
            .record_progress(run.run_id, &RunCounters::default(), RunPhase::Transferring, start)
            .expect("stale progress");

        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.counters, counters);
        assert_eq!(stored.heartbeat_at, later);
        assert_eq!(stored.status, RunStatus::Running);
        assert_eq!(stored.phase, RunPhase::Transferring);
    }

    #[test]
    fn test_finalize_applies_only_once() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");

        let first = Finalization::new(RunStatus::Interrupted, Utc::now());
        assert!(ledger.finalize_if_unfinished(run.run_id, &first).expect("finalize"));

        let second = Finalization::new(RunStatus::Success, Utc::now());
        assert!(!ledger.finalize_if_unfinished(run.run_id, &second).expect("finalize again"));

        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.status, RunStatus::Interrupted);
        assert_eq!(stored.phase, RunPhase::Finished);
    }

    #[test]
    fn test_finalize_clears_cursor_and_keeps_counters_when_absent() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        let counters = RunCounters { scanned: 3, uploaded: 1, skipped: 0, failed: 0 };
        assert!(ledger
            .store_continuation(run.run_id, "cursor", &counters, None, Utc::now())
            .expect("continuation"));

        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.continuation_cursor.as_deref(), Some("cursor"));
        assert_eq!(stored.resume_count, 1);
        assert_eq!(stored.phase, RunPhase::Paused);

        let fin = Finalization::new(RunStatus::Interrupted, Utc::now());
        assert!(ledger.finalize_if_unfinished(run.run_id, &fin).expect("finalize"));
        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert!(stored.continuation_cursor.is_none());
        assert_eq!(stored.counters, counters);
    }

    #[test]
    fn test_finalize_never_lowers_counters() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        let counters = RunCounters { scanned: 3, uploaded: 1, skipped: 0, failed: 1 };
        ledger
            .record_progress(run.run_id, &counters, RunPhase::Transferring, Utc::now())
            .expect("progress");

        let mut fin = Finalization::new(RunStatus::Failed, Utc::now());
        fin.counters = Some(RunCounters { scanned: 0, uploaded: 1, skipped: 2, failed: 0 });
        assert!(ledger.finalize_if_unfinished(run.run_id, &fin).expect("finalize"));

        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.status, RunStatus::Failed);
        assert_eq!(stored.counters, RunCounters { scanned: 3, uploaded: 1, skipped: 2, failed: 1 });
    }

    #[test]
    fn test_continuation_keeps_first_summary_error() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        let counters = RunCounters { scanned: 3, uploaded: 0, skipped: 0, failed: 1 };

        assert!(ledger
            .store_continuation(run.run_id, "c1", &counters, Some("a.jpg: host unreachable"), Utc::now())
            .expect("first pause"));
        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.summary_error.as_deref(), Some("a.jpg: host unreachable"));

        assert!(ledger
            .store_continuation(run.run_id, "c2", &counters, Some("b.jpg: timed out"), Utc::now())
            .expect("second pause"));
        assert!(ledger
            .store_continuation(run.run_id, "c3", &counters, None, Utc::now())
            .expect("third pause"));
        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.summary_error.as_deref(), Some("a.jpg: host unreachable"));
        assert_eq!(stored.resume_count, 3);
    }

    #[test]
    fn test_finalize_with_expected_status_rejects_changed_run() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        let observed = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(observed.status, RunStatus::Running);

        // A cancel request lands between the read and the write
        assert!(ledger
            .set_status_if(run.run_id, RunStatus::Running, RunStatus::CancelRequested)
            .expect("cas"));

        let fin = Finalization::new(RunStatus::Interrupted, Utc::now()).only_if_status(observed.status);
        assert!(!ledger.finalize_if_unfinished(run.run_id, &fin).expect("finalize"));
        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.status, RunStatus::CancelRequested);
        assert!(stored.finished_at.is_none());

        let fin = Finalization::new(RunStatus::Canceled, Utc::now()).only_if_status(RunStatus::CancelRequested);
        assert!(ledger.finalize_if_unfinished(run.run_id, &fin).expect("finalize"));
        let stored = ledger.get_run(run.run_id).expect("get").expect("exists");
        assert_eq!(stored.status, RunStatus::Canceled);
    }

    #[test]
    fn test_active_runs_are_unfinished_and_newest_first() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let base = Utc::now();
        let old = ledger.create_run(&new_run("a", base)).expect("old");
        let mid = ledger
            .create_run(&new_run("b", base + ChronoDuration::seconds(1)))
            .expect("mid");
        let new = ledger
            .create_run(&new_run("c", base + ChronoDuration::seconds(2)))
            .expect("new");

        assert!(ledger
            .set_status_if(mid.run_id, RunStatus::Running, RunStatus::CancelRequested)
            .expect("cas"));
        ledger
            .finalize_if_unfinished(old.run_id, &Finalization::new(RunStatus::Success, Utc::now()))
            .expect("finalize");

        let active = ledger.list_active_runs(10).expect("active");
        let ids: Vec<Uuid> = active.iter().map(|r| r.run_id).collect();
        assert_eq!(ids, vec![new.run_id, mid.run_id]);

        let capped = ledger.list_active_runs(1).expect("capped");
        assert_eq!(capped.len(), 1);
        assert_eq!(capped[0].run_id, new.run_id);
    }

    #[test]
    fn test_logs_are_appended_in_order() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        ledger
            .append_log(run.run_id, LogSeverity::Info, "Run started", None, Utc::now())
            .expect("log 1");
        ledger
            .append_log(run.run_id, LogSeverity::Error, "Upload failed", Some("a.jpg"), Utc::now())
            .expect("log 2");

        let logs = ledger.logs_for_run(run.run_id).expect("logs");
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].message, "Run started");
        assert_eq!(logs[1].severity, LogSeverity::Error);
        assert_eq!(logs[1].detail.as_deref(), Some("a.jpg"));
        assert!(logs[0].log_id < logs[1].log_id);
    }

    #[test]
    fn test_dedup_insert_conflicts_on_duplicate_pair() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let stored = ledger.insert_dedup(&record("job", "a.jpg")).expect("insert");
        assert!(stored.record_id > 0);

        let dup = ledger.insert_dedup(&record("job", "a.jpg"));
        assert!(matches!(dup, Err(LedgerError::Conflict { .. })));

        // Same item under another job is a different pair
        ledger.insert_dedup(&record("other", "a.jpg")).expect("other job");

        let found = ledger.find_dedup("job", "a.jpg").expect("find").expect("exists");
        assert_eq!(found.remote_path, "backup/a.jpg");
        assert!(ledger.find_dedup("job", "b.jpg").expect("find").is_none());
    }

    #[test]
    fn test_delete_job_cascades() {
        let ledger = SqliteLedger::open_in_memory().expect("open ledger");
        let run = ledger.create_run(&new_run("job", Utc::now())).expect("create");
        let keep = ledger.create_run(&new_run("keep", Utc::now())).expect("create keep");
        ledger
            .append_log(run.run_id, LogSeverity::Info, "Run started", None, Utc::now())
            .expect("log");
        ledger.insert_dedup(&record("job", "a.jpg")).expect("dedup");

        let purge = ledger.delete_job("job").expect("delete");
        assert_eq!(purge, JobPurge { runs: 1, logs: 1, dedup_records: 1 });
        assert!(ledger.get_run(run.run_id).expect("get").is_none());
        assert!(ledger.get_run(keep.run_id).expect("get").is_some());
        assert!(ledger.dedup_records_for_job("job").expect("records").is_empty());
    }

    #[test]
    fn test_file_ledger_persists_across_reopen() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("ledger.db");
        let run_id = {
            let ledger = SqliteLedger::open(&path).expect("open");
            ledger.insert_dedup(&record("job", "a.jpg")).expect("dedup");
            ledger.create_run(&new_run("job", Utc::now())).expect("create").run_id
        };

        let ledger = SqliteLedger::open(&path).expect("reopen");
        assert!(ledger.get_run(run_id).expect("get").is_some());
        assert!(ledger.find_dedup("job", "a.jpg").expect("find").is_some());
    }
}
