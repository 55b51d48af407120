//! Terminal rendering of run progress.

use engine::{ItemOutcome, ProgressCallback, Run, RunStatus, SourceItem};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// CLI implementation of ProgressCallback, writing to stderr.
pub struct CliProgress {
    verbose: bool,
    start_time: Instant,
    last_progress_update: Mutex<Option<Instant>>,
    items_total: AtomicUsize,
    current_size: Mutex<Option<u64>>,
}

impl CliProgress {
    pub fn new(verbose: bool) -> Self {
        CliProgress {
            verbose,
            start_time: Instant::now(),
            last_progress_update: Mutex::new(None),
            items_total: AtomicUsize::new(0),
            current_size: Mutex::new(None),
        }
    }

    pub fn format_bytes(bytes: u64) -> String {
        const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
        let mut size = bytes as f64;
        let mut unit_idx = 0;

        while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
            size /= 1024.0;
            unit_idx += 1;
        }

        format!("{:.2} {}", size, UNITS[unit_idx])
    }

    pub fn format_duration(elapsed: Duration) -> String {
        let secs = elapsed.as_secs();
        let hours = secs / 3600;
        let mins = (secs % 3600) / 60;
        let secs = secs % 60;

        if hours > 0 {
            format!("{}h {}m {}s", hours, mins, secs)
        } else if mins > 0 {
            format!("{}m {}s", mins, secs)
        } else {
            format!("{}s", secs)
        }
    }

    pub fn progress_bar(percent: u32) -> String {
        let percent = percent.min(100);
        let filled = (percent / 5) as usize;
        let empty = 20 - filled;
        format!("[{}{}] {}%", "=".repeat(filled), " ".repeat(empty), percent)
    }

    /// Throttle progress updates to avoid spam (max once per 200ms)
    fn should_redraw(&self) -> bool {
        let Ok(mut last) = self.last_progress_update.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(previous) if now.duration_since(previous) < Duration::from_millis(200) => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl ProgressCallback for CliProgress {
    fn on_run_started(&self, run: &Run) {
        eprintln!("Run {} for job '{}'", run.run_id, run.job_id);
        if run.resume_count > 0 {
            eprintln!("  Resuming (continuation {})", run.resume_count);
        }
    }

    fn on_scan_completed(&self, run: &Run, items_remaining: usize) {
        self.items_total.store(items_remaining, Ordering::Relaxed);
        eprintln!(
            "  {} items scanned, {} to process",
            run.counters.scanned, items_remaining
        );
        eprintln!();
    }

    fn on_item_started(&self, _run: &Run, index: usize, item: &SourceItem) {
        if let Ok(mut size) = self.current_size.lock() {
            *size = item.size_bytes;
        }
        if self.verbose {
            eprintln!("[{:3}] Starting: {}", index, item.file_name());
        }
    }

    fn on_item_progress(&self, _run: &Run, index: usize, bytes_this_item: u64) {
        if !self.should_redraw() {
            return;
        }

        let size = self.current_size.lock().ok().and_then(|s| *s);
        let line = match size {
            Some(total) if total > 0 => {
                let percent = (bytes_this_item as f64 / total as f64 * 100.0) as u32;
                format!(
                    "{} {}/{}",
                    Self::progress_bar(percent),
                    Self::format_bytes(bytes_this_item),
                    Self::format_bytes(total)
                )
            }
            _ => Self::format_bytes(bytes_this_item),
        };
        eprint!("\r[{:3}] {}", index, line);
        let _ = std::io::stderr().flush();
    }

    fn on_item_completed(&self, run: &Run, index: usize, item: &SourceItem, outcome: &ItemOutcome) {
        let counters = run.counters;
        let done = counters.uploaded + counters.skipped + counters.failed;
        match outcome {
            ItemOutcome::Failed { message, .. } => {
                eprintln!("\r[{:3}] Failed: {}: {}", index, item.file_name(), message);
            }
            ItemOutcome::Uploaded { remote_path, bytes } if self.verbose => {
                eprintln!(
                    "\r[{:3}] Uploaded: {} -> {} ({})",
                    index,
                    item.file_name(),
                    remote_path,
                    Self::format_bytes(*bytes)
                );
            }
            ItemOutcome::Skipped { remote_path } if self.verbose => {
                eprintln!("\r[{:3}] Skipped: {} (already at {})", index, item.file_name(), remote_path);
            }
            _ => {
                let total = self.items_total.load(Ordering::Relaxed);
                let percent = if total == 0 { 100 } else { (done as usize * 100 / total.max(1)) as u32 };
                eprint!("\rProgress: {} | {} done", Self::progress_bar(percent), done);
                let _ = std::io::stderr().flush();
            }
        }
    }

    fn on_run_completed(&self, run: &Run) {
        eprintln!();
        let verdict = match run.status {
            RunStatus::Success => "Run complete!",
            RunStatus::Partial => "Run finished with failures.",
            RunStatus::Canceled => "Run canceled.",
            RunStatus::Interrupted => "Run interrupted.",
            _ => "Run failed.",
        };
        eprintln!("{}", verdict);

        let counters = run.counters;
        eprintln!(
            "Summary: {} scanned, {} uploaded, {} skipped, {} failed",
            counters.scanned, counters.uploaded, counters.skipped, counters.failed
        );
        if let Some(err) = &run.summary_error {
            eprintln!("First error: {}", err);
        }
        eprintln!("Elapsed: {}", Self::format_duration(self.start_time.elapsed()));
    }

    fn on_run_paused(&self, run: &Run, _cursor: &str) {
        eprintln!();
        eprintln!(
            "Time budget reached after {} uploaded, {} skipped, {} failed; run paused.",
            run.counters.uploaded, run.counters.skipped, run.counters.failed
        );
    }
}
