//! Progress reporting trait.
//!
//! This module defines the ProgressCallback trait, which decouples the run
//! engine from whatever front end is watching it (CLI, service, tests), and
//! the per-item outcomes reported through it.

use crate::error::FailureKind;
use crate::model::{Run, SourceItem};

/// Why an item was counted as failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    /// The item's byte stream could not be opened or read
    SourceUnreadable,
    /// The remote operation failed
    Transfer(FailureKind),
    /// Staged content failed length or checksum verification
    Integrity,
    /// The upload committed but its dedup record could not be written
    LedgerWrite,
}

/// Result of processing one item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemOutcome {
    Uploaded { remote_path: String, bytes: u64 },
    /// A dedup record already existed for the item
    Skipped { remote_path: String },
    Failed { reason: FailureReason, message: String },
}

/// Trait for receiving progress updates from a run.
///
/// All methods are called synchronously on the thread executing the run.
/// `run` is the engine's in-memory view; counters reflect every item
/// completed so far.
pub trait ProgressCallback: Send + Sync {
    /// Called once the run row exists, before configuration is resolved.
    fn on_run_started(&self, run: &Run);

    /// Called after enumeration with the number of items this invocation
    /// will walk (a resumed run counts only the remaining items).
    fn on_scan_completed(&self, _run: &Run, _items_remaining: usize) {}

    /// Called when an item is about to be processed.
    fn on_item_started(&self, run: &Run, index: usize, item: &SourceItem);

    /// Called after every chunk written for the current item.
    ///
    /// `bytes_this_item` is cumulative for the item.
    fn on_item_progress(&self, run: &Run, index: usize, bytes_this_item: u64);

    /// Called when an item is done (uploaded, skipped, or failed).
    fn on_item_completed(&self, run: &Run, index: usize, item: &SourceItem, outcome: &ItemOutcome);

    /// Called when the run reaches a terminal status.
    fn on_run_completed(&self, run: &Run);

    /// Called when the run pauses for continuation instead of completing.
    fn on_run_paused(&self, _run: &Run, _cursor: &str) {}
}
