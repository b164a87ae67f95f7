#![forbid(unsafe_code)]

//! Checkpoint trigger accounting for memory-backed files.
//!
//! Every successful write adds its length to an unflushed counter. A
//! checkpoint (one `commit` on the durability log) fires from the write path
//! once the counter strictly exceeds a non-zero threshold, and from the sync
//! path whenever checkpoint-on-flush is enabled and anything is unflushed.
//! A fired checkpoint resets the counter; a failed one leaves it untouched
//! and is never retried here.

use tracing::{debug, warn};

use super::durability::DurabilityLog;
use crate::types::{DurabilityHandle, Result, VfsError};

/// What a trigger check decided.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Checkpoint {
    /// No commit was needed.
    Skipped,
    /// A commit ran and the counter was reset.
    Committed,
}

/// Write accounting and trigger policy of one memory-backed file.
#[derive(Clone, Debug)]
pub struct CheckpointTrigger {
    unflushed: u64,
    threshold: u64,
    on_flush: bool,
}

impl CheckpointTrigger {
    /// Creates a trigger with nothing unflushed.
    pub fn new(threshold: u64, on_flush: bool) -> Self {
        Self {
            unflushed: 0,
            threshold,
            on_flush,
        }
    }

    /// Bytes written since the last checkpoint.
    pub fn unflushed(&self) -> u64 {
        self.unflushed
    }

    /// Write-path threshold; zero means disabled.
    pub fn threshold(&self) -> u64 {
        self.threshold
    }

    /// Whether syncs commit checkpoints.
    pub fn on_flush(&self) -> bool {
        self.on_flush
    }

    /// Accounts a successful write of `len` bytes.
    pub fn record_write(&mut self, len: usize) {
        self.unflushed = self.unflushed.saturating_add(len as u64);
    }

    /// Runs the write-path check after a write has been applied.
    pub fn after_write(
        &mut self,
        log: &dyn DurabilityLog,
        handle: DurabilityHandle,
    ) -> Result<Checkpoint> {
        if self.threshold == 0 || self.unflushed <= self.threshold {
            return Ok(Checkpoint::Skipped);
        }
        self.commit(log, handle, "write")
    }

    /// Runs the flush-path check for a sync.
    pub fn on_sync(
        &mut self,
        log: &dyn DurabilityLog,
        handle: DurabilityHandle,
    ) -> Result<Checkpoint> {
        if !self.on_flush || self.unflushed == 0 {
            return Ok(Checkpoint::Skipped);
        }
        self.commit(log, handle, "sync")
    }

    fn commit(
        &mut self,
        log: &dyn DurabilityLog,
        handle: DurabilityHandle,
        path: &'static str,
    ) -> Result<Checkpoint> {
        debug!(
            handle = handle.get(),
            unflushed = self.unflushed,
            threshold = self.threshold,
            path,
            "checkpoint.commit"
        );
        match log.commit(handle) {
            Ok(()) => {
                self.unflushed = 0;
                Ok(Checkpoint::Committed)
            }
            Err(err) => {
                warn!(error = %err, unflushed = self.unflushed, path, "checkpoint.failed");
                Err(VfsError::Snapshot(err))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vfs::durability::RecordingLog;

    fn handle() -> DurabilityHandle {
        DurabilityHandle::new(11).unwrap()
    }

    #[test]
    fn zero_threshold_never_fires_on_write() {
        let log = RecordingLog::new();
        let mut trigger = CheckpointTrigger::new(0, false);
        for _ in 0..100 {
            trigger.record_write(4096);
            assert_eq!(trigger.after_write(&log, handle()).unwrap(), Checkpoint::Skipped);
        }
        assert_eq!(log.commits(handle()), 0);
        assert_eq!(trigger.unflushed(), 409_600);
    }

    #[test]
    fn threshold_comparison_is_strict() {
        let log = RecordingLog::new();
        let mut trigger = CheckpointTrigger::new(100, true);
        trigger.record_write(60);
        trigger.after_write(&log, handle()).unwrap();
        trigger.record_write(40);
        assert_eq!(trigger.after_write(&log, handle()).unwrap(), Checkpoint::Skipped);
        assert_eq!(trigger.unflushed(), 100);
        trigger.record_write(1);
        assert_eq!(trigger.after_write(&log, handle()).unwrap(), Checkpoint::Committed);
        assert_eq!(trigger.unflushed(), 0);
        assert_eq!(log.commits(handle()), 1);
    }

    #[test]
    fn sync_commits_only_with_unflushed_bytes() {
        let log = RecordingLog::new();
        let mut trigger = CheckpointTrigger::new(0, true);
        assert_eq!(trigger.on_sync(&log, handle()).unwrap(), Checkpoint::Skipped);
        trigger.record_write(10);
        assert_eq!(trigger.on_sync(&log, handle()).unwrap(), Checkpoint::Committed);
        assert_eq!(trigger.on_sync(&log, handle()).unwrap(), Checkpoint::Skipped);
        assert_eq!(log.commits(handle()), 1);
    }

    #[test]
    fn sync_is_inert_when_flush_checkpoints_are_off() {
        let log = RecordingLog::new();
        let mut trigger = CheckpointTrigger::new(0, false);
        trigger.record_write(10);
        assert_eq!(trigger.on_sync(&log, handle()).unwrap(), Checkpoint::Skipped);
        assert_eq!(trigger.unflushed(), 10);
    }

    #[test]
    fn failed_commit_keeps_the_counter() {
        let log = RecordingLog::new();
        log.fail_commits(handle());
        let mut trigger = CheckpointTrigger::new(5, true);
        trigger.record_write(6);
        let err = trigger.after_write(&log, handle()).unwrap_err();
        assert!(matches!(err, VfsError::Snapshot(_)));
        assert_eq!(trigger.unflushed(), 6);
        let err = trigger.on_sync(&log, handle()).unwrap_err();
        assert_eq!(err.code(), crate::types::codes::SQLITE_ERROR_SNAPSHOT);
        assert_eq!(trigger.unflushed(), 6);
    }
}
