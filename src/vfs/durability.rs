//! The external commit/snapshot log that makes memory-backed writes durable.
//!
//! The log is a black box with two synchronous entry points: `start` opens a
//! session for a durability handle when a memory-backed file is opened, and
//! `commit` snapshots everything written so far.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;
use tracing::debug;

use crate::types::{DurabilityError, DurabilityHandle};

/// Result of a durability log call.
pub type LogResult = std::result::Result<(), DurabilityError>;

/// Entry points of the external commit/snapshot log.
pub trait DurabilityLog: Send + Sync {
    /// Starts (or joins) the session identified by `handle`.
    fn start(&self, handle: DurabilityHandle) -> LogResult;
    /// Commits a checkpoint of the session identified by `handle`.
    fn commit(&self, handle: DurabilityHandle) -> LogResult;
}

#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
struct Session {
    starts: u64,
    commits: u64,
}

#[derive(Default)]
struct Recorded {
    sessions: HashMap<DurabilityHandle, Session>,
    failing_starts: HashSet<DurabilityHandle>,
    failing_commits: HashSet<DurabilityHandle>,
}

/// In-process log that records calls per handle.
///
/// Failures can be injected per handle to exercise the error paths.
#[derive(Default)]
pub struct RecordingLog {
    inner: Mutex<Recorded>,
}

impl RecordingLog {
    /// Creates an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `start` calls for `handle`.
    pub fn starts(&self, handle: DurabilityHandle) -> u64 {
        self.session(handle).starts
    }

    /// Number of successful `commit` calls for `handle`.
    pub fn commits(&self, handle: DurabilityHandle) -> u64 {
        self.session(handle).commits
    }

    /// Successful commits across every handle.
    pub fn total_commits(&self) -> u64 {
        self.inner
            .lock()
            .sessions
            .values()
            .map(|session| session.commits)
            .sum()
    }

    /// Makes every later `start` for `handle` fail.
    pub fn fail_starts(&self, handle: DurabilityHandle) {
        self.inner.lock().failing_starts.insert(handle);
    }

    /// Makes every later `commit` for `handle` fail.
    pub fn fail_commits(&self, handle: DurabilityHandle) {
        self.inner.lock().failing_commits.insert(handle);
    }

    /// Clears all injected failures.
    pub fn clear_failures(&self) {
        let mut inner = self.inner.lock();
        inner.failing_starts.clear();
        inner.failing_commits.clear();
    }

    fn session(&self, handle: DurabilityHandle) -> Session {
        self.inner
            .lock()
            .sessions
            .get(&handle)
            .copied()
            .unwrap_or_default()
    }
}

impl DurabilityLog for RecordingLog {
    fn start(&self, handle: DurabilityHandle) -> LogResult {
        let mut inner = self.inner.lock();
        if inner.failing_starts.contains(&handle) {
            return Err(DurabilityError {
                op: "start",
                handle,
                status: -1,
            });
        }
        let session = inner.sessions.entry(handle).or_default();
        session.starts += 1;
        debug!(handle = handle.get(), starts = session.starts, "durability.start");
        Ok(())
    }

    fn commit(&self, handle: DurabilityHandle) -> LogResult {
        let mut inner = self.inner.lock();
        if inner.failing_commits.contains(&handle) {
            return Err(DurabilityError {
                op: "commit",
                handle,
                status: -1,
            });
        }
        let session = inner.sessions.entry(handle).or_default();
        session.commits += 1;
        debug!(handle = handle.get(), commits = session.commits, "durability.commit");
        Ok(())
    }
}

#[cfg(feature = "sas-trace")]
pub use self::external::ExternLog;

#[cfg(feature = "sas-trace")]
#[allow(unsafe_code)]
mod external {
    use std::ffi::c_int;

    use super::{DurabilityLog, LogResult};
    use crate::types::{DurabilityError, DurabilityHandle};

    extern "C" {
        fn sas_trace_start(fd: c_int) -> c_int;
        fn sas_trace_commit(fd: c_int) -> c_int;
    }

    /// The linked `sas_trace_*` commit/snapshot log.
    ///
    /// `start` fails on any non-zero status, `commit` on a negative one.
    #[derive(Debug, Default, Clone, Copy)]
    pub struct ExternLog;

    fn descriptor(op: &'static str, handle: DurabilityHandle) -> Result<c_int, DurabilityError> {
        c_int::try_from(handle.get()).map_err(|_| DurabilityError {
            op,
            handle,
            status: -1,
        })
    }

    impl DurabilityLog for ExternLog {
        fn start(&self, handle: DurabilityHandle) -> LogResult {
            let fd = descriptor("start", handle)?;
            // SAFETY: plain C call taking and returning integers.
            let status = unsafe { sas_trace_start(fd) };
            if status != 0 {
                return Err(DurabilityError {
                    op: "start",
                    handle,
                    status,
                });
            }
            Ok(())
        }

        fn commit(&self, handle: DurabilityHandle) -> LogResult {
            let fd = descriptor("commit", handle)?;
            // SAFETY: plain C call taking and returning integers.
            let status = unsafe { sas_trace_commit(fd) };
            if status < 0 {
                return Err(DurabilityError {
                    op: "commit",
                    handle,
                    status,
                });
            }
            Ok(())
        }
    }
}
