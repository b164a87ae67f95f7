#![forbid(unsafe_code)]

//! Per-open configuration of a memory-backed main database.
//!
//! The engine forwards the caller's URI parameters untouched, so every knob
//! of a memory-backed file travels as a `key=value` pair:
//!
//! | key          | meaning                                   | default |
//! |--------------|-------------------------------------------|---------|
//! | `ptr`        | address of the lent buffer                | required |
//! | `sz`         | current database size in bytes            | required |
//! | `max`        | buffer capacity (`maxsz` is accepted too) | `sz`    |
//! | `fd`         | durability log session                    | required |
//! | `threshold`  | bytes written before a checkpoint         | `0` (off) |
//! | `ckptOnSync` | checkpoint on sync when `> 0`             | `1`     |

use std::fmt;

use crate::provider::{UriParameters, UriPath};
use crate::types::{DurabilityHandle, Result, VfsError};

/// URI parameter naming the buffer address.
pub const PARAM_ADDRESS: &str = "ptr";
/// URI parameter naming the current database size.
pub const PARAM_SIZE: &str = "sz";
/// URI parameter naming the buffer capacity.
pub const PARAM_CAPACITY: &str = "max";
/// Alternate spelling of [`PARAM_CAPACITY`].
pub const PARAM_CAPACITY_ALT: &str = "maxsz";
/// URI parameter naming the durability log session.
pub const PARAM_DURABILITY: &str = "fd";
/// URI parameter naming the write-path checkpoint threshold.
pub const PARAM_THRESHOLD: &str = "threshold";
/// URI parameter toggling checkpoints on sync.
pub const PARAM_CKPT_ON_SYNC: &str = "ckptOnSync";

/// Typed configuration extracted from an open request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemoryFileConfig {
    /// Start address of the lent buffer.
    pub address: usize,
    /// Initial logical file length.
    pub size: u64,
    /// Fixed capacity of the buffer.
    pub capacity: u64,
    /// Durability log session the file commits to.
    pub durability: DurabilityHandle,
    /// Unflushed bytes that trigger a checkpoint from the write path; zero
    /// disables write-path checkpoints.
    pub checkpoint_threshold: u64,
    /// Whether a sync with unflushed bytes commits a checkpoint.
    pub checkpoint_on_flush: bool,
}

impl MemoryFileConfig {
    /// Configuration for a buffer at `address` holding `size` bytes of
    /// database and `capacity` bytes in total, with default checkpointing.
    pub fn new(address: usize, size: u64, capacity: u64, durability: DurabilityHandle) -> Self {
        Self {
            address,
            size,
            capacity,
            durability,
            checkpoint_threshold: 0,
            checkpoint_on_flush: true,
        }
    }

    /// Sets the write-path checkpoint threshold.
    pub fn with_threshold(mut self, threshold: u64) -> Self {
        self.checkpoint_threshold = threshold;
        self
    }

    /// Enables or disables checkpoints on sync.
    pub fn with_checkpoint_on_flush(mut self, enabled: bool) -> Self {
        self.checkpoint_on_flush = enabled;
        self
    }

    /// Extracts the configuration from an open request's parameters.
    pub fn parse<P: UriParameters + ?Sized>(params: &P) -> Result<Self> {
        let int = |key: &str| params.parameter(key).and_then(parse_int64);

        let address = int(PARAM_ADDRESS)
            .filter(|&raw| raw != 0)
            .and_then(|raw| usize::try_from(raw as u64).ok())
            .ok_or(VfsError::CantOpen("missing or zero ptr parameter"))?;

        let size = int(PARAM_SIZE)
            .filter(|&raw| raw >= 0)
            .ok_or(VfsError::CantOpen("missing or negative sz parameter"))? as u64;

        let capacity = int(PARAM_CAPACITY)
            .or_else(|| int(PARAM_CAPACITY_ALT))
            .unwrap_or(size as i64);
        if capacity < 0 || (capacity as u64) < size {
            return Err(VfsError::CantOpen("max parameter smaller than sz"));
        }

        let durability = int(PARAM_DURABILITY)
            .and_then(DurabilityHandle::new)
            .ok_or(VfsError::CantOpen("missing or zero fd parameter"))?;

        let threshold = int(PARAM_THRESHOLD).unwrap_or(0);
        if threshold < 0 {
            return Err(VfsError::CantOpen("negative threshold parameter"));
        }

        let checkpoint_on_flush = int(PARAM_CKPT_ON_SYNC).unwrap_or(1) > 0;

        Ok(Self {
            address,
            size,
            capacity: capacity as u64,
            durability,
            checkpoint_threshold: threshold as u64,
            checkpoint_on_flush,
        })
    }

    /// Builds the `file:` name that opens `path` with this configuration.
    pub fn to_uri(&self, path: &str) -> UriPath {
        UriPath::new(path)
            .with_param(PARAM_ADDRESS, format_args!("{:#x}", self.address))
            .with_param(PARAM_SIZE, self.size)
            .with_param(PARAM_CAPACITY, self.capacity)
            .with_param(PARAM_DURABILITY, self.durability)
            .with_param(PARAM_THRESHOLD, self.checkpoint_threshold)
            .with_param(PARAM_CKPT_ON_SYNC, u8::from(self.checkpoint_on_flush))
    }
}

impl fmt::Display for MemoryFileConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ptr={:#x} sz={} max={} fd={} threshold={} ckptOnSync={}",
            self.address,
            self.size,
            self.capacity,
            self.durability,
            self.checkpoint_threshold,
            u8::from(self.checkpoint_on_flush)
        )
    }
}

/// Parses a 64-bit integer the way the engine reads URI integers.
///
/// Surrounding whitespace is ignored. Decimal values take an optional sign.
/// A `0x`/`0X` prefix introduces up to sixteen hex digits whose bits are
/// reinterpreted as a signed value. Anything else, including overflow and
/// trailing garbage, yields `None`.
pub fn parse_int64(text: &str) -> Option<i64> {
    let text = text.trim();
    if let Some(hex) = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
    {
        let digits = hex.trim_start_matches('0');
        if digits.len() > 16 {
            return None;
        }
        if digits.is_empty() {
            return Some(0);
        }
        return u64::from_str_radix(digits, 16).ok().map(|raw| raw as i64);
    }
    let unsigned = text.strip_prefix(['+', '-']).unwrap_or(text);
    if unsigned.is_empty() || !unsigned.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.strip_prefix('+').unwrap_or(text).parse::<i64>().ok()
}
