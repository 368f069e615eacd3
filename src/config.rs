//! Process-wide write-ahead log tunables.
//!
//! Both knobs are read at segment-creation and decode time, so they must be
//! configured before the first [`crate::Wal::create`] in the process. They
//! are plain atomics rather than per-handle configuration because every
//! handle on a directory must agree on them.

use std::sync::atomic::{AtomicU64, Ordering};

/// Default preallocation size for a new segment file.
pub const DEFAULT_SEGMENT_SIZE_BYTES: u64 = 64 * 1024 * 1024;

/// Default upper bound on a single decoded record.
pub const DEFAULT_MAX_RECORD_BYTES: u64 = 128 * 1024 * 1024;

static SEGMENT_SIZE_BYTES: AtomicU64 = AtomicU64::new(DEFAULT_SEGMENT_SIZE_BYTES);
static MAX_RECORD_BYTES: AtomicU64 = AtomicU64::new(DEFAULT_MAX_RECORD_BYTES);

/// Size threshold at which the tail segment is cut. The effective segment
/// size may exceed this because cuts happen at record boundaries.
pub fn segment_size_bytes() -> u64 {
    SEGMENT_SIZE_BYTES.load(Ordering::Relaxed)
}

pub fn set_segment_size_bytes(bytes: u64) {
    SEGMENT_SIZE_BYTES.store(bytes, Ordering::Relaxed);
}

/// Largest record length the decoder will accept from a length header.
pub fn max_record_bytes() -> u64 {
    MAX_RECORD_BYTES.load(Ordering::Relaxed)
}

pub fn set_max_record_bytes(bytes: u64) {
    MAX_RECORD_BYTES.store(bytes, Ordering::Relaxed);
}
