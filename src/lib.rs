//! Crash-safe, append-only write-ahead log for a replicated consensus
//! state machine.
//!
//! The log durably records three event kinds in strict order: hard-state
//! updates (term, vote, commit), replicated log entries, and snapshot
//! pointers marking compacted prefixes. On restart, [`Wal::open`] plus
//! [`Wal::read_all`] reconstruct the exact committed stream from the
//! caller's snapshot anchor, truncating at most one torn record at the
//! tail.
//!
//! Segments are preallocated files named `{seq:016x}-{index:016x}.wal`,
//! chained by a rolling CRC that survives rotation. A single writer holds
//! advisory locks on its open segments; readers never lock and stop at the
//! last complete record.

#![forbid(unsafe_code)]

pub mod config;
pub mod dir;
mod error;
pub mod frame;
pub mod record;
pub mod segment;
mod verify;
mod wal;

pub use error::{WalError, WalResult};
pub use frame::{Decoder, Encoder};
pub use record::{ConfState, Entry, HardState, Record, RecordType, Snapshot};
pub use segment::{parse_wal_name, wal_name, SegmentFile};
pub use verify::{valid_snapshot_entries, verify};
pub use wal::Wal;
