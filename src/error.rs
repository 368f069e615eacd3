use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type WalResult<T> = Result<T, WalError>;

/// Errors surfaced by the write-ahead log.
///
/// Write-path errors leave the handle open but the caller must not assume
/// the attempted write durable. Read-path errors are fatal for the current
/// open, except the torn tail which `read_all` repairs in place.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    #[error("io error at {path:?}: {source}")]
    Io {
        path: Option<PathBuf>,
        #[source]
        source: io::Error,
    },

    #[error("wal directory already initialized: {dir:?}")]
    DirExist { dir: PathBuf },

    #[error("no wal segment covers the requested snapshot")]
    FileNotFound,

    #[error("crc mismatch: expected {expected:#010x}, got {got:#010x}")]
    CrcMismatch { expected: u32, got: u32 },

    #[error("unexpected end of stream at {path:?} offset {offset}")]
    UnexpectedEof { path: PathBuf, offset: u64 },

    #[error("conflicting metadata found")]
    MetadataConflict,

    #[error("initial segment missing metadata record")]
    MetadataMissing,

    #[error("snapshot mismatch at index {index}: stream has term {term}")]
    SnapshotMismatch { index: u64, term: u64 },

    #[error("start snapshot not found in stream")]
    SnapshotNotFound,

    #[error("entry index {index} is not contiguous (expected {expected})")]
    EntryNotContiguous { index: u64, expected: u64 },

    #[error("wal file sequence numbers do not increase continuously in {dir:?}")]
    SeqNotContinuous { dir: PathBuf },

    #[error("entry index {index} out of range for scan started at {start}")]
    SliceOutOfRange { index: u64, start: u64 },

    #[error("decoder not found: handle not positioned for reading")]
    DecoderNotFound,

    #[error("wal directory is locked by another writer: {path:?}")]
    LockHeld { path: PathBuf },

    #[error("invalid frame: {reason}")]
    InvalidFrame { reason: String },

    #[error("record exceeds max record bytes {limit} (got {got})")]
    RecordTooLarge { limit: u64, got: u64 },

    #[error("bad wal segment name: {name:?}")]
    InvalidName { name: String },

    #[error("invalid snapshot record: {reason}")]
    InvalidSnapshot { reason: String },
}

impl WalError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        WalError::Io {
            path: Some(path.into()),
            source,
        }
    }

    pub(crate) fn io_nopath(source: io::Error) -> Self {
        WalError::Io { path: None, source }
    }

    pub(crate) fn invalid_frame(reason: impl Into<String>) -> Self {
        WalError::InvalidFrame {
            reason: reason.into(),
        }
    }
}
