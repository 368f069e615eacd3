//! Segment file primitive: naming, creation, advisory locking,
//! preallocation, and the durable-close protocol.

use std::fs::{File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use fs2::FileExt;

use crate::error::{WalError, WalResult};

/// `{seq:016x}-{first_index:016x}.wal`
pub fn wal_name(seq: u64, index: u64) -> String {
    format!("{seq:016x}-{index:016x}.wal")
}

/// Parses a segment basename back into `(seq, first_index)`.
pub fn parse_wal_name(name: &str) -> WalResult<(u64, u64)> {
    let bad = || WalError::InvalidName {
        name: name.to_string(),
    };
    let stem = name.strip_suffix(".wal").ok_or_else(bad)?;
    let (seq_hex, index_hex) = stem.split_once('-').ok_or_else(bad)?;
    if seq_hex.len() != 16 || index_hex.len() != 16 {
        return Err(bad());
    }
    let seq = u64::from_str_radix(seq_hex, 16).map_err(|_| bad())?;
    let index = u64::from_str_radix(index_hex, 16).map_err(|_| bad())?;
    Ok((seq, index))
}

/// An open segment file plus the name components it was opened under.
/// Dropping the handle releases any advisory lock with it.
#[derive(Debug)]
pub struct SegmentFile {
    pub(crate) file: File,
    pub(crate) path: PathBuf,
    pub(crate) seq: u64,
    pub(crate) first_index: u64,
    locked: bool,
}

impl SegmentFile {
    /// Creates (or reuses) the file at `path` with owner-only permissions.
    /// `force_new` truncates any pre-existing file; `locked` takes the
    /// advisory write lock, failing with [`WalError::LockHeld`] when
    /// another writer owns it.
    pub fn create_new_wal_file(path: &Path, force_new: bool, locked: bool) -> WalResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WalError::InvalidName {
                name: path.display().to_string(),
            })?;
        let (seq, first_index) = parse_wal_name(name)?;

        let file = open_private(path, false).map_err(|source| WalError::io(path, source))?;
        let mut segment = Self {
            file,
            path: path.to_path_buf(),
            seq,
            first_index,
            locked: false,
        };
        if locked {
            segment.lock()?;
        }
        if force_new {
            segment
                .file
                .set_len(0)
                .map_err(|source| WalError::io(path, source))?;
        }
        Ok(segment)
    }

    /// Opens an existing segment read-write and takes its advisory lock.
    pub fn open_locked(path: &Path) -> WalResult<Self> {
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| WalError::InvalidName {
                name: path.display().to_string(),
            })?;
        let (seq, first_index) = parse_wal_name(name)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| WalError::io(path, source))?;
        let mut segment = Self {
            file,
            path: path.to_path_buf(),
            seq,
            first_index,
            locked: false,
        };
        segment.lock()?;
        Ok(segment)
    }

    fn lock(&mut self) -> WalResult<()> {
        match self.file.try_lock_exclusive() {
            Ok(()) => {
                self.locked = true;
                Ok(())
            }
            Err(err) if err.kind() == fs2::lock_contended_error().kind() => {
                Err(WalError::LockHeld {
                    path: self.path.clone(),
                })
            }
            Err(source) => Err(WalError::io(&self.path, source)),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Current write offset of the shared file description.
    pub fn offset(&mut self) -> WalResult<u64> {
        self.file
            .stream_position()
            .map_err(|source| WalError::io(&self.path, source))
    }

    pub fn seek_to(&mut self, offset: u64) -> WalResult<()> {
        self.file
            .seek(SeekFrom::Start(offset))
            .map(|_| ())
            .map_err(|source| WalError::io(&self.path, source))
    }

    pub fn truncate(&mut self, len: u64) -> WalResult<()> {
        self.file
            .set_len(len)
            .map_err(|source| WalError::io(&self.path, source))
    }

    /// Reserves `size` bytes. The allocation is a filesystem hint; where it
    /// is unsupported the file is extended sparsely, which still reads back
    /// as zeroes.
    pub fn preallocate(&mut self, size: u64) -> WalResult<()> {
        if size == 0 {
            return Ok(());
        }
        match self.file.allocate(size) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::Unsupported => {
                let len = self
                    .file
                    .metadata()
                    .map_err(|source| WalError::io(&self.path, source))?
                    .len();
                if len >= size {
                    return Ok(());
                }
                self.truncate(size)
            }
            Err(source) => Err(WalError::io(&self.path, source)),
        }
    }

    /// Discards everything after the current offset but keeps the file's
    /// blocks allocated, so later appends land in reserved space and read
    /// back as zeroes until overwritten.
    pub fn zero_to_end(&mut self) -> WalResult<()> {
        let off = self.offset()?;
        let end = self
            .file
            .seek(SeekFrom::End(0))
            .map_err(|source| WalError::io(&self.path, source))?;
        self.truncate(off)?;
        self.preallocate(end)?;
        self.seek_to(off)
    }

    pub fn sync_data(&self) -> WalResult<()> {
        self.file
            .sync_data()
            .map_err(|source| WalError::io(&self.path, source))
    }

    pub fn sync_all(&self) -> WalResult<()> {
        self.file
            .sync_all()
            .map_err(|source| WalError::io(&self.path, source))
    }

    pub(crate) fn try_clone_file(&self) -> WalResult<File> {
        self.file
            .try_clone()
            .map_err(|source| WalError::io(&self.path, source))
    }

    /// Fsync then release the lock; the sealed file becomes immutable.
    pub fn close(mut self) -> WalResult<()> {
        self.sync_all()?;
        self.release_lock()
    }

    pub(crate) fn release_lock(&mut self) -> WalResult<()> {
        if self.locked {
            FileExt::unlock(&self.file).map_err(|source| WalError::io(&self.path, source))?;
            self.locked = false;
        }
        Ok(())
    }
}

fn open_private(path: &Path, read: bool) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.read(read).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    options.open(path)
}
