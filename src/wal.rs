//! The write-ahead log handle.
//!
//! One process holds at most one write-mode handle per directory, enforced
//! by advisory locks on the open segments. Readers never lock; they stop at
//! the last complete record, which tolerates a concurrent writer on the
//! tail.

use std::fs::File;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use bytes::Bytes;

use crate::config;
use crate::dir;
use crate::error::{WalError, WalResult};
use crate::frame::{Decoder, Encoder};
use crate::record::{Entry, HardState, RecordType, Snapshot};
use crate::segment::{wal_name, SegmentFile};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

/// A write-ahead log rooted at one directory.
#[derive(Debug)]
pub struct Wal {
    dir: PathBuf,
    dir_file: Option<File>,
    mode: Mode,
    /// Snapshot the scan is anchored at; entries at or below its index are
    /// pre-snapshot residue.
    start: Snapshot,
    decoder: Option<Decoder>,
    encoder: Option<Encoder<BufWriter<File>>>,
    /// Open segments in order; the tail is last. Empty in read mode.
    locks: Vec<SegmentFile>,
    /// Sequence number of the first scanned segment.
    first_seq: u64,
    /// Highest entry or snapshot index seen; names the next cut.
    last_index: u64,
    /// Most recent snapshot pointer, replayed into each new segment.
    last_snapshot: Option<Snapshot>,
}

impl Wal {
    /// Atomically initializes `dir` and returns an open, locked writer
    /// positioned at the tail of segment zero.
    ///
    /// The fresh log holds a zero crc record, the caller's metadata, and
    /// the zero snapshot pointer, so an open at the zero snapshot always
    /// finds its anchor.
    pub fn create(dir: &Path, metadata: &[u8]) -> WalResult<Self> {
        if dir::exist(dir) {
            return Err(WalError::DirExist {
                dir: dir.to_path_buf(),
            });
        }
        let tmp = dir::prepare_tmp_dir(dir)?;
        let result = Self::create_in_tmp(dir, &tmp, metadata);
        if result.is_err() {
            let _ = std::fs::remove_dir_all(&tmp);
        }
        result
    }

    fn create_in_tmp(dir: &Path, tmp: &Path, metadata: &[u8]) -> WalResult<Self> {
        let mut tail = SegmentFile::create_new_wal_file(&tmp.join(wal_name(0, 0)), true, true)?;
        tail.preallocate(config::segment_size_bytes())?;

        let mut encoder = Encoder::new(BufWriter::new(tail.try_clone_file()?), 0);
        encoder.encode(RecordType::Crc, &[])?;
        encoder.encode(RecordType::Metadata, metadata)?;
        let snap = Snapshot::default();
        encoder.encode(RecordType::Snapshot, &snap.encode())?;
        encoder.flush()?;
        tail.sync_all()?;

        dir::commit_tmp_dir(tmp, dir)?;
        // the rename moved the inode; the lock followed it
        tail.path = dir.join(wal_name(0, 0));
        let dir_file = File::open(dir).map_err(|source| WalError::io(dir, source))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            dir_file: Some(dir_file),
            mode: Mode::Write,
            start: Snapshot::default(),
            decoder: None,
            encoder: Some(encoder),
            locks: vec![tail],
            first_seq: 0,
            last_index: 0,
            last_snapshot: Some(snap),
        })
    }

    /// Opens for writing: locks every segment from the one covering `snap`
    /// through the tail. Call [`Wal::read_all`] before appending.
    pub fn open(dir: &Path, snap: Snapshot) -> WalResult<Self> {
        let mut wal = Self::open_at_index(dir, snap, true)?;
        wal.dir_file = Some(File::open(dir).map_err(|source| WalError::io(dir, source))?);
        Ok(wal)
    }

    /// Opens read-only: takes no locks and tolerates a concurrent writer
    /// appending to the tail.
    pub fn open_for_read(dir: &Path, snap: Snapshot) -> WalResult<Self> {
        Self::open_at_index(dir, snap, false)
    }

    fn open_at_index(dir: &Path, snap: Snapshot, write: bool) -> WalResult<Self> {
        let names = dir::read_wal_names(dir)?;
        let name_index = dir::select_wal_files(dir, &names, snap.index)?;
        let (first_seq, _) = crate::segment::parse_wal_name(&names[name_index])?;

        let mut locks = Vec::new();
        let mut readers = Vec::new();
        for name in &names[name_index..] {
            let path = dir.join(name);
            if write {
                let seg = SegmentFile::open_locked(&path)?;
                readers.push((seg.try_clone_file()?, path));
                locks.push(seg);
            } else {
                let file = File::open(&path).map_err(|source| WalError::io(&path, source))?;
                readers.push((file, path));
            }
        }
        let decoder = Decoder::new(readers)?;

        Ok(Self {
            dir: dir.to_path_buf(),
            dir_file: None,
            mode: if write { Mode::Write } else { Mode::Read },
            start: snap,
            decoder: Some(decoder),
            encoder: None,
            locks,
            first_seq,
            last_index: 0,
            last_snapshot: None,
        })
    }

    /// Replays the stream from the start snapshot and returns
    /// `(metadata, last hard state, entries)`.
    ///
    /// A torn write at the tail of the last segment is repaired in place:
    /// the segment is truncated at the last complete record and the scan
    /// succeeds with the prefix. A torn write anywhere earlier is fatal.
    /// In write mode the handle comes back positioned for appending,
    /// chained to the recovered crc.
    pub fn read_all(&mut self) -> WalResult<(Bytes, HardState, Vec<Entry>)> {
        let mut decoder = self.decoder.take().ok_or(WalError::DecoderNotFound)?;

        let mut metadata: Option<Bytes> = None;
        let mut state = HardState::default();
        let mut entries: Vec<Entry> = Vec::new();
        let mut matched = false;

        loop {
            let record = match decoder.next_record() {
                Ok(Some(record)) => record,
                Ok(None) => break,
                Err(WalError::UnexpectedEof { path, offset }) => {
                    if decoder.in_last_file() {
                        tracing::warn!(
                            path = %path.display(),
                            offset,
                            "torn write at wal tail, truncating partial record"
                        );
                        break;
                    }
                    return Err(WalError::UnexpectedEof { path, offset });
                }
                Err(err) => return Err(err),
            };

            match record.rec_type {
                RecordType::Entry => {
                    let entry = Entry::decode(&record.data)?;
                    if entry.index > self.start.index {
                        // slot this entry would occupy in the result
                        let slot = entry.index - self.start.index - 1;
                        if slot > entries.len() as u64 {
                            return Err(WalError::SliceOutOfRange {
                                index: entry.index,
                                start: self.start.index,
                            });
                        }
                        if (slot as usize) < entries.len() {
                            return Err(WalError::EntryNotContiguous {
                                index: entry.index,
                                expected: self.start.index + entries.len() as u64 + 1,
                            });
                        }
                        self.last_index = entry.index;
                        entries.push(entry);
                    } else {
                        self.last_index = entry.index;
                    }
                }
                RecordType::State => {
                    state = HardState::decode(&record.data)?;
                }
                RecordType::Metadata => {
                    if !decoder.in_first_file() {
                        return Err(WalError::MetadataConflict);
                    }
                    if let Some(existing) = &metadata {
                        if existing != &record.data {
                            return Err(WalError::MetadataConflict);
                        }
                    }
                    metadata = Some(record.data.clone());
                }
                RecordType::Crc => {
                    if decoder.crc() != 0 && decoder.crc() != record.crc {
                        return Err(WalError::CrcMismatch {
                            expected: record.crc,
                            got: decoder.crc(),
                        });
                    }
                    decoder.set_crc(record.crc);
                }
                RecordType::Snapshot => {
                    let snap = Snapshot::decode(&record.data)?;
                    if snap.index == self.start.index {
                        if snap.term != self.start.term {
                            return Err(WalError::SnapshotMismatch {
                                index: snap.index,
                                term: snap.term,
                            });
                        }
                        matched = true;
                    }
                    if snap.index > self.last_index {
                        self.last_index = snap.index;
                    }
                    self.last_snapshot = Some(snap);
                }
            }
        }

        if metadata.is_none() && self.first_seq == 0 {
            return Err(WalError::MetadataMissing);
        }
        if !matched {
            return Err(WalError::SnapshotNotFound);
        }

        if self.mode == Mode::Write {
            // hand off to the writer at the first byte past the last
            // complete record; anything after it was never durable
            let offset = decoder.last_valid_offset();
            let crc = decoder.crc();
            drop(decoder);
            let tail = self.locks.last_mut().ok_or(WalError::DecoderNotFound)?;
            tail.seek_to(offset)?;
            tail.zero_to_end()?;
            self.encoder = Some(Encoder::new(BufWriter::new(tail.try_clone_file()?), crc));
        }

        Ok((metadata.unwrap_or_default(), state, entries))
    }

    /// Durably appends `entries` followed by a non-empty `state`, blocking
    /// until the tail is fsynced. A no-op when both are empty. Cuts to a
    /// new segment once the tail passes the configured size.
    pub fn save(&mut self, state: HardState, entries: &[Entry]) -> WalResult<()> {
        self.ensure_writable()?;
        if state.is_empty() && entries.is_empty() {
            return Ok(());
        }

        for entry in entries {
            self.append_entry(entry)?;
        }
        self.append_state(&state)?;
        self.encoder_mut()?.flush()?;

        let offset = self.tail_mut()?.offset()?;
        if offset < config::segment_size_bytes() {
            return self.sync();
        }
        self.cut()
    }

    /// Durably appends a snapshot pointer and remembers it for future
    /// cuts. A pointer ahead of the last entry also advances the index the
    /// next cut is named after.
    pub fn save_snapshot(&mut self, snap: Snapshot) -> WalResult<()> {
        snap.validate_for_write()?;
        self.ensure_writable()?;

        let data = snap.encode();
        self.encoder_mut()?.encode(RecordType::Snapshot, &data)?;
        if self.last_index < snap.index {
            self.last_index = snap.index;
        }
        self.last_snapshot = Some(snap);
        self.sync()
    }

    /// Seals the tail and rotates to `wal_name(seq+1, last_index+1)`. The
    /// sealed file is truncated to its data size; the new tail opens with
    /// a chained crc record and the latest snapshot pointer.
    pub fn cut(&mut self) -> WalResult<()> {
        self.ensure_writable()?;
        self.encoder_mut()?.flush()?;

        let tail = self.tail_mut()?;
        let offset = tail.offset()?;
        tail.truncate(offset)?;
        self.sync()?;

        let seq = self.tail_mut()?.seq() + 1;
        let first_index = self.last_index + 1;
        let path = self.dir.join(wal_name(seq, first_index));

        let mut tail = SegmentFile::create_new_wal_file(&path, true, true)?;
        tail.preallocate(config::segment_size_bytes())?;

        let prev_crc = self.encoder_mut()?.crc();
        let mut encoder = Encoder::new(BufWriter::new(tail.try_clone_file()?), prev_crc);
        encoder.encode(RecordType::Crc, &[])?;
        if let Some(snap) = self.last_snapshot.clone() {
            encoder.encode(RecordType::Snapshot, &snap.encode())?;
        }
        encoder.flush()?;
        tail.sync_data()?;
        if let Some(dir_file) = &self.dir_file {
            dir_file
                .sync_all()
                .map_err(|source| WalError::io(&self.dir, source))?;
        }

        tracing::info!(path = %path.display(), "created a new wal segment");
        self.locks.push(tail);
        self.encoder = Some(encoder);
        Ok(())
    }

    /// Releases advisory locks on all segments strictly before the last
    /// one whose first-index is at or below `index`. That segment stays
    /// locked so the boundary remains findable; locks are only ever
    /// released, never re-acquired.
    pub fn release_lock_to(&mut self, index: u64) -> WalResult<()> {
        if self.locks.is_empty() {
            return Ok(());
        }

        let mut smaller = self.locks.len() - 1;
        for (i, lock) in self.locks.iter().enumerate() {
            if lock.first_index() >= index {
                if i == 0 {
                    return Ok(());
                }
                smaller = i - 1;
                break;
            }
        }
        if smaller == 0 {
            return Ok(());
        }

        for mut seg in self.locks.drain(..smaller) {
            if let Err(err) = seg.release_lock() {
                tracing::warn!(path = %seg.path().display(), "failed to unlock wal segment: {err}");
            }
        }
        Ok(())
    }

    /// Fsyncs the tail (write mode) and releases every lock.
    pub fn close(mut self) -> WalResult<()> {
        if self.mode == Mode::Write && !self.locks.is_empty() {
            self.sync()?;
        }
        self.decoder = None;
        self.encoder = None;
        for mut seg in self.locks.drain(..) {
            if let Err(err) = seg.release_lock() {
                tracing::warn!(path = %seg.path().display(), "failed to unlock wal segment: {err}");
            }
        }
        Ok(())
    }

    /// Closes the handle and quarantines the directory under a timestamped
    /// `.broken` suffix for postmortem inspection.
    pub fn cleanup(self) -> WalResult<PathBuf> {
        let dir = self.dir.clone();
        self.close()?;
        dir::cleanup_wal(&dir)
    }

    /// Flushes buffered records and fsyncs the tail.
    pub fn sync(&mut self) -> WalResult<()> {
        if let Some(encoder) = self.encoder.as_mut() {
            encoder.flush()?;
        }
        match self.locks.last() {
            Some(tail) => tail.sync_data(),
            None => Ok(()),
        }
    }

    /// Path of the segment currently being appended to.
    pub fn tail_path(&self) -> Option<&Path> {
        self.locks.last().map(|seg| seg.path())
    }

    /// Sequence number of the tail segment.
    pub fn seq(&self) -> u64 {
        self.locks.last().map(|seg| seg.seq()).unwrap_or(0)
    }

    /// Current end of the written stream within the tail segment.
    pub fn tail_offset(&mut self) -> WalResult<u64> {
        self.ensure_writable()?;
        self.encoder_mut()?.flush()?;
        self.tail_mut()?.offset()
    }

    fn append_entry(&mut self, entry: &Entry) -> WalResult<()> {
        let data = entry.encode();
        self.encoder_mut()?.encode(RecordType::Entry, &data)?;
        self.last_index = entry.index;
        Ok(())
    }

    fn append_state(&mut self, state: &HardState) -> WalResult<()> {
        if state.is_empty() {
            return Ok(());
        }
        let data = state.encode();
        self.encoder_mut()?.encode(RecordType::State, &data)
    }

    fn ensure_writable(&self) -> WalResult<()> {
        if self.mode != Mode::Write || self.encoder.is_none() {
            return Err(WalError::DecoderNotFound);
        }
        Ok(())
    }

    fn encoder_mut(&mut self) -> WalResult<&mut Encoder<BufWriter<File>>> {
        self.encoder.as_mut().ok_or(WalError::DecoderNotFound)
    }

    fn tail_mut(&mut self) -> WalResult<&mut SegmentFile> {
        self.locks.last_mut().ok_or(WalError::DecoderNotFound)
    }
}
