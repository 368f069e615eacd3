//! Read-only integrity passes over a log directory.

use std::fs::File;
use std::path::Path;

use bytes::Bytes;

use crate::dir;
use crate::error::{WalError, WalResult};
use crate::frame::Decoder;
use crate::record::{HardState, Record, RecordType, Snapshot};

fn open_read_only(dir_path: &Path, names: &[String]) -> WalResult<Decoder> {
    let mut readers = Vec::with_capacity(names.len());
    for name in names {
        let path = dir_path.join(name);
        let file = File::open(&path).map_err(|source| WalError::io(&path, source))?;
        readers.push((file, path));
    }
    Decoder::new(readers)
}

// Walks every complete record, handing each to `on_record`. Stops cleanly
// at the end of the stream or at a torn write in the final segment; a torn
// write anywhere earlier is an error.
fn scan(decoder: &mut Decoder, mut on_record: impl FnMut(Record) -> WalResult<()>) -> WalResult<()> {
    loop {
        let record = match decoder.next_record() {
            Ok(Some(record)) => record,
            Ok(None) => return Ok(()),
            Err(WalError::UnexpectedEof { path, offset }) => {
                if decoder.in_last_file() {
                    return Ok(());
                }
                return Err(WalError::UnexpectedEof { path, offset });
            }
            Err(err) => return Err(err),
        };

        if record.rec_type == RecordType::Crc {
            if decoder.crc() != 0 && decoder.crc() != record.crc {
                return Err(WalError::CrcMismatch {
                    expected: record.crc,
                    got: decoder.crc(),
                });
            }
            decoder.set_crc(record.crc);
            continue;
        }
        on_record(record)?;
    }
}

/// Validates the stream reachable from `snap`: crc chain, segment
/// continuity, metadata consistency, and the presence of the start
/// snapshot. Entry payloads are discarded; only the final hard state comes
/// back. Takes no locks, so it runs against a live writer.
pub fn verify(dir_path: &Path, snap: &Snapshot) -> WalResult<HardState> {
    let names = dir::read_wal_names(dir_path)?;
    let name_index = dir::select_wal_files(dir_path, &names, snap.index)?;
    let mut decoder = open_read_only(dir_path, &names[name_index..])?;

    let mut metadata: Option<Bytes> = None;
    let mut state = HardState::default();
    let mut matched = false;

    scan(&mut decoder, |record| {
        match record.rec_type {
            RecordType::Metadata => {
                if let Some(existing) = &metadata {
                    if existing != &record.data {
                        return Err(WalError::MetadataConflict);
                    }
                }
                metadata = Some(record.data.clone());
            }
            RecordType::Snapshot => {
                let loaded = Snapshot::decode(&record.data)?;
                if loaded.index == snap.index {
                    if loaded.term != snap.term {
                        return Err(WalError::SnapshotMismatch {
                            index: loaded.index,
                            term: loaded.term,
                        });
                    }
                    matched = true;
                }
            }
            RecordType::State => {
                state = HardState::decode(&record.data)?;
            }
            // entry payloads are not needed to validate the stream
            RecordType::Entry | RecordType::Crc => {}
        }
        Ok(())
    })?;

    if !matched {
        return Err(WalError::SnapshotNotFound);
    }
    Ok(state)
}

/// Enumerates the snapshot pointers proven durable by a later hard-state
/// commit: each returned pointer is covered by the final state's commit
/// index and term. A trailing orphan pointer with no commit behind it is
/// excluded. Scans every segment present, so it keeps working after old
/// segments have been purged.
pub fn valid_snapshot_entries(dir_path: &Path) -> WalResult<Vec<Snapshot>> {
    let names = dir::read_wal_names(dir_path)?;
    let mut decoder = open_read_only(dir_path, &names)?;

    let mut snapshots: Vec<Snapshot> = Vec::new();
    let mut state = HardState::default();

    scan(&mut decoder, |record| {
        match record.rec_type {
            RecordType::Snapshot => {
                snapshots.push(Snapshot::decode(&record.data)?);
            }
            RecordType::State => {
                state = HardState::decode(&record.data)?;
            }
            RecordType::Metadata | RecordType::Entry | RecordType::Crc => {}
        }
        Ok(())
    })?;

    // cuts replay the latest pointer into each new segment
    snapshots.dedup();
    snapshots.retain(|snap| snap.index <= state.commit && snap.term <= state.term);
    Ok(snapshots)
}
