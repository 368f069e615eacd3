#![allow(dead_code)]

use std::fs::OpenOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Once;

use bytes::Bytes;

use raftwal::{config, ConfState, Entry, HardState, Snapshot};

static INIT: Once = Once::new();

/// Segment size is process-wide; every test in one binary must agree on it,
/// so the first caller wins and the rest are no-ops.
pub fn init_segment_size(bytes: u64) {
    INIT.call_once(|| config::set_segment_size_bytes(bytes));
}

pub fn entry(index: u64, term: u64, data: &[u8]) -> Entry {
    Entry {
        term,
        index,
        kind: 0,
        data: Bytes::copy_from_slice(data),
    }
}

pub fn hard_state(term: u64, vote: u64, commit: u64) -> HardState {
    HardState { term, vote, commit }
}

pub fn conf_state() -> ConfState {
    ConfState {
        voters: vec![0x00ff_ca74],
        learners: Vec::new(),
        auto_leave: false,
    }
}

/// A snapshot pointer that passes write validation: pointers past index
/// zero carry the fixture membership.
pub fn snapshot(index: u64, term: u64) -> Snapshot {
    Snapshot::new(index, term, (index > 0).then(conf_state))
}

pub fn flip_byte_at(path: &Path, offset: u64) {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .expect("open for corruption");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    let mut byte = [0u8; 1];
    use std::io::Read;
    file.read_exact(&mut byte).expect("read byte");
    byte[0] ^= 0xff;
    file.seek(SeekFrom::Start(offset)).expect("seek back");
    file.write_all(&byte).expect("write byte");
}

pub fn zero_range(path: &Path, from: u64, to: u64) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for corruption");
    file.seek(SeekFrom::Start(from)).expect("seek");
    file.write_all(&vec![0u8; (to - from) as usize])
        .expect("zero range");
}

pub fn write_at(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for corruption");
    file.seek(SeekFrom::Start(offset)).expect("seek");
    file.write_all(bytes).expect("overwrite");
}

pub fn truncate_file(path: &Path, len: u64) {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for truncation");
    file.set_len(len).expect("truncate");
}
