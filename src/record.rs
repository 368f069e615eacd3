//! Record types and body encoding/decoding.
//!
//! Bodies are little-endian and fixed-order; the tag values are part of the
//! on-disk format and must never be renumbered.

use bytes::Bytes;

use crate::error::{WalError, WalResult};

/// Wire tags for the five record kinds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum RecordType {
    Metadata = 1,
    Entry = 2,
    State = 3,
    Crc = 4,
    Snapshot = 5,
}

impl RecordType {
    pub fn tag(self) -> u64 {
        self as u64
    }

    pub fn from_tag(tag: u64) -> Option<Self> {
        match tag {
            1 => Some(RecordType::Metadata),
            2 => Some(RecordType::Entry),
            3 => Some(RecordType::State),
            4 => Some(RecordType::Crc),
            5 => Some(RecordType::Snapshot),
            _ => None,
        }
    }
}

/// One decoded record: type tag, chained crc, opaque body.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub rec_type: RecordType,
    pub crc: u32,
    pub data: Bytes,
}

/// A replicated log entry.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub term: u64,
    pub index: u64,
    pub kind: u32,
    pub data: Bytes,
}

const ENTRY_FIXED_LEN: usize = 8 + 8 + 4;

impl Entry {
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_FIXED_LEN + self.data.len());
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.kind.to_le_bytes());
        buf.extend_from_slice(&self.data);
        buf
    }

    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < ENTRY_FIXED_LEN {
            return Err(WalError::invalid_frame("entry body truncated"));
        }
        let mut offset = 0usize;
        let term = read_u64_le(bytes, &mut offset)?;
        let index = read_u64_le(bytes, &mut offset)?;
        let kind = read_u32_le(bytes, &mut offset)?;
        let data = Bytes::copy_from_slice(&bytes[offset..]);
        Ok(Self {
            term,
            index,
            kind,
            data,
        })
    }
}

/// The consensus durability triple replayed on restart.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct HardState {
    pub term: u64,
    pub vote: u64,
    pub commit: u64,
}

impl HardState {
    /// An all-zero hard state is never written.
    pub fn is_empty(&self) -> bool {
        *self == HardState::default()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(24);
        buf.extend_from_slice(&self.term.to_le_bytes());
        buf.extend_from_slice(&self.vote.to_le_bytes());
        buf.extend_from_slice(&self.commit.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        if bytes.len() < 24 {
            return Err(WalError::invalid_frame("hard state body truncated"));
        }
        let mut offset = 0usize;
        Ok(Self {
            term: read_u64_le(bytes, &mut offset)?,
            vote: read_u64_le(bytes, &mut offset)?,
            commit: read_u64_le(bytes, &mut offset)?,
        })
    }
}

/// Cluster membership carried by a snapshot pointer.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConfState {
    pub voters: Vec<u64>,
    pub learners: Vec<u64>,
    pub auto_leave: bool,
}

/// A snapshot pointer: which prefix of the log has been compacted away.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub index: u64,
    pub term: u64,
    pub conf_state: Option<ConfState>,
}

impl Snapshot {
    pub fn new(index: u64, term: u64, conf_state: Option<ConfState>) -> Self {
        Self {
            index,
            term,
            conf_state,
        }
    }

    /// A pointer past index zero must carry the membership it was taken
    /// under, otherwise a restore cannot reconstruct the cluster.
    pub fn validate_for_write(&self) -> WalResult<()> {
        if self.index > 0 && self.conf_state.is_none() {
            return Err(WalError::InvalidSnapshot {
                reason: "conf state required when index is not zero".to_string(),
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(32);
        buf.extend_from_slice(&self.index.to_le_bytes());
        buf.extend_from_slice(&self.term.to_le_bytes());
        match &self.conf_state {
            None => buf.push(0),
            Some(cs) => {
                buf.push(1);
                buf.extend_from_slice(&(cs.voters.len() as u32).to_le_bytes());
                for v in &cs.voters {
                    buf.extend_from_slice(&v.to_le_bytes());
                }
                buf.extend_from_slice(&(cs.learners.len() as u32).to_le_bytes());
                for l in &cs.learners {
                    buf.extend_from_slice(&l.to_le_bytes());
                }
                buf.push(u8::from(cs.auto_leave));
            }
        }
        buf
    }

    pub fn decode(bytes: &[u8]) -> WalResult<Self> {
        let mut offset = 0usize;
        let index = read_u64_le(bytes, &mut offset)?;
        let term = read_u64_le(bytes, &mut offset)?;
        let has_conf_state = read_u8(bytes, &mut offset)?;
        let conf_state = match has_conf_state {
            0 => None,
            1 => {
                let voters = read_u64_list(bytes, &mut offset)?;
                let learners = read_u64_list(bytes, &mut offset)?;
                let auto_leave = read_u8(bytes, &mut offset)? != 0;
                Some(ConfState {
                    voters,
                    learners,
                    auto_leave,
                })
            }
            other => {
                return Err(WalError::invalid_frame(format!(
                    "unknown conf state marker {other}"
                )));
            }
        };
        Ok(Self {
            index,
            term,
            conf_state,
        })
    }
}

fn read_u64_list(bytes: &[u8], offset: &mut usize) -> WalResult<Vec<u64>> {
    let len = read_u32_le(bytes, offset)? as usize;
    let remaining = bytes.len().saturating_sub(*offset);
    if len > remaining / 8 {
        return Err(WalError::invalid_frame("list length exceeds body"));
    }
    let mut items = Vec::with_capacity(len);
    for _ in 0..len {
        items.push(read_u64_le(bytes, offset)?);
    }
    Ok(items)
}

fn read_u8(bytes: &[u8], offset: &mut usize) -> WalResult<u8> {
    let slice = take(bytes, offset, 1)?;
    Ok(slice[0])
}

fn read_u32_le(bytes: &[u8], offset: &mut usize) -> WalResult<u32> {
    let slice = take(bytes, offset, 4)?;
    Ok(u32::from_le_bytes([slice[0], slice[1], slice[2], slice[3]]))
}

fn read_u64_le(bytes: &[u8], offset: &mut usize) -> WalResult<u64> {
    let slice = take(bytes, offset, 8)?;
    Ok(u64::from_le_bytes([
        slice[0], slice[1], slice[2], slice[3], slice[4], slice[5], slice[6], slice[7],
    ]))
}

fn take<'a>(bytes: &'a [u8], offset: &mut usize, len: usize) -> WalResult<&'a [u8]> {
    let end = offset
        .checked_add(len)
        .ok_or_else(|| WalError::invalid_frame("body length overflow"))?;
    if end > bytes.len() {
        return Err(WalError::invalid_frame("record body truncated"));
    }
    let slice = &bytes[*offset..end];
    *offset = end;
    Ok(slice)
}
