//! Length-prefixed, CRC-chained record framing.
//!
//! A frame is an 8-byte little-endian length word, the encoded record
//! (varint type tag, chained crc, body), then 0-7 zero bytes so the next
//! frame starts on an 8-byte boundary. The low 56 bits of the length word
//! hold the record length; when padding is present the top byte is
//! `0x80 | pad`, which also makes the word negative as a signed integer.
//!
//! The crc chains across records and across segments: each record's crc is
//! the IEEE CRC-32 of its body seeded with the previous record's crc. A
//! zero length word is not a frame, it is the start of the preallocated
//! (or zeroed) region at the end of a segment.

use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::config;
use crate::error::{WalError, WalResult};
use crate::record::{Record, RecordType};

pub(crate) const FRAME_LEN_BYTES: u64 = 8;

// Writes are torn at physical sector granularity; a smaller value only
// makes the zero-sector check more conservative.
const MIN_SECTOR_SIZE: u64 = 512;

fn encode_frame_size(rec_len: usize) -> (u64, usize) {
    let pad = (8 - rec_len % 8) % 8;
    let mut field = rec_len as u64;
    if pad != 0 {
        field |= (0x80 | pad as u64) << 56;
    }
    (field, pad)
}

fn decode_frame_size(field: u64) -> (u64, u64) {
    let rec_len = field & !(0xffu64 << 56);
    let pad = if field & (1 << 63) != 0 {
        (field >> 56) & 0x7
    } else {
        0
    };
    (rec_len, pad)
}

fn put_uvarint(buf: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        buf.push((v as u8) | 0x80);
        v >>= 7;
    }
    buf.push(v as u8);
}

fn read_uvarint(bytes: &[u8], offset: &mut usize) -> Option<u64> {
    let mut value = 0u64;
    let mut shift = 0u32;
    loop {
        let b = *bytes.get(*offset)?;
        *offset += 1;
        if shift >= 63 && b > 1 {
            return None;
        }
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

fn roll_crc(seed: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    hasher.finalize()
}

/// Appends framed records to a writer, maintaining the rolling crc.
#[derive(Debug)]
pub struct Encoder<W: Write> {
    out: W,
    crc: u32,
}

impl<W: Write> Encoder<W> {
    pub fn new(out: W, prev_crc: u32) -> Self {
        Self { out, crc: prev_crc }
    }

    /// Frames and buffers one record. A crc record has an empty body, so it
    /// carries the chain value itself.
    pub fn encode(&mut self, rec_type: RecordType, data: &[u8]) -> WalResult<()> {
        self.crc = roll_crc(self.crc, data);

        let mut payload = Vec::with_capacity(10 + 4 + data.len());
        put_uvarint(&mut payload, rec_type.tag());
        payload.extend_from_slice(&self.crc.to_le_bytes());
        payload.extend_from_slice(data);

        let (field, pad) = encode_frame_size(payload.len());
        self.out
            .write_all(&field.to_le_bytes())
            .map_err(WalError::io_nopath)?;
        self.out.write_all(&payload).map_err(WalError::io_nopath)?;
        if pad > 0 {
            const ZEROES: [u8; 8] = [0u8; 8];
            self.out
                .write_all(&ZEROES[..pad])
                .map_err(WalError::io_nopath)?;
        }
        Ok(())
    }

    pub fn flush(&mut self) -> WalResult<()> {
        self.out.flush().map_err(WalError::io_nopath)
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// Byte length of the frame a body of `data_len` bytes produces, including
/// the length word and padding.
pub fn framed_len(rec_type: RecordType, data_len: usize) -> u64 {
    let mut tag = Vec::with_capacity(10);
    put_uvarint(&mut tag, rec_type.tag());
    let rec_len = tag.len() + 4 + data_len;
    let (_, pad) = encode_frame_size(rec_len);
    FRAME_LEN_BYTES + rec_len as u64 + pad as u64
}

#[derive(Debug)]
struct DecoderFile {
    reader: BufReader<File>,
    path: PathBuf,
    size: u64,
}

enum LenWord {
    Eof,
    Zero,
    Partial,
    Field(u64),
}

/// Streams records out of an ordered run of segment files.
///
/// `last_valid_offset` tracks the end of the last complete record within
/// the current file; recovery truncates a torn tail there.
#[derive(Debug)]
pub struct Decoder {
    files: VecDeque<DecoderFile>,
    initial_count: usize,
    last_valid_offset: u64,
    crc: u32,
}

impl Decoder {
    pub fn new(files: Vec<(File, PathBuf)>) -> WalResult<Self> {
        let mut decoder_files = VecDeque::with_capacity(files.len());
        for (file, path) in files {
            let size = file
                .metadata()
                .map_err(|source| WalError::io(&path, source))?
                .len();
            decoder_files.push_back(DecoderFile {
                reader: BufReader::new(file),
                path,
                size,
            });
        }
        let initial_count = decoder_files.len();
        Ok(Self {
            files: decoder_files,
            initial_count,
            last_valid_offset: 0,
            crc: 0,
        })
    }

    /// Returns the next complete record, or `None` at the end of the
    /// written stream. A partial record surfaces as [`WalError::UnexpectedEof`].
    pub fn next_record(&mut self) -> WalResult<Option<Record>> {
        loop {
            let in_last = self.files.len() <= 1;
            let Some(front) = self.files.front_mut() else {
                return Ok(None);
            };

            let field = match read_len_word(front)? {
                LenWord::Eof | LenWord::Zero => {
                    // End of this file's written data: either the physical
                    // end or the zero-filled preallocated region.
                    if in_last {
                        return Ok(None);
                    }
                    self.files.pop_front();
                    self.last_valid_offset = 0;
                    continue;
                }
                LenWord::Partial => {
                    // torn at the physical end of the file, mid-word
                    return Err(WalError::UnexpectedEof {
                        path: front.path.clone(),
                        offset: self.last_valid_offset,
                    });
                }
                LenWord::Field(field) => field,
            };

            let (rec_len, pad) = decode_frame_size(field);
            if rec_len == 0 {
                return Err(WalError::invalid_frame("zero-length record"));
            }

            // A length that overruns the file is the torn-write signal;
            // recovery depends on this, not on the file length.
            let remaining = front
                .size
                .saturating_sub(self.last_valid_offset + FRAME_LEN_BYTES);
            if rec_len + pad > remaining {
                return Err(WalError::UnexpectedEof {
                    path: front.path.clone(),
                    offset: self.last_valid_offset,
                });
            }
            if rec_len > config::max_record_bytes() {
                return Err(WalError::RecordTooLarge {
                    limit: config::max_record_bytes(),
                    got: rec_len,
                });
            }

            let mut buf = vec![0u8; (rec_len + pad) as usize];
            if let Err(source) = front.reader.read_exact(&mut buf) {
                return if source.kind() == std::io::ErrorKind::UnexpectedEof {
                    Err(WalError::UnexpectedEof {
                        path: front.path.clone(),
                        offset: self.last_valid_offset,
                    })
                } else {
                    Err(WalError::io(&front.path, source))
                };
            }

            // padding is always written as zeroes; anything else is damage
            if buf[rec_len as usize..].iter().any(|&b| b != 0) {
                return if self.is_torn(&buf) {
                    Err(WalError::UnexpectedEof {
                        path: self.current_path().to_path_buf(),
                        offset: self.last_valid_offset,
                    })
                } else {
                    Err(WalError::invalid_frame("nonzero padding"))
                };
            }

            let record = match decode_payload(&buf[..rec_len as usize]) {
                Ok(record) => record,
                Err(err) => {
                    return if self.is_torn(&buf) {
                        Err(WalError::UnexpectedEof {
                            path: self.current_path().to_path_buf(),
                            offset: self.last_valid_offset,
                        })
                    } else {
                        Err(err)
                    };
                }
            };

            if record.rec_type != RecordType::Crc {
                let rolled = roll_crc(self.crc, &record.data);
                if rolled != record.crc {
                    return if self.is_torn(&buf) {
                        Err(WalError::UnexpectedEof {
                            path: self.current_path().to_path_buf(),
                            offset: self.last_valid_offset,
                        })
                    } else {
                        Err(WalError::CrcMismatch {
                            expected: record.crc,
                            got: rolled,
                        })
                    };
                }
                self.crc = rolled;
            }

            self.last_valid_offset += FRAME_LEN_BYTES + rec_len + pad;
            return Ok(Some(record));
        }
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    /// Re-seeds the chain from a crc record, validated by the caller.
    pub fn set_crc(&mut self, crc: u32) {
        self.crc = crc;
    }

    pub fn last_valid_offset(&self) -> u64 {
        self.last_valid_offset
    }

    pub fn in_first_file(&self) -> bool {
        self.files.len() == self.initial_count
    }

    pub fn in_last_file(&self) -> bool {
        self.files.len() <= 1
    }

    fn current_path(&self) -> &Path {
        self.files
            .front()
            .map(|f| f.path.as_path())
            .unwrap_or_else(|| Path::new(""))
    }

    /// A record whose bytes cover at least one all-zero sector was only
    /// partially written before a crash: sectors are written atomically, so
    /// a decode failure over such data is a torn write, not corruption.
    /// Only meaningful in the final file; anywhere else zeros are damage.
    fn is_torn(&self, buf: &[u8]) -> bool {
        if !self.in_last_file() {
            return false;
        }
        let mut file_off = self.last_valid_offset + FRAME_LEN_BYTES;
        let mut cur = 0usize;
        while cur < buf.len() {
            let chunk_len =
                ((MIN_SECTOR_SIZE - (file_off % MIN_SECTOR_SIZE)) as usize).min(buf.len() - cur);
            let sector = &buf[cur..cur + chunk_len];
            if sector.iter().all(|&b| b == 0) {
                return true;
            }
            file_off += chunk_len as u64;
            cur += chunk_len;
        }
        false
    }
}

fn read_len_word(front: &mut DecoderFile) -> WalResult<LenWord> {
    let mut word = [0u8; FRAME_LEN_BYTES as usize];
    let mut read = 0usize;
    while read < word.len() {
        let n = front
            .reader
            .read(&mut word[read..])
            .map_err(|source| WalError::io(&front.path, source))?;
        if n == 0 {
            if read == 0 {
                return Ok(LenWord::Eof);
            }
            return Ok(LenWord::Partial);
        }
        read += n;
    }
    let field = u64::from_le_bytes(word);
    if field == 0 {
        Ok(LenWord::Zero)
    } else {
        Ok(LenWord::Field(field))
    }
}

fn decode_payload(payload: &[u8]) -> WalResult<Record> {
    let mut offset = 0usize;
    let tag = read_uvarint(payload, &mut offset)
        .ok_or_else(|| WalError::invalid_frame("record type tag truncated"))?;
    let rec_type = RecordType::from_tag(tag)
        .ok_or_else(|| WalError::invalid_frame(format!("unknown record type {tag}")))?;
    if payload.len() < offset + 4 {
        return Err(WalError::invalid_frame("record crc truncated"));
    }
    let crc = u32::from_le_bytes([
        payload[offset],
        payload[offset + 1],
        payload[offset + 2],
        payload[offset + 3],
    ]);
    let data = bytes::Bytes::copy_from_slice(&payload[offset + 4..]);
    Ok(Record {
        rec_type,
        crc,
        data,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn frame_size_roundtrip() {
        for (rec_len, want_pad) in [(1usize, 7usize), (5, 3), (8, 0), (13, 3), (16, 0)] {
            let (field, pad) = encode_frame_size(rec_len);
            assert_eq!(pad, want_pad, "rec_len {rec_len}");
            let (got_len, got_pad) = decode_frame_size(field);
            assert_eq!(got_len, rec_len as u64);
            assert_eq!(got_pad, pad as u64);
            if pad > 0 {
                assert_ne!(field & (1 << 63), 0, "padding must set the sign bit");
            }
        }
    }

    #[test]
    fn uvarint_roundtrip() {
        for v in [0u64, 1, 5, 0x7f, 0x80, 0x3fff, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let mut offset = 0;
            assert_eq!(read_uvarint(&buf, &mut offset), Some(v));
            assert_eq!(offset, buf.len());
        }
    }

    fn decoder_over(dir: &TempDir, name: &str, bytes: &[u8]) -> Decoder {
        let path = dir.path().join(name);
        fs::write(&path, bytes).unwrap();
        let file = fs::File::open(&path).unwrap();
        Decoder::new(vec![(file, path)]).unwrap()
    }

    #[test]
    fn encode_decode_chain() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out, 0);
        enc.encode(RecordType::Crc, &[]).unwrap();
        enc.encode(RecordType::Metadata, b"somedata").unwrap();
        enc.encode(RecordType::Entry, b"entry-body").unwrap();
        enc.flush().unwrap();
        assert_eq!(out.len() % 8, 0);

        let mut dec = decoder_over(&temp, "chain.wal", &out);
        let crc_rec = dec.next_record().unwrap().unwrap();
        assert_eq!(crc_rec.rec_type, RecordType::Crc);
        assert_eq!(crc_rec.crc, 0);
        dec.set_crc(crc_rec.crc);

        let meta = dec.next_record().unwrap().unwrap();
        assert_eq!(meta.rec_type, RecordType::Metadata);
        assert_eq!(&meta.data[..], b"somedata");

        let entry = dec.next_record().unwrap().unwrap();
        assert_eq!(&entry.data[..], b"entry-body");
        assert!(dec.next_record().unwrap().is_none());
        assert_eq!(dec.last_valid_offset(), out.len() as u64);
    }

    #[test]
    fn decoder_stops_at_zero_region() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out, 0);
        enc.encode(RecordType::Metadata, b"m").unwrap();
        let written = out.len();
        out.extend_from_slice(&[0u8; 64]); // preallocated slack

        let mut dec = decoder_over(&temp, "slack.wal", &out);
        assert!(dec.next_record().unwrap().is_some());
        assert!(dec.next_record().unwrap().is_none());
        assert_eq!(dec.last_valid_offset(), written as u64);
    }

    #[test]
    fn flipped_body_byte_is_crc_mismatch() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out, 0);
        enc.encode(RecordType::Metadata, b"stable-bytes").unwrap();
        enc.encode(RecordType::Entry, b"after").unwrap();
        let last = out.len() - 10;
        out[last] ^= 0xff;

        let mut dec = decoder_over(&temp, "flip.wal", &out);
        // first record is fine, second fails mid-stream (not all-zero, so
        // it is corruption rather than a torn write)
        assert!(dec.next_record().unwrap().is_some());
        let err = dec.next_record().unwrap_err();
        assert!(
            matches!(err, WalError::CrcMismatch { .. } | WalError::InvalidFrame { .. }),
            "{err}"
        );
    }

    #[test]
    fn oversized_length_header_is_torn_signal() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out, 0);
        enc.encode(RecordType::Metadata, b"header").unwrap();
        enc.encode(RecordType::Entry, b"doomed-entry").unwrap();
        // rewrite the last record's length to claim far more than the file
        let start = framed_len(RecordType::Metadata, b"header".len()) as usize;
        out[start..start + 8].copy_from_slice(&1000u64.to_le_bytes());

        let mut dec = decoder_over(&temp, "torn.wal", &out);
        assert!(dec.next_record().unwrap().is_some());
        let err = dec.next_record().unwrap_err();
        assert!(matches!(err, WalError::UnexpectedEof { .. }), "{err}");
        assert_eq!(dec.last_valid_offset(), start as u64);
    }

    #[test]
    fn zeroed_record_in_tail_reads_as_end_of_stream() {
        let temp = TempDir::new().unwrap();
        let mut out = Vec::new();
        let mut enc = Encoder::new(&mut out, 0);
        enc.encode(RecordType::Metadata, b"keep").unwrap();
        enc.encode(RecordType::Entry, &[7u8; 100]).unwrap();
        let start = framed_len(RecordType::Metadata, b"keep".len()) as usize;
        let end = out.len();
        out[start..end].fill(0);

        let mut dec = decoder_over(&temp, "zeroed.wal", &out);
        assert!(dec.next_record().unwrap().is_some());
        assert!(dec.next_record().unwrap().is_none());
        assert_eq!(dec.last_valid_offset(), start as u64);
    }

    #[test]
    fn chain_crosses_segments_through_crc_records() {
        let temp = TempDir::new().unwrap();
        let mut first = Vec::new();
        let mut enc = Encoder::new(&mut first, 0);
        enc.encode(RecordType::Crc, &[]).unwrap();
        enc.encode(RecordType::Metadata, b"meta").unwrap();
        enc.encode(RecordType::Entry, b"one").unwrap();
        let carried = enc.crc();

        let mut second = Vec::new();
        let mut enc2 = Encoder::new(&mut second, carried);
        enc2.encode(RecordType::Crc, &[]).unwrap();
        enc2.encode(RecordType::Entry, b"two").unwrap();

        let p1 = temp.path().join("a.wal");
        let p2 = temp.path().join("b.wal");
        fs::write(&p1, &first).unwrap();
        fs::write(&p2, &second).unwrap();
        let files = vec![
            (fs::File::open(&p1).unwrap(), p1),
            (fs::File::open(&p2).unwrap(), p2),
        ];
        let mut dec = Decoder::new(files).unwrap();

        let mut count = 0;
        while let Some(rec) = dec.next_record().unwrap() {
            if rec.rec_type == RecordType::Crc {
                assert!(dec.crc() == 0 || dec.crc() == rec.crc);
                dec.set_crc(rec.crc);
            }
            count += 1;
        }
        assert_eq!(count, 5);
    }
}
