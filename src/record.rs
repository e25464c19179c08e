//! Record framing: the fixed 16-byte header every binary record starts with.
//!
//! # Layout (little-endian)
//!
//! | Offset | Size | Field                                               |
//! |--------|------|-----------------------------------------------------|
//! | 0      | 4    | `RECORD_MAGIC`                                      |
//! | 4      | 4    | total size, header included                         |
//! | 8      | 4    | CRC-32 of the whole record, this field read as zero |
//! | 12     | 1    | [`RecordKind`]                                      |
//! | 13     | 1    | flags (opaque to this crate)                        |
//! | 14     | 2    | reserved                                            |
//!
//! Every header field is checked before the payload is touched.  Records
//! produced by the structured backend are re-encoded into this same layout.

use std::io::{self, Write};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use crc32fast::Hasher;

use crate::error::Corruption;

pub const RECORD_MAGIC:       u32   = 0x5452_4331;
pub const RECORD_HEADER_SIZE: usize = 16;

const CRC_FIELD: std::ops::Range<usize> = 8..12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordKind {
    /// A captured API call.
    Entrypoint,
    /// End of one rendered frame ("swap").
    FrameBoundary,
    EndOfStream,
    Control,
}

impl RecordKind {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            1 => Some(RecordKind::Entrypoint),
            2 => Some(RecordKind::FrameBoundary),
            3 => Some(RecordKind::EndOfStream),
            4 => Some(RecordKind::Control),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            RecordKind::Entrypoint    => 1,
            RecordKind::FrameBoundary => 2,
            RecordKind::EndOfStream   => 3,
            RecordKind::Control       => 4,
        }
    }

    /// Name used by the structured format's `type` key.
    pub fn name(self) -> &'static str {
        match self {
            RecordKind::Entrypoint    => "entrypoint",
            RecordKind::FrameBoundary => "frame_boundary",
            RecordKind::EndOfStream   => "end",
            RecordKind::Control       => "control",
        }
    }

    pub fn from_name(s: &str) -> Option<Self> {
        match s {
            "entrypoint"     => Some(RecordKind::Entrypoint),
            "frame_boundary" => Some(RecordKind::FrameBoundary),
            "end"            => Some(RecordKind::EndOfStream),
            "control"        => Some(RecordKind::Control),
            _                => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub size:     u32,
    pub checksum: u32,
    pub kind:     RecordKind,
    pub flags:    u8,
}

impl RecordHeader {
    /// Validate the fixed header: prefix, kind and a size in
    /// `RECORD_HEADER_SIZE..=max_size`.
    pub fn parse(bytes: &[u8; RECORD_HEADER_SIZE], max_size: u32) -> Result<Self, Corruption> {
        let magic = LittleEndian::read_u32(&bytes[0..4]);
        if magic != RECORD_MAGIC {
            return Err(Corruption::BadMagic { found: magic });
        }
        let size     = LittleEndian::read_u32(&bytes[4..8]);
        let checksum = LittleEndian::read_u32(&bytes[CRC_FIELD]);
        let kind_raw = bytes[12];
        let flags    = bytes[13];

        if (size as usize) < RECORD_HEADER_SIZE || size > max_size {
            return Err(Corruption::BadSize { declared: size, limit: max_size as u64 });
        }
        let kind = RecordKind::from_u8(kind_raw).ok_or(Corruption::UnknownKind(kind_raw))?;

        Ok(Self { size, checksum, kind, flags })
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(RECORD_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.size)?;
        writer.write_u32::<LittleEndian>(self.checksum)?;
        writer.write_u8(self.kind.as_u8())?;
        writer.write_u8(self.flags)?;
        writer.write_u16::<LittleEndian>(0)?;
        Ok(())
    }

    pub fn payload_len(&self) -> usize {
        self.size as usize - RECORD_HEADER_SIZE
    }
}

/// CRC-32 over the full record with the checksum field taken as zero.
pub fn compute_checksum(record: &[u8]) -> u32 {
    let mut hasher = Hasher::new();
    if record.len() < CRC_FIELD.end {
        hasher.update(record);
        return hasher.finalize();
    }
    hasher.update(&record[..CRC_FIELD.start]);
    hasher.update(&[0u8; 4]);
    hasher.update(&record[CRC_FIELD.end..]);
    hasher.finalize()
}

/// Recompute the checksum of a complete record and compare it to the stored one.
pub fn verify(record: &[u8]) -> Result<(), Corruption> {
    if record.len() < RECORD_HEADER_SIZE {
        return Err(Corruption::Truncated {
            wanted: RECORD_HEADER_SIZE as u64,
            got:    record.len() as u64,
        });
    }
    let stored = LittleEndian::read_u32(&record[CRC_FIELD]);
    let computed = compute_checksum(record);
    if stored != computed {
        return Err(Corruption::ChecksumMismatch { stored, computed });
    }
    Ok(())
}

/// Build a complete, checksummed record.
pub fn encode_record(kind: RecordKind, flags: u8, payload: &[u8]) -> RecordBuf {
    let size = (RECORD_HEADER_SIZE + payload.len()) as u32;
    let mut header = RecordHeader { size, checksum: 0, kind, flags };

    let mut bytes = Vec::with_capacity(size as usize);
    // Writing into a Vec cannot fail.
    let _ = header.write(&mut bytes);
    bytes.extend_from_slice(payload);

    header.checksum = compute_checksum(&bytes);
    bytes[CRC_FIELD].copy_from_slice(&header.checksum.to_le_bytes());
    RecordBuf { header, bytes }
}

/// The canonical zero-payload end-of-stream record handed out whenever a
/// stream ends, cleanly or not.
pub fn synthesize_end_record() -> RecordBuf {
    encode_record(RecordKind::EndOfStream, 0, &[])
}

// ── Record views ─────────────────────────────────────────────────────────────

/// Borrowed view of a validated record.  Obtained from a stream, it stays valid
/// until the next read on that stream.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    header: RecordHeader,
    bytes:  &'a [u8],
}

impl<'a> Record<'a> {
    pub fn header(&self) -> &RecordHeader { &self.header }
    pub fn kind(&self) -> RecordKind { self.header.kind }
    pub fn size(&self) -> u32 { self.header.size }
    pub fn checksum(&self) -> u32 { self.header.checksum }
    pub fn flags(&self) -> u8 { self.header.flags }
    pub fn as_bytes(&self) -> &'a [u8] { self.bytes }
    pub fn payload(&self) -> &'a [u8] { &self.bytes[RECORD_HEADER_SIZE..] }

    pub fn is_end(&self) -> bool { self.header.kind == RecordKind::EndOfStream }
    pub fn is_frame_boundary(&self) -> bool { self.header.kind == RecordKind::FrameBoundary }

    pub fn to_buf(&self) -> RecordBuf {
        RecordBuf { header: self.header, bytes: self.bytes.to_vec() }
    }
}

/// Owned record, as stored in a [`RecordBatch`](crate::stream::RecordBatch).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordBuf {
    header: RecordHeader,
    bytes:  Vec<u8>,
}

impl RecordBuf {
    /// Frame and verify a complete record held in memory.
    pub fn from_bytes(bytes: Vec<u8>, max_size: u32) -> Result<Self, Corruption> {
        if bytes.len() < RECORD_HEADER_SIZE {
            return Err(Corruption::Truncated {
                wanted: RECORD_HEADER_SIZE as u64,
                got:    bytes.len() as u64,
            });
        }
        let mut fixed = [0u8; RECORD_HEADER_SIZE];
        fixed.copy_from_slice(&bytes[..RECORD_HEADER_SIZE]);
        let header = RecordHeader::parse(&fixed, max_size)?;
        if header.size as usize != bytes.len() {
            return Err(Corruption::Truncated { wanted: header.size as u64, got: bytes.len() as u64 });
        }
        verify(&bytes)?;
        Ok(Self { header, bytes })
    }

    pub fn view(&self) -> Record<'_> {
        Record { header: self.header, bytes: &self.bytes }
    }

    pub fn kind(&self) -> RecordKind { self.header.kind }
    pub fn payload(&self) -> &[u8] { &self.bytes[RECORD_HEADER_SIZE..] }
    pub fn as_bytes(&self) -> &[u8] { &self.bytes }
    pub fn into_bytes(self) -> Vec<u8> { self.bytes }
}

/// Reusable record storage owned by a stream.  Reads overwrite it in place so
/// sequential scans do not allocate per record.
#[derive(Debug)]
pub(crate) struct RecordSlot {
    header: RecordHeader,
    buf:    Vec<u8>,
}

impl RecordSlot {
    pub(crate) fn new() -> Self {
        let end = synthesize_end_record();
        Self { header: end.header, buf: end.bytes }
    }

    pub(crate) fn view(&self) -> Record<'_> {
        Record { header: self.header, bytes: &self.buf }
    }

    pub(crate) fn set_end(&mut self) {
        let end = synthesize_end_record();
        self.header = end.header;
        self.buf.clear();
        self.buf.extend_from_slice(&end.bytes);
    }

    pub(crate) fn set(&mut self, record: RecordBuf) {
        self.header = record.header;
        self.buf = record.bytes;
    }

    /// Size the buffer for `header` and return the payload region to fill.
    pub(crate) fn prepare(&mut self, header: RecordHeader, raw_header: &[u8; RECORD_HEADER_SIZE]) -> &mut [u8] {
        self.header = header;
        self.buf.clear();
        self.buf.extend_from_slice(raw_header);
        self.buf.resize(header.size as usize, 0);
        &mut self.buf[RECORD_HEADER_SIZE..]
    }

    pub(crate) fn bytes(&self) -> &[u8] { &self.buf }

    pub(crate) fn reserve(&mut self, additional: usize) { self.buf.reserve(additional) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoded_record_verifies() {
        let rec = encode_record(RecordKind::Entrypoint, 7, b"glDrawArrays");
        assert_eq!(rec.as_bytes().len(), RECORD_HEADER_SIZE + 12);
        assert!(verify(rec.as_bytes()).is_ok());
        assert_eq!(rec.view().flags(), 7);
        assert_eq!(rec.payload(), b"glDrawArrays");
    }

    #[test]
    fn header_flip_is_detected() {
        let rec = encode_record(RecordKind::Control, 0, b"abc");
        let mut bytes = rec.into_bytes();
        bytes[13] ^= 0x40; // flags are covered by the checksum
        assert!(matches!(verify(&bytes), Err(Corruption::ChecksumMismatch { .. })));
    }

    #[test]
    fn parse_rejects_bad_fields() {
        let rec = encode_record(RecordKind::Entrypoint, 0, &[0u8; 32]);
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        raw.copy_from_slice(&rec.as_bytes()[..RECORD_HEADER_SIZE]);

        assert!(RecordHeader::parse(&raw, 1024).is_ok());
        assert!(matches!(
            RecordHeader::parse(&raw, 40),
            Err(Corruption::BadSize { declared: 48, .. })
        ));

        let mut bad_kind = raw;
        bad_kind[12] = 9;
        assert_eq!(RecordHeader::parse(&bad_kind, 1024), Err(Corruption::UnknownKind(9)));

        let mut bad_magic = raw;
        bad_magic[0] = 0;
        assert!(matches!(RecordHeader::parse(&bad_magic, 1024), Err(Corruption::BadMagic { .. })));

        let mut tiny = raw;
        tiny[4..8].copy_from_slice(&3u32.to_le_bytes());
        assert!(matches!(RecordHeader::parse(&tiny, 1024), Err(Corruption::BadSize { declared: 3, .. })));
    }

    #[test]
    fn synthetic_end_is_canonical() {
        let a = synthesize_end_record();
        let b = synthesize_end_record();
        assert_eq!(a, b);
        assert!(a.view().is_end());
        assert!(a.payload().is_empty());
        assert!(RecordBuf::from_bytes(a.into_bytes(), 1024).is_ok());
    }
}
