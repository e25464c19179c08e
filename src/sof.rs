//! Start-of-file descriptor: the fixed 56-byte block at offset 0 of a binary
//! trace.
//!
//! ```text
//! 0   magic               u32   SOF_MAGIC
//! 4   size                u32   SOF_SIZE
//! 8   crc32               u32   whole descriptor, this field read as zero
//! 12  version             u16
//! 14  pointer_sizes       u8    4 or 8
//! 15  reserved            u8
//! 16  uuid                [16]
//! 32  first_record_offset u64
//! 40  archive_offset      u64   0 when no archive is embedded
//! 48  archive_size        u64
//! ```

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;
use uuid::Uuid;

use crate::error::OpenFailure;
use crate::record::compute_checksum;

pub const SOF_MAGIC: u32   = 0x5452_4346;
pub const SOF_SIZE:  usize = 56;

/// Version written by current capture builds.
pub const FORMAT_VERSION:         u16 = 0x0106;
/// Oldest version this reader understands.
pub const MIN_COMPATIBLE_VERSION: u16 = 0x0104;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartOfFile {
    pub version:             u16,
    pub pointer_sizes:       u8,
    pub uuid:                Uuid,
    pub first_record_offset: u64,
    pub archive_offset:      u64,
    pub archive_size:        u64,
}

impl StartOfFile {
    pub fn new(uuid: Uuid) -> Self {
        Self {
            version:             FORMAT_VERSION,
            pointer_sizes:       std::mem::size_of::<usize>() as u8,
            uuid,
            first_record_offset: SOF_SIZE as u64,
            archive_offset:      0,
            archive_size:        0,
        }
    }

    pub fn has_archive(&self) -> bool {
        self.archive_size != 0
    }

    /// Serialize with a freshly computed checksum.
    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        let mut buf = Vec::with_capacity(SOF_SIZE);
        buf.write_u32::<LittleEndian>(SOF_MAGIC)?;
        buf.write_u32::<LittleEndian>(SOF_SIZE as u32)?;
        buf.write_u32::<LittleEndian>(0)?;
        buf.write_u16::<LittleEndian>(self.version)?;
        buf.write_u8(self.pointer_sizes)?;
        buf.write_u8(0)?;
        buf.write_all(self.uuid.as_bytes())?;
        buf.write_u64::<LittleEndian>(self.first_record_offset)?;
        buf.write_u64::<LittleEndian>(self.archive_offset)?;
        buf.write_u64::<LittleEndian>(self.archive_size)?;

        let crc = compute_checksum(&buf);
        buf[8..12].copy_from_slice(&crc.to_le_bytes());
        writer.write_all(&buf)
    }

    /// Read and fully validate a descriptor.  A version newer than
    /// [`FORMAT_VERSION`] is accepted with a warning.
    pub fn read<R: Read>(mut reader: R) -> Result<Self, OpenFailure> {
        let mut raw = [0u8; SOF_SIZE];
        reader
            .read_exact(&mut raw)
            .map_err(|e| OpenFailure::BadDescriptor(format!("short read: {e}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8; SOF_SIZE]) -> Result<Self, OpenFailure> {
        let bad = |msg: String| OpenFailure::BadDescriptor(msg);
        let mut r = &raw[..];

        let magic = r.read_u32::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        if magic != SOF_MAGIC {
            return Err(bad(format!("invalid prefix 0x{magic:08X}")));
        }
        let size = r.read_u32::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        if size as usize != SOF_SIZE {
            return Err(bad(format!("declared size {size}, expected {SOF_SIZE}")));
        }
        let stored_crc = r.read_u32::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        let computed = compute_checksum(raw);
        if stored_crc != computed {
            return Err(bad(format!(
                "CRC32 mismatch (stored 0x{stored_crc:08X}, computed 0x{computed:08X})"
            )));
        }

        let version = r.read_u16::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        if version < MIN_COMPATIBLE_VERSION {
            return Err(OpenFailure::IncompatibleVersion {
                found:   version,
                minimum: MIN_COMPATIBLE_VERSION,
            });
        }
        if version > FORMAT_VERSION {
            warn!(
                "Trace file version is 0x{version:04X}, expected version 0x{FORMAT_VERSION:04X}, this may not work at all!"
            );
        }

        let pointer_sizes = r.read_u8().map_err(|e| bad(e.to_string()))?;
        check_pointer_sizes(pointer_sizes as i64).map_err(bad)?;
        let _reserved = r.read_u8().map_err(|e| bad(e.to_string()))?;

        let mut uuid_bytes = [0u8; 16];
        r.read_exact(&mut uuid_bytes).map_err(|e| bad(e.to_string()))?;

        let first_record_offset = r.read_u64::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        let archive_offset      = r.read_u64::<LittleEndian>().map_err(|e| bad(e.to_string()))?;
        let archive_size        = r.read_u64::<LittleEndian>().map_err(|e| bad(e.to_string()))?;

        if first_record_offset < SOF_SIZE as u64 {
            return Err(bad(format!("first record offset {first_record_offset} overlaps the descriptor")));
        }

        Ok(Self {
            version,
            pointer_sizes,
            uuid: Uuid::from_bytes(uuid_bytes),
            first_record_offset,
            archive_offset,
            archive_size,
        })
    }
}

pub(crate) fn check_pointer_sizes(v: i64) -> Result<(), String> {
    if v == 4 || v == 8 {
        Ok(())
    } else {
        Err(format!("invalid pointer size {v}"))
    }
}

/// Pack the structured format's four-u32 UUID array into a [`Uuid`].
pub fn uuid_from_words(words: &[u32]) -> Uuid {
    let mut bytes = [0u8; 16];
    for (chunk, w) in bytes.chunks_exact_mut(4).zip(words.iter().take(4)) {
        chunk.copy_from_slice(&w.to_le_bytes());
    }
    Uuid::from_bytes(bytes)
}
