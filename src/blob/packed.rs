//! Packed blob archive: one file (or one byte range of a file) holding a
//! directory followed by the concatenated, optionally compressed blobs.
//!
//! ```text
//! header     magic "TBLB" | version u16 | reserved u16 | entry count u32
//! directory  per entry: name_len u16 | name | codec u8 | offset u64
//!                       | stored_size u64 | original_size u64 | crc32 u32
//! blobs      stored bytes, at `offset` from the start of the archive
//! ```
//!
//! The directory is read and validated once at open.  Blob bytes are read on
//! demand through a fresh file handle, so the store holds no mutable state and
//! can be shared across threads.

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt};
use log::debug;

use super::BlobStore;
use crate::codec::{get_codec, CodecId};
use crate::error::{OpenFailure, Result, TraceError};

pub const ARCHIVE_MAGIC:       [u8; 4] = *b"TBLB";
pub const ARCHIVE_VERSION:     u16     = 1;
pub const ARCHIVE_HEADER_SIZE: u64     = 12;

/// Directory entry with an empty name: the smallest an entry can be.
const MIN_ENTRY_SIZE: u64 = 2 + 1 + 8 + 8 + 8 + 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
    pub name:          String,
    pub codec:         CodecId,
    /// Relative to the start of the archive.
    pub offset:        u64,
    pub stored_size:   u64,
    pub original_size: u64,
    /// CRC-32 of the stored bytes.
    pub crc32:         u32,
}

#[derive(Debug)]
pub struct ArchiveStore {
    path:    PathBuf,
    base:    u64,
    size:    u64,
    entries: Vec<ArchiveEntry>,
    by_name: HashMap<String, usize>,
}

impl ArchiveStore {
    /// Open a standalone archive file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let len = file_len(path)?;
        Self::open_range(path, 0, len)
    }

    /// Open an archive embedded at `base..base + size` of `path`.
    pub fn open_range(path: impl AsRef<Path>, base: u64, size: u64) -> Result<Self> {
        let path = path.as_ref();
        let fail = |reason: String| TraceError::open(path, OpenFailure::Archive(reason));

        let len = file_len(path)?;
        let end = base.checked_add(size).ok_or_else(|| fail("archive range overflows".into()))?;
        if end > len {
            return Err(fail(format!("archive range {base}..{end} exceeds file length {len}")));
        }

        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(base))?;
        let entries = read_directory(BufReader::new(file).take(size), size).map_err(fail)?;

        let mut by_name = HashMap::with_capacity(entries.len());
        for (i, entry) in entries.iter().enumerate() {
            if by_name.insert(entry.name.clone(), i).is_some() {
                return Err(fail(format!("duplicate entry {:?}", entry.name)));
            }
        }
        debug!("Opened archive {} ({} entries at {base}+{size})", path.display(), entries.len());

        Ok(Self { path: path.to_path_buf(), base, size, entries, by_name })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> &[ArchiveEntry] {
        &self.entries
    }

    pub fn entry(&self, id: &str) -> Option<&ArchiveEntry> {
        self.by_name.get(id).map(|&i| &self.entries[i])
    }
}

impl BlobStore for ArchiveStore {
    fn describe(&self) -> String {
        format!("archive {} ({} bytes at {})", self.path.display(), self.size, self.base)
    }

    fn get(&self, id: &str) -> Result<Vec<u8>> {
        let entry = self.entry(id).ok_or_else(|| TraceError::BlobNotFound(id.to_owned()))?;
        let corrupt = |reason: String| TraceError::CorruptBlob { id: id.to_owned(), reason };

        let stored_len = usize::try_from(entry.stored_size)
            .map_err(|_| corrupt(format!("stored size {} is not addressable", entry.stored_size)))?;
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.base + entry.offset))?;
        let mut stored = vec![0u8; stored_len];
        file.read_exact(&mut stored).map_err(|e| corrupt(format!("short read: {e}")))?;

        let crc = crc32fast::hash(&stored);
        if crc != entry.crc32 {
            return Err(corrupt(format!(
                "CRC32 mismatch (stored 0x{:08X}, computed 0x{crc:08X})",
                entry.crc32
            )));
        }

        let original_len = usize::try_from(entry.original_size)
            .map_err(|_| corrupt(format!("original size {} is not addressable", entry.original_size)))?;
        let data = get_codec(entry.codec)
            .decompress_bounded(&stored, original_len)
            .map_err(|e| corrupt(e.to_string()))?;
        if data.len() as u64 != entry.original_size {
            return Err(corrupt(format!(
                "decompressed to {} bytes, directory says {}",
                data.len(),
                entry.original_size
            )));
        }
        Ok(data)
    }

    fn exists(&self, id: &str) -> bool {
        self.by_name.contains_key(id)
    }

    fn size(&self, id: &str) -> Result<u64> {
        self.entry(id)
            .map(|e| e.original_size)
            .ok_or_else(|| TraceError::BlobNotFound(id.to_owned()))
    }

    fn list(&self) -> Result<Vec<String>> {
        let mut names: Vec<String> = self.entries.iter().map(|e| e.name.clone()).collect();
        names.sort();
        Ok(names)
    }
}

// ── Directory parsing ────────────────────────────────────────────────────────

fn file_len(path: &Path) -> Result<u64> {
    match std::fs::metadata(path) {
        Ok(m) => Ok(m.len()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TraceError::open(path, OpenFailure::Missing)),
        Err(e) => Err(e.into()),
    }
}

fn read_directory<R: Read>(mut r: R, size: u64) -> std::result::Result<Vec<ArchiveEntry>, String> {
    let short = |e: io::Error| format!("directory truncated ({e})");

    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(short)?;
    if magic != ARCHIVE_MAGIC {
        return Err(format!("bad archive magic {magic:02X?}"));
    }
    let version = r.read_u16::<LittleEndian>().map_err(short)?;
    if version != ARCHIVE_VERSION {
        return Err(format!("unsupported archive version {version}"));
    }
    let _reserved = r.read_u16::<LittleEndian>().map_err(short)?;
    let count = r.read_u32::<LittleEndian>().map_err(short)? as u64;

    if count * MIN_ENTRY_SIZE > size.saturating_sub(ARCHIVE_HEADER_SIZE) {
        return Err(format!("{count} entries cannot fit in {size} bytes"));
    }

    let mut entries = Vec::with_capacity(count as usize);
    for i in 0..count {
        let name_len = r.read_u16::<LittleEndian>().map_err(short)? as usize;
        let mut name = vec![0u8; name_len];
        r.read_exact(&mut name).map_err(short)?;
        let name = String::from_utf8(name).map_err(|_| format!("entry {i} name is not UTF-8"))?;

        let tag           = r.read_u8().map_err(short)?;
        let offset        = r.read_u64::<LittleEndian>().map_err(short)?;
        let stored_size   = r.read_u64::<LittleEndian>().map_err(short)?;
        let original_size = r.read_u64::<LittleEndian>().map_err(short)?;
        let crc32         = r.read_u32::<LittleEndian>().map_err(short)?;

        let codec = CodecId::from_tag(tag).ok_or_else(|| format!("entry {name:?} uses unknown codec {tag}"))?;
        match offset.checked_add(stored_size) {
            Some(end) if offset >= ARCHIVE_HEADER_SIZE && end <= size => {}
            _ => return Err(format!("entry {name:?} lies outside the archive")),
        }

        entries.push(ArchiveEntry { name, codec, offset, stored_size, original_size, crc32 });
    }
    Ok(entries)
}
