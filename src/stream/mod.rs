//! The common record stream contract and the helpers built on top of it.
//!
//! Two backends implement [`RecordStream`]:
//!
//! | Backend                     | Storage                                   | Forward seek          |
//! |-----------------------------|-------------------------------------------|-----------------------|
//! | [`BinaryRecordStream`]      | framed, checksummed records in one file   | indexed, or linear scan |
//! | [`JsonRecordStream`]        | one JSON document, or one per frame       | always direct         |
//!
//! Both hand out records in the binary framing of [`crate::record`], so
//! consumers never see which backend produced them.  The current record is a
//! borrowed view into a buffer the stream reuses: it is valid until the next
//! call that moves the cursor.

pub mod binary;
pub mod json;

use std::fs::File;
use std::io::Read;
use std::ops::{Deref, DerefMut};
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::blob::BlobChain;
use crate::error::{OpenFailure, Result, TraceError};
use crate::options::ReaderOptions;
use crate::record::{Record, RecordBuf, RecordKind};
use crate::sof::{StartOfFile, SOF_MAGIC};

pub use binary::BinaryRecordStream;
pub use json::JsonRecordStream;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceFormat {
    Binary,
    Json,
}

impl TraceFormat {
    pub fn name(self) -> &'static str {
        match self {
            TraceFormat::Binary => "binary",
            TraceFormat::Json   => "json",
        }
    }
}

/// Outcome of a successful read.  Corruption is an `Err`, not a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// A record was read and is available from [`RecordStream::record`].
    Ok,
    /// The stream ended cleanly; the current record is a synthetic end record.
    Eof,
}

// ── Stream contract ──────────────────────────────────────────────────────────

pub trait RecordStream {
    fn format(&self) -> TraceFormat;
    fn path(&self) -> &Path;
    fn sof(&self) -> &StartOfFile;
    fn blobs(&self) -> &BlobChain;

    fn is_open(&self) -> bool;
    /// Release file handles and saved locations.  Reads fail with
    /// [`TraceError::NotOpen`] afterwards.
    fn close(&mut self);

    /// True once the last read produced an end record, recorded or synthetic.
    fn is_at_end(&self) -> bool;
    /// Whether seeking to an unvisited frame is cheap.
    fn can_quickly_seek_forward(&self) -> bool;
    fn cur_frame(&self) -> u32;
    /// Highest valid frame index.  May scan the rest of a binary trace once.
    fn max_frame_index(&mut self) -> Result<u32>;

    /// Position the cursor at the first record of `frame`.  A failed seek
    /// leaves the cursor where it was.
    fn seek_to_frame(&mut self, frame: u32) -> Result<()>;

    fn push_location(&mut self) -> Result<()>;
    fn pop_location(&mut self) -> Result<()>;

    /// Advance to the next record.  On corruption the current record becomes a
    /// synthetic end record and the fault is returned.
    fn read_next_record(&mut self) -> Result<ReadStatus>;
    /// The current record; invalidated by the next read, seek or pop.
    fn record(&self) -> Record<'_>;

    /// Read `num_frames` whole frames starting at `first_frame` into `batch`
    /// (cleared first).  Stops early at an end record, including the synthetic
    /// one a damaged record leaves behind; the batch then ends with it and the
    /// fault is logged.  Returns the number of frame boundaries crossed.  The
    /// caller's location is restored.
    fn read_frame_records(&mut self, first_frame: u32, num_frames: u32, batch: &mut RecordBatch) -> Result<u32> {
        batch.clear();
        if num_frames == 0 {
            return Ok(0);
        }

        let mut stream = ScopedLocation::new(self)?;
        stream.seek_to_frame(first_frame)?;

        let mut frames_read = 0;
        loop {
            let status = match stream.read_next_record() {
                Ok(status) => status,
                Err(e) if stream.is_at_end() && stream.record().is_end() => {
                    warn!("Batch read of {} stopped at frame {}: {e}", stream.path().display(), stream.cur_frame());
                    batch.push(stream.record().to_buf());
                    break;
                }
                Err(e) => return Err(e),
            };
            let record = stream.record();
            batch.push(record.to_buf());

            if status == ReadStatus::Eof || record.is_end() {
                break;
            }
            if record.is_frame_boundary() {
                frames_read += 1;
                if frames_read == num_frames {
                    break;
                }
            }
        }
        Ok(frames_read)
    }
}

// ── Scoped location ──────────────────────────────────────────────────────────

/// Pushes the stream's location on creation and pops it on drop.
pub struct ScopedLocation<'a, S: RecordStream + ?Sized> {
    stream: &'a mut S,
}

impl<'a, S: RecordStream + ?Sized> ScopedLocation<'a, S> {
    pub fn new(stream: &'a mut S) -> Result<Self> {
        stream.push_location()?;
        Ok(Self { stream })
    }
}

impl<S: RecordStream + ?Sized> Deref for ScopedLocation<'_, S> {
    type Target = S;
    fn deref(&self) -> &S {
        &*self.stream
    }
}

impl<S: RecordStream + ?Sized> DerefMut for ScopedLocation<'_, S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut *self.stream
    }
}

impl<S: RecordStream + ?Sized> Drop for ScopedLocation<'_, S> {
    fn drop(&mut self) {
        if let Err(e) = self.stream.pop_location() {
            warn!("Failed restoring location of {}: {e}", self.stream.path().display());
        }
    }
}

// ── Record batch ─────────────────────────────────────────────────────────────

/// Growable output of [`RecordStream::read_frame_records`].
#[derive(Debug, Clone, Default)]
pub struct RecordBatch {
    records: Vec<RecordBuf>,
}

impl RecordBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Drop the records, keeping the allocation.
    pub fn clear(&mut self) {
        self.records.clear();
    }

    pub fn push(&mut self, record: RecordBuf) {
        self.records.push(record);
    }

    pub fn get(&self, i: usize) -> Option<Record<'_>> {
        self.records.get(i).map(RecordBuf::view)
    }

    pub fn kind(&self, i: usize) -> Option<RecordKind> {
        self.records.get(i).map(RecordBuf::kind)
    }

    pub fn is_end(&self, i: usize) -> bool {
        self.kind(i) == Some(RecordKind::EndOfStream)
    }

    pub fn is_frame_boundary(&self, i: usize) -> bool {
        self.kind(i) == Some(RecordKind::FrameBoundary)
    }

    pub fn iter(&self) -> impl Iterator<Item = Record<'_>> {
        self.records.iter().map(RecordBuf::view)
    }

    pub fn records(&self) -> &[RecordBuf] {
        &self.records
    }

    pub fn into_records(self) -> Vec<RecordBuf> {
        self.records
    }
}

// ── Format sniffing ──────────────────────────────────────────────────────────

/// Work out which backend reads `path`.  Returns the path to open, which
/// differs from `path` when only a suffixed sibling (`path.bin`, `path.json`,
/// `path_000000.json`) exists.
pub fn detect_format(path: &Path) -> Option<(TraceFormat, PathBuf)> {
    match path.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("bin")  => return Some((TraceFormat::Binary, path.to_path_buf())),
        Some(ext) if ext.eq_ignore_ascii_case("json") => return Some((TraceFormat::Json, path.to_path_buf())),
        _ => {}
    }

    if path.is_file() {
        let mut head = [0u8; 64];
        let n = File::open(path).and_then(|mut f| f.read(&mut head)).unwrap_or(0);
        let head = &head[..n];
        if head.iter().find(|b| !b.is_ascii_whitespace()) == Some(&b'{') {
            return Some((TraceFormat::Json, path.to_path_buf()));
        }
        if head.len() >= 4 && head[..4] == SOF_MAGIC.to_le_bytes() {
            return Some((TraceFormat::Binary, path.to_path_buf()));
        }
    }

    let with_suffix = |suffix: &str| {
        let mut s = path.as_os_str().to_os_string();
        s.push(suffix);
        PathBuf::from(s)
    };
    [
        (TraceFormat::Binary, with_suffix(".bin")),
        (TraceFormat::Json,   with_suffix(".json")),
        (TraceFormat::Json,   with_suffix("_000000.json")),
    ]
    .into_iter()
    .find(|(_, candidate)| candidate.is_file())
}

/// True for `name_NNNNNN.ext`, the naming of per-frame JSON documents.
pub fn is_multiframe_json_filename(path: &Path) -> bool {
    let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
        return false;
    };
    let bytes = stem.as_bytes();
    bytes.len() >= 7
        && bytes[bytes.len() - 7] == b'_'
        && bytes[bytes.len() - 6..].iter().all(u8::is_ascii_digit)
}

/// Sniff the format of `path` and open it with the matching backend.
pub fn open_trace(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Box<dyn RecordStream>> {
    let path = path.as_ref();
    let Some((format, resolved)) = detect_format(path) else {
        let reason = if path.exists() { OpenFailure::UnknownFormat } else { OpenFailure::Missing };
        return Err(TraceError::open(path, reason));
    };
    debug!("Opening {} as a {} trace", resolved.display(), format.name());

    Ok(match format {
        TraceFormat::Binary => Box::new(BinaryRecordStream::open(&resolved, options)?),
        TraceFormat::Json   => Box::new(JsonRecordStream::open(&resolved, options)?),
    })
}
