//! Binary record stream: a start-of-file descriptor followed by framed,
//! checksummed records, optionally with an embedded packed archive.
//!
//! Frame `i` begins at `frame_offsets[i]`.  The table is either loaded in full
//! from the archive's `frame_file_offsets` blob at open, or starts with only
//! the first record offset and grows as reads cross frame boundaries.  Seeking
//! to a frame that has not been reached yet scans forward record by record.

use std::fs::File;
use std::io::{self, BufReader, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{ByteOrder, LittleEndian};
use log::{debug, error, warn};

use super::{ReadStatus, RecordStream, ScopedLocation, TraceFormat};
use crate::blob::{ArchiveStore, BlobChain, BlobStore, LooseFileStore, FRAME_FILE_OFFSETS_BLOB};
use crate::error::{Corruption, OpenFailure, Result, TraceError};
use crate::options::ReaderOptions;
use crate::record::{verify, Record, RecordHeader, RecordKind, RecordSlot, RECORD_HEADER_SIZE};
use crate::sof::StartOfFile;

#[derive(Debug, Clone, Copy)]
struct Location {
    offset: u64,
    frame:  u32,
    at_end: bool,
}

/// Result of framing one record at the cursor.
enum Framed {
    Record(RecordHeader),
    /// Clean end of the record region.
    End,
    Corrupt(Corruption),
}

pub struct BinaryRecordStream {
    path:          PathBuf,
    max_record:    u32,
    reader:        Option<BufReader<File>>,
    sof:           StartOfFile,
    blobs:         BlobChain,
    archive:       Option<Arc<ArchiveStore>>,
    /// Records occupy `sof.first_record_offset..records_end`.
    records_end:   u64,

    pos:           u64,
    cur_frame:     u32,
    at_end:        bool,
    max_frame:     Option<u32>,
    frame_offsets: Vec<u64>,
    indexed:       bool,
    locations:     Vec<Location>,
    slot:          RecordSlot,
}

impl BinaryRecordStream {
    pub fn open(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => TraceError::open(path, OpenFailure::Missing),
            _ => TraceError::Io(e),
        })?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let sof = StartOfFile::read(&mut reader).map_err(|reason| TraceError::open(path, reason))?;
        if sof.first_record_offset > file_len {
            return Err(TraceError::open(
                path,
                OpenFailure::BadDescriptor(format!(
                    "first record offset {} is past the end of the file ({file_len} bytes)",
                    sof.first_record_offset
                )),
            ));
        }

        let mut blobs = BlobChain::new().with(Arc::new(LooseFileStore::new(options.loose_dir_for(path))));
        let mut records_end = file_len;
        let mut archive = None;
        if sof.has_archive() {
            let store = Arc::new(ArchiveStore::open_range(path, sof.archive_offset, sof.archive_size)?);
            if sof.archive_offset >= sof.first_record_offset {
                records_end = records_end.min(sof.archive_offset);
            }
            blobs.push(store.clone());
            archive = Some(store);
        }

        let loaded = match &archive {
            Some(store) if options.use_frame_index => {
                load_frame_index(store, sof.first_record_offset, records_end)
            }
            _ => None,
        };
        let indexed = loaded.is_some();
        let frame_offsets = loaded.unwrap_or_else(|| vec![sof.first_record_offset]);
        let max_frame = indexed.then(|| frame_offsets.len() as u32 - 1);

        reader.seek(SeekFrom::Start(sof.first_record_offset))?;
        debug!(
            "Opened {} (version 0x{:04X}, records {}..{records_end}, {} frames indexed)",
            path.display(),
            sof.version,
            sof.first_record_offset,
            frame_offsets.len()
        );

        Ok(Self {
            path: path.to_path_buf(),
            max_record: options.max_record_size,
            reader: Some(reader),
            pos: sof.first_record_offset,
            sof,
            blobs,
            archive,
            records_end,
            cur_frame: 0,
            at_end: false,
            max_frame,
            frame_offsets,
            indexed,
            locations: Vec::new(),
            slot: RecordSlot::new(),
        })
    }

    /// The embedded archive, if the descriptor declares one.
    pub fn archive(&self) -> Option<&ArchiveStore> {
        self.archive.as_deref()
    }

    /// Start offsets of every frame discovered so far.
    pub fn frame_offsets(&self) -> &[u64] {
        &self.frame_offsets
    }

    /// Whether a precomputed frame-offset index was loaded at open.
    pub fn has_frame_index(&self) -> bool {
        self.indexed
    }

    /// Byte offset of the next record to be read.
    pub fn position(&self) -> u64 {
        self.pos
    }

    /// [`seek_to_frame`](RecordStream::seek_to_frame), reporting
    /// `(frames_indexed, byte_offset)` each time a linear scan discovers a new
    /// frame.  Returning `ControlFlow::Break` from `progress` abandons the
    /// seek with [`TraceError::Cancelled`]; frames discovered so far stay
    /// indexed.
    pub fn seek_to_frame_with_progress<F>(&mut self, frame: u32, mut progress: F) -> Result<()>
    where
        F: FnMut(u32, u64) -> ControlFlow<()>,
    {
        if self.reader.is_none() {
            return Err(TraceError::NotOpen);
        }
        if let Some(&offset) = self.frame_offsets.get(frame as usize) {
            return self.set_location(Location { offset, frame, at_end: false });
        }
        if let Some(max) = self.max_frame {
            return Err(TraceError::SeekOutOfRange { requested: frame, max });
        }

        let saved = self.location();
        let last = self.frame_offsets.len() - 1;
        warn!(
            "Seeking to frame {frame} of {} requires scanning forward from frame {last}, this may take a while",
            self.path.display()
        );
        self.set_location(Location { offset: self.frame_offsets[last], frame: last as u32, at_end: false })?;

        while self.frame_offsets.len() <= frame as usize {
            let known = self.frame_offsets.len();
            let status = match self.read_next_record() {
                Ok(status) => status,
                Err(e) => {
                    self.restore_after_failed_seek(saved);
                    return Err(e);
                }
            };
            if status == ReadStatus::Eof || self.slot.view().is_end() {
                break;
            }
            if self.frame_offsets.len() > known
                && progress(self.frame_offsets.len() as u32, self.pos).is_break()
            {
                self.restore_after_failed_seek(saved);
                return Err(TraceError::Cancelled);
            }
        }

        match self.frame_offsets.get(frame as usize) {
            Some(&offset) => self.set_location(Location { offset, frame, at_end: false }),
            None => {
                let max = self.max_frame.unwrap_or(self.cur_frame);
                self.restore_after_failed_seek(saved);
                Err(TraceError::SeekOutOfRange { requested: frame, max })
            }
        }
    }

    // ── Internal helpers ─────────────────────────────────────────────────────

    fn location(&self) -> Location {
        Location { offset: self.pos, frame: self.cur_frame, at_end: self.at_end }
    }

    fn set_location(&mut self, loc: Location) -> Result<()> {
        let reader = self.reader.as_mut().ok_or(TraceError::NotOpen)?;
        reader.seek(SeekFrom::Start(loc.offset))?;
        self.pos = loc.offset;
        self.cur_frame = loc.frame;
        self.at_end = loc.at_end;
        Ok(())
    }

    fn restore_after_failed_seek(&mut self, saved: Location) {
        if let Err(e) = self.set_location(saved) {
            warn!("Failed restoring cursor to offset {}: {e}", saved.offset);
        }
    }

    /// Read one record at the cursor into the slot.
    fn frame_next(&mut self) -> io::Result<Framed> {
        let remaining = self.records_end.saturating_sub(self.pos);
        if remaining == 0 {
            return Ok(Framed::End);
        }
        if remaining < RECORD_HEADER_SIZE as u64 {
            return Ok(Framed::Corrupt(Corruption::Truncated { wanted: RECORD_HEADER_SIZE as u64, got: remaining }));
        }

        let Some(reader) = self.reader.as_mut() else {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "stream closed"));
        };
        let mut raw = [0u8; RECORD_HEADER_SIZE];
        reader.read_exact(&mut raw)?;

        let header = match RecordHeader::parse(&raw, self.max_record) {
            Ok(h) => h,
            Err(fault) => return Ok(Framed::Corrupt(fault)),
        };
        if header.size as u64 > remaining {
            return Ok(Framed::Corrupt(Corruption::Truncated { wanted: header.size as u64, got: remaining }));
        }

        let payload = self.slot.prepare(header, &raw);
        reader.read_exact(payload)?;
        match verify(self.slot.bytes()) {
            Ok(()) => Ok(Framed::Record(header)),
            Err(fault) => Ok(Framed::Corrupt(fault)),
        }
    }

    fn fail(&mut self, offset: u64, fault: Corruption) -> TraceError {
        error!("{}: corrupt record at offset {offset}: {fault}", self.path.display());
        self.slot.set_end();
        self.at_end = true;
        self.rewind(offset);
        TraceError::CorruptRecord { offset, fault }
    }

    /// Put the reader back on the record at `offset` after a read that
    /// stopped partway through it.
    fn rewind(&mut self, offset: u64) {
        if let Some(reader) = self.reader.as_mut() {
            if let Err(e) = reader.seek(SeekFrom::Start(offset)) {
                debug!("Failed rewinding to offset {offset}: {e}");
            }
        }
    }

    fn note_frame_boundary(&mut self) {
        self.cur_frame = self.cur_frame.saturating_add(1);
        let next = self.cur_frame as usize;
        match self.frame_offsets.get(next) {
            Some(&known) if known != self.pos => warn!(
                "Frame {next} starts at offset {} but the index says {known}",
                self.pos
            ),
            Some(_) => {}
            None if next == self.frame_offsets.len() => self.frame_offsets.push(self.pos),
            None => debug!("Frame {next} discovered past the end of the index"),
        }
    }

    fn note_end(&mut self) {
        self.at_end = true;
        if self.max_frame.is_none() {
            self.max_frame = Some(self.cur_frame);
        }
    }
}

impl RecordStream for BinaryRecordStream {
    fn format(&self) -> TraceFormat { TraceFormat::Binary }
    fn path(&self) -> &Path { &self.path }
    fn sof(&self) -> &StartOfFile { &self.sof }
    fn blobs(&self) -> &BlobChain { &self.blobs }
    fn is_open(&self) -> bool { self.reader.is_some() }

    fn close(&mut self) {
        self.reader = None;
        self.locations.clear();
        self.slot.set_end();
        self.at_end = false;
    }

    fn is_at_end(&self) -> bool { self.at_end }
    fn can_quickly_seek_forward(&self) -> bool { self.indexed }
    fn cur_frame(&self) -> u32 { self.cur_frame }

    fn max_frame_index(&mut self) -> Result<u32> {
        if let Some(max) = self.max_frame {
            return Ok(max);
        }
        let mut stream = ScopedLocation::new(self)?;
        match stream.seek_to_frame(u32::MAX) {
            Ok(()) | Err(TraceError::SeekOutOfRange { .. }) => {}
            Err(e) => return Err(e),
        }
        Ok(stream.max_frame.unwrap_or(stream.frame_offsets.len() as u32 - 1))
    }

    fn seek_to_frame(&mut self, frame: u32) -> Result<()> {
        self.seek_to_frame_with_progress(frame, |_, _| ControlFlow::Continue(()))
    }

    fn push_location(&mut self) -> Result<()> {
        if self.reader.is_none() {
            return Err(TraceError::NotOpen);
        }
        self.locations.push(self.location());
        Ok(())
    }

    fn pop_location(&mut self) -> Result<()> {
        let loc = self.locations.pop().ok_or(TraceError::LocationStackEmpty)?;
        self.set_location(loc)
    }

    fn read_next_record(&mut self) -> Result<ReadStatus> {
        if self.reader.is_none() {
            return Err(TraceError::NotOpen);
        }
        let offset = self.pos;
        let framed = match self.frame_next() {
            Ok(framed) => framed,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                let got = self.records_end.saturating_sub(offset);
                Framed::Corrupt(Corruption::Truncated { wanted: RECORD_HEADER_SIZE as u64, got })
            }
            Err(e) => {
                error!("{}: failed reading record at offset {offset}: {e}", self.path.display());
                self.slot.set_end();
                self.at_end = true;
                self.rewind(offset);
                return Err(e.into());
            }
        };

        match framed {
            Framed::End => {
                self.slot.set_end();
                self.note_end();
                Ok(ReadStatus::Eof)
            }
            Framed::Corrupt(fault) => Err(self.fail(offset, fault)),
            Framed::Record(header) => {
                self.pos = offset + header.size as u64;
                self.at_end = false;
                match header.kind {
                    RecordKind::FrameBoundary => self.note_frame_boundary(),
                    RecordKind::EndOfStream   => self.note_end(),
                    _ => {}
                }
                Ok(ReadStatus::Ok)
            }
        }
    }

    fn record(&self) -> Record<'_> {
        self.slot.view()
    }
}

// ── Frame index ──────────────────────────────────────────────────────────────

fn load_frame_index(archive: &ArchiveStore, first_record: u64, records_end: u64) -> Option<Vec<u64>> {
    match archive.get(FRAME_FILE_OFFSETS_BLOB) {
        Ok(bytes) => match parse_frame_index(&bytes, first_record, records_end) {
            Ok(offsets) => Some(offsets),
            Err(reason) => {
                warn!("Ignoring frame offset index: {reason}");
                None
            }
        },
        Err(e) if e.is_not_found() => {
            debug!("No frame offset index, frames will be indexed as they are read");
            None
        }
        Err(e) => {
            warn!("Failed reading frame offset index: {e}");
            None
        }
    }
}

/// Decode and sanity check a packed `u64` frame offset table.
pub(crate) fn parse_frame_index(bytes: &[u8], first_record: u64, records_end: u64) -> std::result::Result<Vec<u64>, String> {
    if bytes.is_empty() || bytes.len() % 8 != 0 {
        return Err(format!("size {} is not a positive multiple of 8", bytes.len()));
    }
    let offsets: Vec<u64> = bytes.chunks_exact(8).map(LittleEndian::read_u64).collect();
    if offsets[0] != first_record {
        return Err(format!("frame 0 at {}, first record at {first_record}", offsets[0]));
    }
    if let Some(i) = offsets.windows(2).position(|w| w[1] < w[0]) {
        return Err(format!("offsets decrease at frame {}", i + 1));
    }
    if let Some(&last) = offsets.last().filter(|&&o| o > records_end) {
        return Err(format!("offset {last} lies past the record region ending at {records_end}"));
    }
    Ok(offsets)
}
