//! JSON record stream.
//!
//! A trace is either one document holding every frame, or a family of
//! per-frame documents named `base_000000.json`, `base_000001.json`, ...
//! Every document has the shape
//!
//! ```json
//! { "sof":     { "version": 262, "pointer_sizes": 8, "uuid": [1, 2, 3, 4],
//!                "archive_filename": "trace_archive.blobs" },
//!   "meta":    { "cur_frame": 0, "eof": 1, "uuid": [1, 2, 3, 4] },
//!   "packets": [ { "type": "entrypoint", "flags": 0, "payload": "0a0b" },
//!                { "type": "frame_boundary" } ] }
//! ```
//!
//! where `sof` is only read from the first document.  Packet nodes are
//! re-encoded into the binary record framing as they are read.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use log::{debug, error, warn};
use serde::{Deserialize, Deserializer};
use serde_json::Value;

use super::{is_multiframe_json_filename, ReadStatus, RecordStream, TraceFormat};
use crate::blob::{ArchiveStore, BlobChain, LooseFileStore};
use crate::error::{OpenFailure, Result, TraceError};
use crate::options::ReaderOptions;
use crate::record::{encode_record, Record, RecordBuf, RecordKind, RecordSlot, RECORD_HEADER_SIZE};
use crate::sof::{check_pointer_sizes, uuid_from_words, StartOfFile, FORMAT_VERSION, MIN_COMPATIBLE_VERSION};

// ── Document model ───────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct Document {
    #[serde(default)]
    sof:     Option<SofNode>,
    #[serde(default)]
    meta:    Option<MetaNode>,
    #[serde(default)]
    packets: Option<Vec<Value>>,
}

#[derive(Debug, Deserialize)]
struct SofNode {
    version:          u16,
    pointer_sizes:    i64,
    #[serde(default)]
    uuid:             Vec<u32>,
    #[serde(default)]
    archive_filename: Option<String>,
}

#[derive(Debug, Deserialize)]
struct MetaNode {
    cur_frame: i64,
    #[serde(default, deserialize_with = "flag")]
    eof:       bool,
    #[serde(default)]
    uuid:      Option<Vec<u32>>,
}

#[derive(Debug, Deserialize)]
struct PacketNode {
    #[serde(rename = "type")]
    kind:         String,
    #[serde(default)]
    flags:        u8,
    #[serde(default)]
    payload:      Option<String>,
    #[serde(default)]
    payload_blob: Option<String>,
}

/// Writers have emitted both `true` and `1`.
fn flag<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Bool(bool),
        Int(i64),
    }
    Ok(match Raw::deserialize(deserializer)? {
        Raw::Bool(b) => b,
        Raw::Int(i)  => i != 0,
    })
}

fn packet_to_record(node: &Value, blobs: &BlobChain, max_size: u32) -> std::result::Result<RecordBuf, String> {
    let packet = PacketNode::deserialize(node).map_err(|e| e.to_string())?;
    let kind = RecordKind::from_name(&packet.kind).ok_or_else(|| format!("unknown packet type {:?}", packet.kind))?;

    let payload = match (&packet.payload, &packet.payload_blob) {
        (Some(_), Some(_)) => return Err("both payload and payload_blob are set".into()),
        (Some(hex_str), None) => hex::decode(hex_str).map_err(|e| format!("bad payload hex: {e}"))?,
        (None, Some(id)) => blobs.get(id).map_err(|e| format!("payload blob unavailable: {e}"))?,
        (None, None) => Vec::new(),
    };
    if (payload.len() + RECORD_HEADER_SIZE) as u64 > max_size as u64 {
        return Err(format!("payload of {} bytes exceeds the record size limit", payload.len()));
    }
    Ok(encode_record(kind, packet.flags, &payload))
}

// ── Stream ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Layout {
    Single,
    /// `dir/stem_NNNNNN.ext` for `NNNNNN` in `0..count`.
    Numbered { dir: PathBuf, stem: String, ext: String, count: u32 },
}

#[derive(Debug)]
struct LoadedDoc {
    /// Frame number of a per-frame document; 0 for a single document.
    index:        u32,
    path:         PathBuf,
    eof:          bool,
    packets:      Vec<Value>,
    /// Single documents only: packet index where each frame starts.
    frame_starts: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct Location {
    doc:       u32,
    packet:    usize,
    frame:     u32,
    exhausted: bool,
    at_end:    bool,
}

pub struct JsonRecordStream {
    path:         PathBuf,
    options:      ReaderOptions,
    layout:       Layout,
    sof:          StartOfFile,
    blobs:        BlobChain,
    archive:      Option<Arc<ArchiveStore>>,
    max_frame:    u32,

    open:         bool,
    doc:          Option<LoadedDoc>,
    packet_index: usize,
    cur_frame:    u32,
    /// Cursor is past the final packet of the final document.
    exhausted:    bool,
    at_end:       bool,
    locations:    Vec<Location>,
    slot:         RecordSlot,
}

impl JsonRecordStream {
    /// Open a single document, or a per-frame family given any member's name
    /// or the bare `base.json` name of a family whose `base_000000.json` exists.
    pub fn open(path: impl AsRef<Path>, options: &ReaderOptions) -> Result<Self> {
        let path = path.as_ref();
        let layout = detect_layout(path).ok_or_else(|| TraceError::open(path, OpenFailure::Missing))?;
        let first_path = match &layout {
            Layout::Single => path.to_path_buf(),
            numbered => numbered_path(numbered, 0),
        };

        let doc = load_document(&first_path, options)?;
        let sof_node = doc
            .sof
            .as_ref()
            .ok_or_else(|| TraceError::open(&first_path, OpenFailure::BadDescriptor("missing sof node".into())))?;

        check_pointer_sizes(sof_node.pointer_sizes)
            .map_err(|reason| TraceError::open(&first_path, OpenFailure::BadDescriptor(reason)))?;
        if sof_node.version < MIN_COMPATIBLE_VERSION {
            return Err(TraceError::open(
                &first_path,
                OpenFailure::IncompatibleVersion { found: sof_node.version, minimum: MIN_COMPATIBLE_VERSION },
            ));
        }
        if sof_node.version > FORMAT_VERSION {
            warn!(
                "Trace file version is 0x{:04X}, expected version 0x{FORMAT_VERSION:04X}, this may not work at all!",
                sof_node.version
            );
        }
        let sof = StartOfFile {
            version:             sof_node.version,
            pointer_sizes:       sof_node.pointer_sizes as u8,
            uuid:                uuid_from_words(&sof_node.uuid),
            first_record_offset: 0,
            archive_offset:      0,
            archive_size:        0,
        };

        let mut blobs = BlobChain::new().with(Arc::new(LooseFileStore::new(options.loose_dir_for(path))));
        let archive = match sof_node.archive_filename.as_deref().filter(|s| !s.is_empty()) {
            Some(name) => {
                let archive_path = resolve_archive_path(&first_path, name);
                match ArchiveStore::open(&archive_path) {
                    Ok(store) => Some(Arc::new(store)),
                    Err(e) => {
                        warn!("Failed opening archive {}: {e}", archive_path.display());
                        None
                    }
                }
            }
            None => None,
        };
        if let Some(store) = &archive {
            blobs.push(store.clone());
        }

        let first = match &layout {
            Layout::Single => LoadedDoc::single(first_path, doc)?,
            Layout::Numbered { .. } => LoadedDoc::numbered(first_path, 0, doc, &sof)?,
        };
        let max_frame = match &layout {
            Layout::Single => first.frame_starts.len() as u32 - 1,
            Layout::Numbered { count, .. } => count - 1,
        };
        debug!("Opened {} ({} frames)", path.display(), max_frame + 1);

        Ok(Self {
            path: path.to_path_buf(),
            options: options.clone(),
            layout,
            sof,
            blobs,
            archive,
            max_frame,
            open: true,
            doc: Some(first),
            packet_index: 0,
            cur_frame: 0,
            exhausted: false,
            at_end: false,
            locations: Vec::new(),
            slot: RecordSlot::new(),
        })
    }

    /// The archive named by the descriptor, if it could be opened.
    pub fn archive(&self) -> Option<&ArchiveStore> {
        self.archive.as_deref()
    }

    pub fn is_multiframe(&self) -> bool {
        matches!(self.layout, Layout::Numbered { .. })
    }

    /// Path of the document the cursor is in.
    pub fn current_document(&self) -> Option<&Path> {
        self.doc.as_ref().map(|d| d.path.as_path())
    }

    fn load_numbered(&self, index: u32) -> Result<LoadedDoc> {
        let path = numbered_path(&self.layout, index);
        let doc = load_document(&path, &self.options)?;
        LoadedDoc::numbered(path, index, doc, &self.sof)
    }

    /// Make document `index` current, loading it unless it already is.
    fn enter_document(&mut self, index: u32) -> Result<()> {
        if self.doc.as_ref().map(|d| d.index) != Some(index) {
            let doc = self.load_numbered(index)?;
            self.doc = Some(doc);
        }
        Ok(())
    }

    fn location(&self) -> Location {
        Location {
            doc:       self.doc.as_ref().map_or(0, |d| d.index),
            packet:    self.packet_index,
            frame:     self.cur_frame,
            exhausted: self.exhausted,
            at_end:    self.at_end,
        }
    }

    fn fail(&mut self, err: TraceError) -> TraceError {
        error!("{err}");
        self.slot.set_end();
        self.at_end = true;
        err
    }
}

impl LoadedDoc {
    fn single(path: PathBuf, doc: Document) -> Result<Self> {
        check_cur_frame(&path, &doc, 0)?;
        let eof = doc.meta.as_ref().map_or(true, |m| m.eof);
        let packets = take_packets(&path, doc)?;

        let mut frame_starts = vec![0];
        for (i, node) in packets.iter().enumerate() {
            if node.get("type").and_then(Value::as_str) == Some(RecordKind::FrameBoundary.name()) {
                frame_starts.push(i + 1);
            }
        }
        Ok(Self { index: 0, path, eof, packets, frame_starts })
    }

    fn numbered(path: PathBuf, index: u32, doc: Document, sof: &StartOfFile) -> Result<Self> {
        check_cur_frame(&path, &doc, index)?;
        if let Some(words) = doc.meta.as_ref().and_then(|m| m.uuid.as_ref()) {
            if uuid_from_words(words) != sof.uuid {
                warn!("Document {} has UUID {}, trace UUID is {}", path.display(), uuid_from_words(words), sof.uuid);
            }
        }
        let eof = doc.meta.as_ref().map_or(false, |m| m.eof);
        let packets = take_packets(&path, doc)?;
        Ok(Self { index, path, eof, packets, frame_starts: Vec::new() })
    }
}

/// Every document must declare the frame it was expected to hold.  A missing
/// `meta` node counts as frame -1.
fn check_cur_frame(path: &Path, doc: &Document, expected: u32) -> Result<()> {
    let found = doc.meta.as_ref().map_or(-1, |m| m.cur_frame);
    if found != expected as i64 {
        return Err(TraceError::BackendMismatch { path: path.to_path_buf(), expected, found });
    }
    Ok(())
}

fn take_packets(path: &Path, doc: Document) -> Result<Vec<Value>> {
    doc.packets
        .ok_or_else(|| TraceError::open(path, OpenFailure::BadDocument("missing packets array".into())))
}

impl RecordStream for JsonRecordStream {
    fn format(&self) -> TraceFormat { TraceFormat::Json }
    fn path(&self) -> &Path { &self.path }
    fn sof(&self) -> &StartOfFile { &self.sof }
    fn blobs(&self) -> &BlobChain { &self.blobs }
    fn is_open(&self) -> bool { self.open }

    fn close(&mut self) {
        self.open = false;
        self.doc = None;
        self.locations.clear();
        self.slot.set_end();
        self.at_end = false;
    }

    fn is_at_end(&self) -> bool { self.at_end }
    fn can_quickly_seek_forward(&self) -> bool { true }
    fn cur_frame(&self) -> u32 { self.cur_frame }

    fn max_frame_index(&mut self) -> Result<u32> {
        if !self.open {
            return Err(TraceError::NotOpen);
        }
        Ok(self.max_frame)
    }

    /// Frame `max + 1` is the position just past the last record.
    fn seek_to_frame(&mut self, frame: u32) -> Result<()> {
        if !self.open {
            return Err(TraceError::NotOpen);
        }
        if frame as u64 > self.max_frame as u64 + 1 {
            return Err(TraceError::SeekOutOfRange { requested: frame, max: self.max_frame });
        }
        let past_end = frame > self.max_frame;

        if self.is_multiframe() {
            self.enter_document(frame.min(self.max_frame))?;
            self.packet_index = if past_end { self.doc.as_ref().map_or(0, |d| d.packets.len()) } else { 0 };
        } else {
            let doc = self.doc.as_ref().ok_or(TraceError::NotOpen)?;
            self.packet_index = if past_end { doc.packets.len() } else { doc.frame_starts[frame as usize] };
        }
        self.cur_frame = frame;
        self.exhausted = past_end;
        self.at_end = false;
        Ok(())
    }

    fn push_location(&mut self) -> Result<()> {
        if !self.open {
            return Err(TraceError::NotOpen);
        }
        self.locations.push(self.location());
        Ok(())
    }

    fn pop_location(&mut self) -> Result<()> {
        let loc = self.locations.pop().ok_or(TraceError::LocationStackEmpty)?;
        if self.is_multiframe() {
            self.enter_document(loc.doc)?;
        }
        self.packet_index = loc.packet;
        self.cur_frame = loc.frame;
        self.exhausted = loc.exhausted;
        self.at_end = loc.at_end;
        Ok(())
    }

    fn read_next_record(&mut self) -> Result<ReadStatus> {
        if !self.open {
            return Err(TraceError::NotOpen);
        }
        loop {
            if self.exhausted {
                self.slot.set_end();
                self.at_end = true;
                return Ok(ReadStatus::Eof);
            }
            let (doc_index, doc_len, doc_eof) = match &self.doc {
                Some(d) => (d.index, d.packets.len(), d.eof),
                None => return Err(TraceError::NotOpen),
            };

            if self.packet_index >= doc_len {
                let has_next = matches!(self.layout, Layout::Numbered { count, .. } if doc_index + 1 < count);
                if doc_eof {
                    if has_next {
                        debug!("Document {doc_index} of {} is marked eof, ignoring later documents", self.path.display());
                    }
                    self.exhausted = true;
                } else if has_next {
                    match self.load_numbered(doc_index + 1) {
                        Ok(doc) => {
                            self.doc = Some(doc);
                            self.packet_index = 0;
                            self.cur_frame = doc_index + 1;
                        }
                        Err(e) => return Err(self.fail(e)),
                    }
                } else {
                    warn!("Last document of {} is not marked eof, ending the stream", self.path.display());
                    self.exhausted = true;
                }
                continue;
            }

            let index = self.packet_index;
            let converted = {
                let doc = match &self.doc {
                    Some(d) => d,
                    None => return Err(TraceError::NotOpen),
                };
                let node = &doc.packets[index];
                if node.is_object() {
                    Some(
                        packet_to_record(node, &self.blobs, self.options.max_record_size)
                            .map_err(|reason| TraceError::InvalidNode { path: doc.path.clone(), index, reason }),
                    )
                } else {
                    warn!("Skipping non-object packet node {index} in {}", doc.path.display());
                    None
                }
            };

            match converted {
                None => self.packet_index += 1,
                Some(Err(e)) => return Err(self.fail(e)),
                Some(Ok(record)) => {
                    self.packet_index += 1;
                    self.at_end = record.kind() == RecordKind::EndOfStream;
                    if record.kind() == RecordKind::FrameBoundary {
                        self.cur_frame = self.cur_frame.saturating_add(1);
                    }
                    self.slot.set(record);
                    return Ok(ReadStatus::Ok);
                }
            }
        }
    }

    fn record(&self) -> Record<'_> {
        self.slot.view()
    }
}

// ── Files ────────────────────────────────────────────────────────────────────

fn detect_layout(path: &Path) -> Option<Layout> {
    let dir = path.parent().map(Path::to_path_buf).unwrap_or_default();
    let ext = path.extension().and_then(|e| e.to_str()).unwrap_or("json").to_owned();
    let stem = path.file_stem()?.to_str()?;

    let base = if is_multiframe_json_filename(path) {
        stem[..stem.len() - 7].to_owned()
    } else if path.is_file() {
        return Some(Layout::Single);
    } else {
        stem.to_owned()
    };

    let mut layout = Layout::Numbered { dir, stem: base, ext, count: 0 };
    let count = (0u32..).take_while(|&i| numbered_path(&layout, i).is_file()).count() as u32;
    if count == 0 {
        return None;
    }
    if let Layout::Numbered { count: c, .. } = &mut layout {
        *c = count;
    }
    Some(layout)
}

fn numbered_path(layout: &Layout, index: u32) -> PathBuf {
    match layout {
        Layout::Numbered { dir, stem, ext, .. } => dir.join(format!("{stem}_{index:06}.{ext}")),
        Layout::Single => PathBuf::new(),
    }
}

/// A bare file name lives next to the document that names it.
fn resolve_archive_path(doc_path: &Path, name: &str) -> PathBuf {
    let name_path = Path::new(name);
    if name_path.components().count() > 1 || name_path.is_absolute() {
        return name_path.to_path_buf();
    }
    doc_path.parent().map_or_else(|| name_path.to_path_buf(), |dir| dir.join(name_path))
}

fn read_document(path: &Path) -> Result<Document> {
    let bytes = fs::read(path)?;
    serde_json::from_slice(&bytes).map_err(|source| TraceError::Json { path: path.to_path_buf(), source })
}

/// Documents may still be being written by the capturing process; a failed
/// read is retried after a delay.
fn load_document(path: &Path, options: &ReaderOptions) -> Result<Document> {
    let mut attempt = 0;
    loop {
        match read_document(path) {
            Ok(doc) => return Ok(doc),
            Err(TraceError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TraceError::open(path, OpenFailure::Missing));
            }
            Err(e) if attempt < options.json_read_retries => {
                attempt += 1;
                warn!("{e}, retrying ({attempt}/{})", options.json_read_retries);
                thread::sleep(options.json_retry_delay);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_nodes_become_records() {
        let blobs = BlobChain::new();
        let node: Value = serde_json::json!({ "type": "entrypoint", "flags": 3, "payload": "0A0b" });
        let rec = packet_to_record(&node, &blobs, 1024).unwrap();
        assert_eq!(rec.kind(), RecordKind::Entrypoint);
        assert_eq!(rec.view().flags(), 3);
        assert_eq!(rec.payload(), &[0x0a, 0x0b]);

        let swap = packet_to_record(&serde_json::json!({ "type": "frame_boundary" }), &blobs, 1024).unwrap();
        assert!(swap.view().is_frame_boundary());
        assert!(swap.payload().is_empty());

        for bad in [
            serde_json::json!({ "type": "mystery" }),
            serde_json::json!({ "type": "control", "payload": "zz" }),
            serde_json::json!({ "type": "control", "payload": "00", "payload_blob": "x" }),
            serde_json::json!({ "type": "control", "payload_blob": "missing" }),
            serde_json::json!({ "flags": 1 }),
            serde_json::json!({ "type": "entrypoint", "payload": "00".repeat(100) }),
        ] {
            assert!(packet_to_record(&bad, &blobs, 64).is_err(), "{bad}");
        }
    }

    #[test]
    fn eof_flag_accepts_bool_and_int() {
        let m: MetaNode = serde_json::from_str(r#"{ "cur_frame": 2, "eof": 1 }"#).unwrap();
        assert!(m.eof);
        let m: MetaNode = serde_json::from_str(r#"{ "cur_frame": 2, "eof": false }"#).unwrap();
        assert!(!m.eof);
        let m: MetaNode = serde_json::from_str(r#"{ "cur_frame": 2 }"#).unwrap();
        assert!(!m.eof);
    }

    #[test]
    fn archive_names_resolve_next_to_the_document() {
        let doc = Path::new("/traces/run1/cap_000000.json");
        assert_eq!(resolve_archive_path(doc, "cap.blobs"), PathBuf::from("/traces/run1/cap.blobs"));
        assert_eq!(resolve_archive_path(doc, "/abs/cap.blobs"), PathBuf::from("/abs/cap.blobs"));
        assert_eq!(resolve_archive_path(doc, "sub/cap.blobs"), PathBuf::from("sub/cap.blobs"));
    }

    #[test]
    fn layout_detection() {
        let dir = tempfile::tempdir().unwrap();
        for i in 0..3 {
            fs::write(dir.path().join(format!("t_{i:06}.json")), b"{}").unwrap();
        }
        fs::write(dir.path().join("one.json"), b"{}").unwrap();

        match detect_layout(&dir.path().join("t_000002.json")).unwrap() {
            Layout::Numbered { stem, count, .. } => assert_eq!((stem.as_str(), count), ("t", 3)),
            other => panic!("{other:?}"),
        }
        match detect_layout(&dir.path().join("t.json")).unwrap() {
            Layout::Numbered { count, .. } => assert_eq!(count, 3),
            other => panic!("{other:?}"),
        }
        assert!(matches!(detect_layout(&dir.path().join("one.json")), Some(Layout::Single)));
        assert!(detect_layout(&dir.path().join("none.json")).is_none());
    }
}
