//! On-disk fixture writers shared by the integration tests.

#![allow(dead_code)]

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, WriteBytesExt};
use serde_json::{json, Value};
use tracefile::blob::packed::{ARCHIVE_HEADER_SIZE, ARCHIVE_MAGIC, ARCHIVE_VERSION};
use tracefile::record::encode_record;
use tracefile::sof::{StartOfFile, SOF_SIZE};
use tracefile::{get_codec, CodecId, RecordKind};
use uuid::Uuid;

pub const TRACE_UUID: [u32; 4] = [0x1111_1111, 0x2222_2222, 0x3333_3333, 0x4444_4444];

pub fn trace_uuid() -> Uuid {
    tracefile::sof::uuid_from_words(&TRACE_UUID)
}

/// The logical trace used throughout: two frames then an end record.
pub fn sample_records() -> Vec<(RecordKind, u8, Vec<u8>)> {
    vec![
        (RecordKind::Entrypoint,    0, b"glClear".to_vec()),
        (RecordKind::Entrypoint,    1, b"glDrawArrays".to_vec()),
        (RecordKind::FrameBoundary, 0, Vec::new()),
        (RecordKind::Entrypoint,    0, b"glBindTexture".to_vec()),
        (RecordKind::FrameBoundary, 0, Vec::new()),
        (RecordKind::EndOfStream,   0, Vec::new()),
    ]
}

/// `frames` frames of `calls_per_frame` entrypoints each, then an end record.
pub fn many_frames(frames: u32, calls_per_frame: u32) -> Vec<(RecordKind, u8, Vec<u8>)> {
    let mut out = Vec::new();
    for f in 0..frames {
        for c in 0..calls_per_frame {
            out.push((RecordKind::Entrypoint, 0, format!("call {f}.{c}").into_bytes()));
        }
        out.push((RecordKind::FrameBoundary, 0, Vec::new()));
    }
    out.push((RecordKind::EndOfStream, 0, Vec::new()));
    out
}

// ── Packed archive ───────────────────────────────────────────────────────────

pub fn build_archive(entries: &[(&str, CodecId, Vec<u8>)]) -> Vec<u8> {
    let stored: Vec<Vec<u8>> = entries
        .iter()
        .map(|(_, codec, data)| get_codec(*codec).compress(data, 3).unwrap())
        .collect();
    let dir_len = ARCHIVE_HEADER_SIZE
        + entries.iter().map(|(name, _, _)| 31 + name.len() as u64).sum::<u64>();

    let mut out = Vec::new();
    out.write_all(&ARCHIVE_MAGIC).unwrap();
    out.write_u16::<LittleEndian>(ARCHIVE_VERSION).unwrap();
    out.write_u16::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(entries.len() as u32).unwrap();
    let mut offset = dir_len;
    for ((name, codec, data), bytes) in entries.iter().zip(&stored) {
        out.write_u16::<LittleEndian>(name.len() as u16).unwrap();
        out.write_all(name.as_bytes()).unwrap();
        out.write_u8(codec.tag()).unwrap();
        out.write_u64::<LittleEndian>(offset).unwrap();
        out.write_u64::<LittleEndian>(bytes.len() as u64).unwrap();
        out.write_u64::<LittleEndian>(data.len() as u64).unwrap();
        out.write_u32::<LittleEndian>(crc32fast::hash(bytes)).unwrap();
        offset += bytes.len() as u64;
    }
    for bytes in &stored {
        out.write_all(bytes).unwrap();
    }
    out
}

// ── Binary traces ────────────────────────────────────────────────────────────

pub struct TraceBuilder {
    records:     Vec<(RecordKind, u8, Vec<u8>)>,
    blobs:       Vec<(String, CodecId, Vec<u8>)>,
    frame_index: bool,
    version:     Option<u16>,
}

pub struct BuiltTrace {
    pub bytes:          Vec<u8>,
    /// Offset of every record, in order.
    pub record_offsets: Vec<u64>,
    /// Start of every frame, as a full scan discovers them.
    pub frame_offsets:  Vec<u64>,
    /// `(offset, size)` of the embedded archive, if any.
    pub archive:        Option<(u64, u64)>,
}

impl TraceBuilder {
    pub fn new(records: Vec<(RecordKind, u8, Vec<u8>)>) -> Self {
        Self { records, blobs: Vec::new(), frame_index: false, version: None }
    }

    pub fn blob(mut self, name: &str, codec: CodecId, data: &[u8]) -> Self {
        self.blobs.push((name.to_owned(), codec, data.to_vec()));
        self
    }

    /// Embed a `frame_file_offsets` blob matching the records.
    pub fn with_frame_index(mut self) -> Self {
        self.frame_index = true;
        self
    }

    pub fn version(mut self, version: u16) -> Self {
        self.version = Some(version);
        self
    }

    pub fn build(&self) -> BuiltTrace {
        let mut body = Vec::new();
        let mut record_offsets = Vec::new();
        let mut frame_offsets = vec![SOF_SIZE as u64];
        for (kind, flags, payload) in &self.records {
            record_offsets.push((SOF_SIZE + body.len()) as u64);
            body.extend_from_slice(encode_record(*kind, *flags, payload).as_bytes());
            if *kind == RecordKind::FrameBoundary {
                frame_offsets.push((SOF_SIZE + body.len()) as u64);
            }
        }

        let mut blobs: Vec<(&str, CodecId, Vec<u8>)> =
            self.blobs.iter().map(|(n, c, d)| (n.as_str(), *c, d.clone())).collect();
        let index_bytes: Vec<u8> = frame_offsets.iter().flat_map(|o| o.to_le_bytes()).collect();
        if self.frame_index {
            blobs.push(("frame_file_offsets", CodecId::Zstd, index_bytes));
        }

        let mut sof = StartOfFile::new(trace_uuid());
        sof.pointer_sizes = 8;
        if let Some(v) = self.version {
            sof.version = v;
        }
        let mut archive = None;
        let archive_bytes = if blobs.is_empty() { Vec::new() } else { build_archive(&blobs) };
        if !archive_bytes.is_empty() {
            sof.archive_offset = (SOF_SIZE + body.len()) as u64;
            sof.archive_size = archive_bytes.len() as u64;
            archive = Some((sof.archive_offset, sof.archive_size));
        }

        let mut bytes = Vec::new();
        sof.write(&mut bytes).unwrap();
        bytes.extend_from_slice(&body);
        bytes.extend_from_slice(&archive_bytes);
        BuiltTrace { bytes, record_offsets, frame_offsets, archive }
    }

    pub fn write_to(&self, path: &Path) -> BuiltTrace {
        let built = self.build();
        fs::write(path, &built.bytes).unwrap();
        built
    }
}

// ── JSON traces ──────────────────────────────────────────────────────────────

pub fn packet_json(kind: RecordKind, flags: u8, payload: &[u8]) -> Value {
    if payload.is_empty() {
        json!({ "type": kind.name(), "flags": flags })
    } else {
        json!({ "type": kind.name(), "flags": flags, "payload": hex::encode(payload) })
    }
}

pub fn sof_json(archive_filename: Option<&str>) -> Value {
    let mut sof = json!({ "version": tracefile::sof::FORMAT_VERSION, "pointer_sizes": 8, "uuid": TRACE_UUID });
    if let Some(name) = archive_filename {
        sof["archive_filename"] = json!(name);
    }
    sof
}

/// One document holding every record.
pub fn write_single_json(path: &Path, records: &[(RecordKind, u8, Vec<u8>)], archive_filename: Option<&str>) {
    let doc = json!({
        "sof": sof_json(archive_filename),
        "meta": { "cur_frame": 0, "eof": true, "uuid": TRACE_UUID },
        "packets": records.iter().map(|(k, f, p)| packet_json(*k, *f, p)).collect::<Vec<_>>(),
    });
    fs::write(path, serde_json::to_vec_pretty(&doc).unwrap()).unwrap();
}

/// One document per frame, split after each frame boundary.  Returns the
/// document paths.
pub fn write_numbered_json(dir: &Path, stem: &str, records: &[(RecordKind, u8, Vec<u8>)]) -> Vec<PathBuf> {
    let mut frames: Vec<Vec<Value>> = vec![Vec::new()];
    for (i, (kind, flags, payload)) in records.iter().enumerate() {
        frames.last_mut().unwrap().push(packet_json(*kind, *flags, payload));
        let more = records[i + 1..].iter().any(|(k, _, _)| *k != RecordKind::EndOfStream);
        if *kind == RecordKind::FrameBoundary && more {
            frames.push(Vec::new());
        }
    }

    let last = frames.len() - 1;
    frames
        .into_iter()
        .enumerate()
        .map(|(i, packets)| {
            let eof = u8::from(i == last);
            let mut doc = json!({
                "meta": { "cur_frame": i, "eof": eof, "uuid": TRACE_UUID },
                "packets": packets,
            });
            if i == 0 {
                doc["sof"] = sof_json(None);
            }
            let path = dir.join(format!("{stem}_{i:06}.json"));
            fs::write(&path, serde_json::to_vec(&doc).unwrap()).unwrap();
            path
        })
        .collect()
}

/// Read every record up to and including the end, as `(kind, payload)`.
pub fn drain(stream: &mut dyn tracefile::RecordStream) -> Vec<(RecordKind, Vec<u8>)> {
    let mut out = Vec::new();
    loop {
        let status = stream.read_next_record().unwrap();
        let rec = stream.record();
        out.push((rec.kind(), rec.payload().to_vec()));
        if status == tracefile::ReadStatus::Eof || rec.is_end() {
            return out;
        }
    }
}
