//! Error taxonomy for trace readers.
//!
//! Record-level corruption is reported as [`TraceError::CorruptRecord`] but
//! never leaves a stream in an undefined state: the stream's current record is
//! replaced by a synthetic end-of-stream record first, so a caller that ignores
//! the error still stops cleanly.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TraceError>;

#[derive(Error, Debug)]
pub enum TraceError {
    #[error("Cannot open trace {}: {reason}", path.display())]
    Open { path: PathBuf, reason: OpenFailure },

    #[error("Corrupt record at offset {offset}: {fault}")]
    CorruptRecord { offset: u64, fault: Corruption },

    #[error("Cannot seek to frame {requested}, max valid frame index is {max}")]
    SeekOutOfRange { requested: u32, max: u32 },

    /// Expected for optional side-band blobs; not a failure of the trace.
    #[error("Blob not found: {0}")]
    BlobNotFound(String),

    #[error("Blob {id} is corrupt: {reason}")]
    CorruptBlob { id: String, reason: String },

    #[error("Document {} declares frame {found}, expected frame {expected}", path.display())]
    BackendMismatch { path: PathBuf, expected: u32, found: i64 },

    #[error("Invalid packet node {index} in {}: {reason}", path.display())]
    InvalidNode { path: PathBuf, index: usize, reason: String },

    #[error("Failed deserializing JSON file {}: {source}", path.display())]
    Json { path: PathBuf, source: serde_json::Error },

    #[error("Trace stream is not open")]
    NotOpen,

    #[error("Location stack is empty")]
    LocationStackEmpty,

    #[error("Operation cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl TraceError {
    pub(crate) fn open(path: impl Into<PathBuf>, reason: OpenFailure) -> Self {
        TraceError::Open { path: path.into(), reason }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, TraceError::BlobNotFound(_))
    }
}

/// Why `open()` refused a trace.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum OpenFailure {
    #[error("file not found")]
    Missing,
    #[error("unable to determine trace file type")]
    UnknownFormat,
    #[error("bad start-of-file descriptor ({0})")]
    BadDescriptor(String),
    #[error("malformed document ({0})")]
    BadDocument(String),
    #[error("trace file version 0x{found:04X} is not supported, expected at least 0x{minimum:04X}")]
    IncompatibleVersion { found: u16, minimum: u16 },
    #[error("failed reading in-trace archive ({0})")]
    Archive(String),
}

/// Structural fault found while framing a binary record.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Corruption {
    #[error("bad record prefix 0x{found:08X}")]
    BadMagic { found: u32 },
    #[error("unknown record kind {0}")]
    UnknownKind(u8),
    #[error("declared size {declared} outside the valid range (limit {limit})")]
    BadSize { declared: u32, limit: u64 },
    #[error("CRC32 mismatch (stored 0x{stored:08X}, computed 0x{computed:08X})")]
    ChecksumMismatch { stored: u32, computed: u32 },
    #[error("truncated record (wanted {wanted} bytes, got {got} bytes)")]
    Truncated { wanted: u64, got: u64 },
}
