pub mod error;
pub mod options;
pub mod record;
pub mod sof;
pub mod codec;
pub mod blob;
pub mod stream;

pub use error::{Corruption, OpenFailure, Result, TraceError};
pub use options::ReaderOptions;
pub use record::{Record, RecordBuf, RecordHeader, RecordKind};
pub use sof::StartOfFile;
pub use codec::{CodecId, get_codec};
pub use blob::{ArchiveStore, BlobChain, BlobStore, LooseFileStore, compute_blob_id};
pub use stream::{
    BinaryRecordStream, JsonRecordStream, ReadStatus, RecordBatch, RecordStream, ScopedLocation, TraceFormat,
    detect_format, is_multiframe_json_filename, open_trace,
};
