//! Read-only, name-keyed blob stores for side-band trace payloads.
//!
//! A trace reader consults a [`BlobChain`]: an ordered list of stores where the
//! first store holding an id serves it.  Readers put the loose-file directory
//! first and the trace's packed archive second, so a file dropped next to a
//! trace overrides the archived copy without the consumer noticing.
//!
//! Every store is immutable once opened and `Send + Sync`; a chain can be
//! cloned and shared between readers and threads freely.
//!
//! # Blob ids
//! Captured payloads are content addressed:
//! `[prefix]_<blake3, 16 hex digits>_<length>.blob.<ext>` (see
//! [`compute_blob_id`]).  The well-known names below are plain names.

pub mod packed;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use log::warn;

use crate::error::{Result, TraceError};

pub use packed::ArchiveStore;

/// Precomputed frame-offset index of a binary trace.
pub const FRAME_FILE_OFFSETS_BLOB:   &str = "frame_file_offsets";
pub const COMPILER_INFO_BLOB:        &str = "compiler_info.json";
pub const MACHINE_INFO_BLOB:         &str = "machine_info.json";
pub const BACKTRACE_MAP_SYMS_BLOB:   &str = "backtrace_map_syms.json";
pub const BACKTRACE_MAP_ADDRS_BLOB:  &str = "backtrace_map_addrs.json";

// ── Store trait ──────────────────────────────────────────────────────────────

pub trait BlobStore: Send + Sync + fmt::Debug {
    /// Short description for diagnostics.
    fn describe(&self) -> String;
    /// Full contents of `id`, or [`TraceError::BlobNotFound`].
    fn get(&self, id: &str) -> Result<Vec<u8>>;
    fn exists(&self, id: &str) -> bool;
    /// Size of the blob as [`get`](Self::get) would return it.
    fn size(&self, id: &str) -> Result<u64>;
    fn list(&self) -> Result<Vec<String>>;
}

// ── Loose files ──────────────────────────────────────────────────────────────

/// A directory where each blob is a file named by its id.
#[derive(Debug, Clone)]
pub struct LooseFileStore {
    dir: PathBuf,
}

impl LooseFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Ids are single path components; anything that could escape the
    /// directory is treated as absent.
    fn file_for(&self, id: &str) -> Option<PathBuf> {
        let mut components = Path::new(id).components();
        match (components.next(), components.next()) {
            (Some(Component::Normal(_)), None) if !id.contains(['/', '\\']) => Some(self.dir.join(id)),
            _ => None,
        }
    }
}

impl BlobStore for LooseFileStore {
    fn describe(&self) -> String {
        format!("loose files in {}", self.dir.display())
    }

    fn get(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.file_for(id).ok_or_else(|| TraceError::BlobNotFound(id.to_owned()))?;
        match fs::read(&path) {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TraceError::BlobNotFound(id.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    fn exists(&self, id: &str) -> bool {
        self.file_for(id).map(|p| p.is_file()).unwrap_or(false)
    }

    fn size(&self, id: &str) -> Result<u64> {
        let path = self.file_for(id).ok_or_else(|| TraceError::BlobNotFound(id.to_owned()))?;
        match fs::metadata(&path) {
            Ok(m) if m.is_file() => Ok(m.len()),
            Ok(_) => Err(TraceError::BlobNotFound(id.to_owned())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TraceError::BlobNotFound(id.to_owned())),
            Err(e) => Err(e.into()),
        }
    }

    fn list(&self) -> Result<Vec<String>> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut ids = Vec::new();
        for entry in entries {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                if let Some(name) = entry.file_name().to_str() {
                    ids.push(name.to_owned());
                }
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// ── Chain ────────────────────────────────────────────────────────────────────

/// Ordered fallback list of stores.  The first store that has an id wins.
#[derive(Debug, Clone, Default)]
pub struct BlobChain {
    stores: Vec<Arc<dyn BlobStore>>,
}

impl BlobChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, store: Arc<dyn BlobStore>) {
        self.stores.push(store);
    }

    pub fn with(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.push(store);
        self
    }

    pub fn stores(&self) -> &[Arc<dyn BlobStore>] {
        &self.stores
    }

    pub fn is_empty(&self) -> bool {
        self.stores.is_empty()
    }

    /// Fetch `id` from the first store that serves it.  A store that has the
    /// id but fails to read it is logged and skipped.
    pub fn get(&self, id: &str) -> Result<Vec<u8>> {
        for store in &self.stores {
            match store.get(id) {
                Ok(data) => return Ok(data),
                Err(e) if e.is_not_found() => continue,
                Err(e) => warn!("Failed reading blob {id} from {}: {e}", store.describe()),
            }
        }
        Err(TraceError::BlobNotFound(id.to_owned()))
    }

    pub fn exists(&self, id: &str) -> bool {
        self.stores.iter().any(|s| s.exists(id))
    }

    pub fn size(&self, id: &str) -> Result<u64> {
        for store in &self.stores {
            match store.size(id) {
                Ok(size) => return Ok(size),
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            }
        }
        Err(TraceError::BlobNotFound(id.to_owned()))
    }

    /// Union of all stores' ids, sorted, without duplicates.
    pub fn list(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for store in &self.stores {
            ids.extend(store.list()?);
        }
        ids.sort();
        ids.dedup();
        Ok(ids)
    }
}

// ── Blob ids ─────────────────────────────────────────────────────────────────

/// Content-addressed id for `data`.  `ext` may carry a leading dot; an empty
/// extension becomes `raw`.
pub fn compute_blob_id(data: &[u8], prefix: &str, ext: &str) -> String {
    let hash = blake3::hash(data);
    let digest = hex::encode_upper(&hash.as_bytes()[..8]);
    let ext = ext.strip_prefix('.').unwrap_or(ext);
    let ext = if ext.is_empty() { "raw" } else { ext };
    if prefix.is_empty() {
        format!("{digest}_{}.blob.{ext}", data.len())
    } else {
        format!("[{prefix}]_{digest}_{}.blob.{ext}", data.len())
    }
}

/// The bracketed prefix of a blob id, if any.
pub fn blob_id_prefix(id: &str) -> Option<&str> {
    let rest = id.strip_prefix('[')?;
    rest.find(']').map(|end| &rest[..end])
}

pub fn blob_id_extension(id: &str) -> Option<&str> {
    id.rsplit_once('.').map(|(_, ext)| ext).filter(|ext| !ext.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_ids_are_content_addressed() {
        let a = compute_blob_id(b"void main() {}", "fs", ".glsl");
        let b = compute_blob_id(b"void main() {}", "fs", "glsl");
        let c = compute_blob_id(b"void main() { }", "fs", "glsl");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert!(a.starts_with("[fs]_"));
        assert!(a.ends_with("_14.blob.glsl"));
        assert_eq!(blob_id_prefix(&a), Some("fs"));
        assert_eq!(blob_id_extension(&a), Some("glsl"));

        let plain = compute_blob_id(&[], "", "");
        assert_eq!(blob_id_prefix(&plain), None);
        assert_eq!(blob_id_extension(&plain), Some("raw"));
    }

    #[test]
    fn loose_store_rejects_escaping_ids() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.bin"), b"abc").unwrap();
        let store = LooseFileStore::new(dir.path());

        assert_eq!(store.get("a.bin").unwrap(), b"abc");
        assert_eq!(store.size("a.bin").unwrap(), 3);
        for id in ["../a.bin", "sub/a.bin", "..", "", "/etc/passwd"] {
            assert!(!store.exists(id), "{id}");
            assert!(store.get(id).unwrap_err().is_not_found(), "{id}");
        }
        assert_eq!(store.list().unwrap(), vec!["a.bin".to_string()]);
    }

    #[test]
    fn chain_prefers_earlier_stores() {
        let first = tempfile::tempdir().unwrap();
        let second = tempfile::tempdir().unwrap();
        fs::write(first.path().join("shared"), b"override").unwrap();
        fs::write(second.path().join("shared"), b"original").unwrap();
        fs::write(second.path().join("only_second"), b"2").unwrap();

        let chain = BlobChain::new()
            .with(Arc::new(LooseFileStore::new(first.path())))
            .with(Arc::new(LooseFileStore::new(second.path())));

        assert_eq!(chain.get("shared").unwrap(), b"override");
        assert_eq!(chain.get("only_second").unwrap(), b"2");
        assert!(chain.exists("only_second"));
        assert!(!chain.exists("missing"));
        assert!(matches!(chain.get("missing"), Err(TraceError::BlobNotFound(_))));
        assert_eq!(chain.list().unwrap(), vec!["only_second".to_string(), "shared".to_string()]);
    }

    #[test]
    fn missing_directory_lists_nothing() {
        let store = LooseFileStore::new("/nonexistent/trace/blobs");
        assert!(store.list().unwrap().is_empty());
        assert!(!store.exists("x"));
    }
}
