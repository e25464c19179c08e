use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default upper bound on a single record: 256 MiB.
pub const DEFAULT_MAX_RECORD_SIZE:   u32      = 256 * 1024 * 1024;
pub const DEFAULT_JSON_READ_RETRIES: u32      = 5;
pub const DEFAULT_JSON_RETRY_DELAY:  Duration = Duration::from_millis(500);

/// Configuration for opening a trace.
#[derive(Debug, Clone)]
pub struct ReaderOptions {
    /// Directory served by the loose-file blob store.  `None` means the
    /// directory containing the trace file.
    pub loose_file_path:   Option<PathBuf>,
    /// Headers declaring a larger total size are treated as corrupt.
    pub max_record_size:   u32,
    /// When `false`, a precomputed frame-offset index is ignored and frame
    /// boundaries are discovered by scanning.
    pub use_frame_index:   bool,
    /// A structured document that fails to parse is re-read this many times
    /// in case the capturing process is still writing it.
    pub json_read_retries: u32,
    pub json_retry_delay:  Duration,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            loose_file_path:   None,
            max_record_size:   DEFAULT_MAX_RECORD_SIZE,
            use_frame_index:   true,
            json_read_retries: DEFAULT_JSON_READ_RETRIES,
            json_retry_delay:  DEFAULT_JSON_RETRY_DELAY,
        }
    }
}

impl ReaderOptions {
    pub fn with_loose_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.loose_file_path = Some(path.into());
        self
    }

    pub fn with_max_record_size(mut self, size: u32) -> Self {
        self.max_record_size = size;
        self
    }

    pub fn with_frame_index(mut self, enabled: bool) -> Self {
        self.use_frame_index = enabled;
        self
    }

    pub fn with_json_retries(mut self, retries: u32, delay: Duration) -> Self {
        self.json_read_retries = retries;
        self.json_retry_delay = delay;
        self
    }

    /// Directory for the loose-file store of the trace at `trace_path`.
    pub fn loose_dir_for(&self, trace_path: &Path) -> PathBuf {
        match &self.loose_file_path {
            Some(p) if !p.as_os_str().is_empty() => p.clone(),
            _ => trace_path
                .parent()
                .filter(|p| !p.as_os_str().is_empty())
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from(".")),
        }
    }
}
