//! Stream adapters.
//!
//! Adapters are the semantic endpoints a task's bindings resolve to. Push
//! adapters consume bytes drained from the container; fetch adapters produce
//! bytes that feed it.
//!
//! | Adapter | Kind | Used for |
//! |---------|------|----------|
//! | [`AccumulateAdapter`] | push | non-streaming `_stdout`/`_stderr` |
//! | [`ProgressAdapter`] | push | the `.progress` pipe |
//! | [`StdStreamWriter`] | push | unbound container stdout/stderr |
//! | [`MemoryReader`] | fetch | non-streaming `_stdin` |
//! | [`AdapterFactory`] | both | streaming bindings |
//! | [`ChunkedUploadWriter`] | push | streaming outputs bound to a `url` |
//!
//! [`StdStreamWriter`]: crate::stream::StdStreamWriter
//! [`MemoryReader`]: crate::stream::MemoryReader
//! [`ChunkedUploadWriter`]: crate::stream::ChunkedUploadWriter

use crate::constants::MAX_PROGRESS_LINE_LEN;
use crate::error::{Error, Result};
use crate::stream::{
    ChunkedUploadWriter, FdReader, FdWriter, MemoryReader, PollHandle, Reader, Writer,
};
use crate::task::{InputBinding, OutputBinding};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, trace, warn};

// =============================================================================
// Accumulate
// =============================================================================

/// Shared map that accumulate adapters append into, keyed by binding id.
pub type OutputMap = Arc<Mutex<BTreeMap<String, Vec<u8>>>>;

/// Appends every chunk written to it under a fixed key of an [`OutputMap`].
///
/// The key is inserted (empty) on construction, so a binding whose stream
/// produced nothing still yields an entry.
#[derive(Debug, Clone)]
pub struct AccumulateAdapter {
    map: OutputMap,
    key: String,
}

impl AccumulateAdapter {
    pub fn new(map: OutputMap, key: impl Into<String>) -> Self {
        let key = key.into();
        map.lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_default();
        Self { map, key }
    }

    pub fn key(&self) -> &str {
        &self.key
    }
}

impl Writer for AccumulateAdapter {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::Always
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.map
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(self.key.clone())
            .or_default()
            .extend_from_slice(buf);
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

// =============================================================================
// Progress
// =============================================================================

/// One structured progress report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProgressUpdate {
    pub total: Option<f64>,
    pub current: Option<f64>,
    pub message: Option<String>,
}

/// Receives progress reports. Implemented by the job/coordinator layer.
pub trait ProgressSink: Send + Sync {
    fn update_progress(&self, update: ProgressUpdate);
}

/// Parses line-delimited JSON progress documents.
///
/// Each complete line that parses as a JSON object is forwarded to the sink
/// as a [`ProgressUpdate`]. Malformed lines and non-object documents are
/// dropped. A line longer than [`MAX_PROGRESS_LINE_LEN`] is discarded up to
/// its terminating newline. A trailing partial line is dropped on close.
pub struct ProgressAdapter {
    sink: Arc<dyn ProgressSink>,
    buf: Vec<u8>,
    discarding: bool,
}

impl ProgressAdapter {
    pub fn new(sink: Arc<dyn ProgressSink>) -> Self {
        Self {
            sink,
            buf: Vec::new(),
            discarding: false,
        }
    }

    fn parse_line(&self, line: &[u8]) {
        let doc: serde_json::Value = match serde_json::from_slice(line) {
            Ok(doc) => doc,
            Err(e) => {
                trace!("Dropping malformed progress line: {}", e);
                return;
            }
        };
        let Some(fields) = doc.as_object() else {
            trace!("Dropping non-object progress document");
            return;
        };

        self.sink.update_progress(ProgressUpdate {
            total: fields.get("total").and_then(serde_json::Value::as_f64),
            current: fields.get("current").and_then(serde_json::Value::as_f64),
            message: fields
                .get("message")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
        });
    }
}

impl std::fmt::Debug for ProgressAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressAdapter")
            .field("buffered", &self.buf.len())
            .field("discarding", &self.discarding)
            .finish_non_exhaustive()
    }
}

impl Writer for ProgressAdapter {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::Always
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        let mut rest = buf;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let (segment, tail) = rest.split_at(pos);
            rest = &tail[1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.is_empty() {
                self.parse_line(segment);
            } else {
                self.buf.extend_from_slice(segment);
                let line = std::mem::take(&mut self.buf);
                self.parse_line(&line);
            }
        }

        if !self.discarding {
            self.buf.extend_from_slice(rest);
            if self.buf.len() > MAX_PROGRESS_LINE_LEN {
                warn!(
                    "Progress line exceeds {} bytes, discarding",
                    MAX_PROGRESS_LINE_LEN
                );
                self.buf.clear();
                self.discarding = true;
            }
        }
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        self.buf.clear();
        self.discarding = false;
        Ok(())
    }
}

// =============================================================================
// Adapter Factory
// =============================================================================

/// Builds adapters for streaming bindings.
///
/// A streaming input's fetch adapter feeds its FIFO; a streaming output's
/// push adapter drains one. The binding's `mode` selects the data source or
/// sink; implementations reject modes they do not serve with
/// [`Error::InvalidBinding`].
pub trait AdapterFactory: Send + Sync {
    fn fetch_adapter(&self, id: &str, binding: &InputBinding) -> Result<Box<dyn Reader>>;

    fn push_adapter(&self, id: &str, binding: &OutputBinding) -> Result<Box<dyn Writer>>;
}

/// Serves `inline` data and `local` host files, and pushes to `url`
/// endpoints with a chunked upload.
#[derive(Debug, Clone, Copy, Default)]
pub struct LocalAdapterFactory;

impl LocalAdapterFactory {
    pub const INLINE: &'static str = "inline";
    pub const LOCAL: &'static str = "local";
    pub const URL: &'static str = "url";
}

impl AdapterFactory for LocalAdapterFactory {
    fn fetch_adapter(&self, id: &str, binding: &InputBinding) -> Result<Box<dyn Reader>> {
        match binding.mode.as_str() {
            Self::INLINE => {
                let data = binding.inline_bytes().unwrap_or_default();
                debug!(binding = %id, len = data.len(), "Streaming inline input");
                Ok(Box::new(MemoryReader::new(data)))
            }
            Self::LOCAL => {
                let path = binding.path.as_ref().ok_or_else(|| Error::InvalidBinding {
                    id: id.to_string(),
                    reason: "local binding has no path".into(),
                })?;
                debug!(binding = %id, path = %path.display(), "Streaming local input");
                Ok(Box::new(FdReader::open_path(path)?))
            }
            other => Err(Error::InvalidBinding {
                id: id.to_string(),
                reason: format!("unsupported fetch mode '{other}'"),
            }),
        }
    }

    fn push_adapter(&self, id: &str, binding: &OutputBinding) -> Result<Box<dyn Writer>> {
        match binding.mode.as_str() {
            Self::LOCAL => {
                let path = binding.path.as_ref().ok_or_else(|| Error::InvalidBinding {
                    id: id.to_string(),
                    reason: "local binding has no path".into(),
                })?;
                debug!(binding = %id, path = %path.display(), "Streaming local output");
                Ok(Box::new(FdWriter::create_path(path)?))
            }
            Self::URL => {
                let url = binding.url.as_deref().ok_or_else(|| Error::InvalidBinding {
                    id: id.to_string(),
                    reason: "url binding has no url".into(),
                })?;
                debug!(binding = %id, url = %url, "Streaming output to url");
                Ok(Box::new(ChunkedUploadWriter::new(url, &binding.headers)?))
            }
            other => Err(Error::InvalidBinding {
                id: id.to_string(),
                reason: format!("unsupported push mode '{other}'"),
            }),
        }
    }
}
