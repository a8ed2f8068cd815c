//! Named FIFO endpoints.
//!
//! ## Open Ordering
//!
//! A FIFO opened with `O_WRONLY | O_NONBLOCK` fails with `ENXIO` while no
//! reader has it open, and a blocking write-open would hang indefinitely.
//! Endpoints therefore defer the OS open:
//!
//! - [`NamedPipeReader`] (container writes, host reads) opens non-blocking
//!   immediately; this always succeeds.
//! - [`NamedPipeWriter`] (host writes, container reads) retries its open on
//!   every loop pass and reports [`PollHandle::NotReady`] until the
//!   container has opened its end.

use super::{Chunk, PollHandle, Reader, Writer, read_file, write_file};
use crate::constants::FIFO_MODE;
use crate::error::{Error, Result};
use std::ffi::CString;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// A FIFO on the host filesystem plus its (lazily opened) descriptor.
#[derive(Debug)]
pub struct NamedPipe {
    path: PathBuf,
    file: Option<File>,
    remove_on_close: bool,
}

impl NamedPipe {
    /// Creates the FIFO at `path`.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| {
            Error::PipeCreateFailed {
                path: path.clone(),
                reason: e.to_string(),
            }
        })?;

        // SAFETY: `c_path` is a NUL-terminated CString that outlives the call.
        let result = unsafe { libc::mkfifo(c_path.as_ptr(), FIFO_MODE as libc::mode_t) };
        if result != 0 {
            return Err(Error::PipeCreateFailed {
                path,
                reason: io::Error::last_os_error().to_string(),
            });
        }

        debug!("Created named pipe: {}", path.display());
        Ok(Self {
            path,
            file: None,
            remove_on_close: false,
        })
    }

    /// Unlinks the FIFO when it is closed.
    ///
    /// FIFOs created inside a temporary volume are removed with the volume;
    /// this is for FIFOs placed in caller-owned directories.
    #[must_use]
    pub fn remove_on_close(mut self) -> Self {
        self.remove_on_close = true;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Opens the FIFO non-blocking for reading or writing.
    ///
    /// Returns `Ok(false)` if a write-open found no reader yet.
    fn open(&mut self, write: bool) -> Result<bool> {
        if self.file.is_some() {
            return Ok(true);
        }

        let meta = match std::fs::metadata(&self.path) {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(Error::PipeMissing(self.path.clone()));
            }
            Err(e) => return Err(e.into()),
        };
        if !meta.file_type().is_fifo() {
            return Err(Error::NotAFifo(self.path.clone()));
        }

        let mut options = OpenOptions::new();
        if write {
            options.write(true);
        } else {
            options.read(true);
        }
        options.custom_flags(libc::O_NONBLOCK);

        match options.open(&self.path) {
            Ok(file) => {
                self.file = Some(file);
                Ok(true)
            }
            Err(e) if write && e.raw_os_error() == Some(libc::ENXIO) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn poll_handle(&self) -> PollHandle {
        match &self.file {
            Some(file) => PollHandle::Fd(file.as_raw_fd()),
            None => PollHandle::NotReady,
        }
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        if self.remove_on_close {
            self.remove_on_close = false;
            if let Err(e) = std::fs::remove_file(&self.path)
                && e.kind() != io::ErrorKind::NotFound
            {
                warn!("Failed to remove pipe {}: {}", self.path.display(), e);
            }
        }
        Ok(())
    }
}

/// Host-side read end of a FIFO the container writes to.
#[derive(Debug)]
pub struct NamedPipeReader {
    pipe: NamedPipe,
    container_path: Option<String>,
}

impl NamedPipeReader {
    pub fn new(pipe: NamedPipe, container_path: Option<String>) -> Self {
        Self {
            pipe,
            container_path,
        }
    }

    pub fn pipe(&self) -> &NamedPipe {
        &self.pipe
    }
}

impl Reader for NamedPipeReader {
    fn poll_handle(&self) -> PollHandle {
        self.pipe.poll_handle()
    }

    fn open(&mut self) -> Result<()> {
        self.pipe.open(false).map(|_| ())
    }

    fn read(&mut self, max: usize) -> Result<Chunk> {
        match self.pipe.file.as_mut() {
            Some(file) => read_file(file, max),
            None => Ok(Chunk::Pending),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pipe.close()
    }

    fn container_arg(&self) -> Option<&str> {
        self.container_path.as_deref()
    }
}

/// Host-side write end of a FIFO the container reads from.
#[derive(Debug)]
pub struct NamedPipeWriter {
    pipe: NamedPipe,
    container_path: Option<String>,
}

impl NamedPipeWriter {
    pub fn new(pipe: NamedPipe, container_path: Option<String>) -> Self {
        Self {
            pipe,
            container_path,
        }
    }

    pub fn pipe(&self) -> &NamedPipe {
        &self.pipe
    }
}

impl Writer for NamedPipeWriter {
    fn poll_handle(&self) -> PollHandle {
        self.pipe.poll_handle()
    }

    fn open(&mut self) -> Result<()> {
        if self.pipe.open(true)? {
            debug!("Opened input pipe for writing: {}", self.pipe.path.display());
        }
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.pipe.is_open()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.pipe.file.as_mut() {
            Some(file) => write_file(file, buf),
            None => Ok(0),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.pipe.close()
    }

    fn container_arg(&self) -> Option<&str> {
        self.container_path.as_deref()
    }
}
