//! Descriptor-backed readers and writers.

use super::{Chunk, PollHandle, Reader, Writer, read_file, set_nonblocking, write_file};
use crate::error::Result;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::fd::{AsRawFd, OwnedFd};
use std::path::Path;

/// Reads from an owned OS descriptor (socket, pipe or regular file).
#[derive(Debug)]
pub struct FdReader {
    file: Option<File>,
}

impl FdReader {
    /// Wraps a descriptor as-is.
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
        }
    }

    /// Wraps a descriptor after switching it to non-blocking mode.
    pub fn nonblocking(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self::new(fd))
    }

    /// Opens a host file for reading.
    pub fn open_path(path: &Path) -> Result<Self> {
        Ok(Self {
            file: Some(File::open(path)?),
        })
    }
}

impl Reader for FdReader {
    fn poll_handle(&self) -> PollHandle {
        match &self.file {
            Some(file) => PollHandle::Fd(file.as_raw_fd()),
            None => PollHandle::NotReady,
        }
    }

    fn read(&mut self, max: usize) -> Result<Chunk> {
        match self.file.as_mut() {
            Some(file) => read_file(file, max),
            None => Ok(Chunk::Eof),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }
}

/// Writes to an owned OS descriptor.
#[derive(Debug)]
pub struct FdWriter {
    file: Option<File>,
}

impl FdWriter {
    /// Wraps a descriptor as-is.
    pub fn new(fd: OwnedFd) -> Self {
        Self {
            file: Some(File::from(fd)),
        }
    }

    /// Wraps a descriptor after switching it to non-blocking mode.
    pub fn nonblocking(fd: OwnedFd) -> Result<Self> {
        set_nonblocking(fd.as_raw_fd())?;
        Ok(Self::new(fd))
    }

    /// Creates (or truncates) a host file for writing.
    pub fn create_path(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file: Some(file) })
    }
}

impl Writer for FdWriter {
    fn poll_handle(&self) -> PollHandle {
        match &self.file {
            Some(file) => PollHandle::Fd(file.as_raw_fd()),
            None => PollHandle::NotReady,
        }
    }

    fn is_open(&self) -> bool {
        self.file.is_some()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.file.as_mut() {
            Some(file) => write_file(file, buf),
            None => Err(std::io::Error::from(std::io::ErrorKind::NotConnected).into()),
        }
    }

    fn close(&mut self) -> Result<()> {
        self.file.take();
        Ok(())
    }
}

/// One of the host process's standard output streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostStream {
    Stdout,
    Stderr,
}

/// Forwards bytes to the host's stdout or stderr.
///
/// Closing is a no-op: the host streams outlive any single run.
#[derive(Debug, Clone, Copy)]
pub struct StdStreamWriter {
    stream: HostStream,
}

impl StdStreamWriter {
    pub fn new(stream: HostStream) -> Self {
        Self { stream }
    }

    pub fn stdout() -> Self {
        Self::new(HostStream::Stdout)
    }

    pub fn stderr() -> Self {
        Self::new(HostStream::Stderr)
    }

    pub fn stream(&self) -> HostStream {
        self.stream
    }
}

impl Writer for StdStreamWriter {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::Always
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        match self.stream {
            HostStream::Stdout => {
                let mut out = std::io::stdout().lock();
                out.write_all(buf)?;
                out.flush()?;
            }
            HostStream::Stderr => {
                let mut err = std::io::stderr().lock();
                err.write_all(buf)?;
                err.flush()?;
            }
        }
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
