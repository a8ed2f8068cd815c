//! Byte source and sink primitives.
//!
//! Every endpoint the multiplexing loop drives is either a [`Reader`] (a
//! source of bytes) or a [`Writer`] (a sink). Concrete variants:
//!
//! | Variant | Reader | Writer | Poll handle |
//! |---------|--------|--------|-------------|
//! | Raw descriptor (socket, pipe, file) | [`FdReader`] | [`FdWriter`] | `Fd` |
//! | Named FIFO | [`NamedPipeReader`] | [`NamedPipeWriter`] | `Fd` once opened, `NotReady` before |
//! | In-memory buffer | [`MemoryReader`] | - | `Always` |
//! | Host stdout/stderr | - | [`StdStreamWriter`] | `Always` |
//! | HTTP endpoint (chunked upload) | - | [`ChunkedUploadWriter`] | `Always` |
//! | Adapters ([`crate::adapters`], [`crate::demux`]) | - | yes | `Always` |
//!
//! Endpoints without an OS descriptor report [`PollHandle::Always`] and are
//! treated as ready without going through `poll(2)`.
//!
//! Writers never block: a descriptor-backed writer whose sink is full accepts
//! zero bytes, and the connector holds the rest until the sink drains.

mod fd;
mod fifo;
mod http;
mod memory;

pub use fd::{FdReader, FdWriter, HostStream, StdStreamWriter};
pub use fifo::{NamedPipe, NamedPipeReader, NamedPipeWriter};
pub use http::ChunkedUploadWriter;
pub use memory::MemoryReader;

use crate::error::Result;
use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::RawFd;

/// Outcome of a single read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Chunk {
    /// Bytes were read.
    Data(Vec<u8>),
    /// No bytes are available right now, but the source is still open.
    Pending,
    /// The source is exhausted.
    Eof,
}

/// How the multiplexing loop should wait on an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollHandle {
    /// Wait for readiness on this descriptor.
    Fd(RawFd),
    /// No descriptor; the endpoint never blocks and is always ready.
    Always,
    /// Not open yet; skip it this pass.
    NotReady,
}

/// A source of bytes.
pub trait Reader: Send {
    /// Returns what the loop should poll for this reader.
    fn poll_handle(&self) -> PollHandle;

    /// Opens the underlying resource. Must be idempotent.
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Reads at most `max` bytes.
    fn read(&mut self, max: usize) -> Result<Chunk>;

    /// Releases the underlying resource.
    fn close(&mut self) -> Result<()>;

    /// Path under which the container sees this endpoint, if any.
    fn container_arg(&self) -> Option<&str> {
        None
    }
}

/// A sink for bytes.
pub trait Writer: Send {
    /// Returns what the loop should poll for this writer.
    fn poll_handle(&self) -> PollHandle;

    /// Opens the underlying resource. Must be idempotent; a writer that
    /// cannot be opened yet stays closed and reports [`PollHandle::NotReady`].
    fn open(&mut self) -> Result<()> {
        Ok(())
    }

    /// Returns true once the writer accepts data.
    fn is_open(&self) -> bool {
        true
    }

    /// Writes some prefix of `buf`, returning how many bytes were accepted.
    ///
    /// Non-blocking writers return `Ok(0)` when the sink is full.
    fn write(&mut self, buf: &[u8]) -> Result<usize>;

    /// Releases the underlying resource.
    fn close(&mut self) -> Result<()>;

    /// Path under which the container sees this endpoint, if any.
    fn container_arg(&self) -> Option<&str> {
        None
    }
}

/// Sets `O_NONBLOCK` on a descriptor.
pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    // SAFETY: F_GETFL only reads descriptor flags; an invalid fd yields EBADF.
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    // SAFETY: F_SETFL with an int argument touches no caller memory.
    let result = unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) };
    if result < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn read_file(file: &mut File, max: usize) -> Result<Chunk> {
    let mut buf = vec![0u8; max];
    loop {
        match file.read(&mut buf) {
            Ok(0) => return Ok(Chunk::Eof),
            Ok(n) => {
                buf.truncate(n);
                return Ok(Chunk::Data(buf));
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(Chunk::Pending),
            Err(e) => return Err(e.into()),
        }
    }
}

pub(crate) fn write_file(file: &mut File, buf: &[u8]) -> Result<usize> {
    loop {
        match file.write(buf) {
            Ok(n) => return Ok(n),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(0),
            Err(e) => return Err(e.into()),
        }
    }
}
