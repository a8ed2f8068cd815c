//! Stream connectors.
//!
//! A [`StreamConnector`] pairs one [`Reader`] with one [`Writer`] and moves
//! bytes between them one bounded step at a time. Its direction decides
//! which side the multiplexing loop waits on:
//!
//! ```text
//!  Direction::Read   (container → host)      Direction::Write  (host → container)
//!
//!  ┌────────────┐ polled  ┌──────────┐       ┌──────────┐  polled ┌────────────┐
//!  │ FIFO/socket├────────►│ adapter  │       │ adapter  ├────────►│ FIFO/socket│
//!  │  (input)   │ POLLIN  │ (output) │       │ (input)  │ POLLOUT │  (output)  │
//!  └────────────┘         └──────────┘       └──────────┘         └────────────┘
//! ```
//!
//! ## Lifecycle
//!
//! `open()` opens the input side, then the output side. For write connectors
//! the output is usually a FIFO the container has not opened yet, so `open()`
//! is retried by the loop until [`StreamConnector::is_open`] turns true.
//! `close()` closes the output side first, then the input side, exactly
//! once no matter how often it is called.
//!
//! ## Backpressure
//!
//! Bytes the output does not accept stay buffered in the connector. While
//! a read connector holds such bytes it stops reading and waits on its
//! output for `POLLOUT` instead, so a slow sink never blocks the loop.

use crate::constants::CHUNK_SIZE;
use crate::error::{Error, Result};
use crate::stream::{Chunk, PollHandle, Reader, Writer};
use tracing::{debug, warn};

/// Which side of the connector the loop polls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Poll the input for readability; push whatever arrives to the output.
    Read,
    /// Poll the output for writability; pull from the input to fill it.
    Write,
}

/// Outcome of one transfer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// The connector is still live; `n` bytes were delivered.
    Progress(usize),
    /// The input is exhausted (or the output went away); the connector has
    /// been closed.
    Finished,
}

/// One reader bound to one writer.
pub struct StreamConnector {
    input: Box<dyn Reader>,
    output: Box<dyn Writer>,
    direction: Direction,
    chunk_size: usize,
    /// Bytes read but not yet accepted by the output.
    pending: Vec<u8>,
    closed: bool,
}

impl StreamConnector {
    /// Creates a connector that drains `input` (a container-facing source)
    /// into `output`.
    pub fn reader(input: Box<dyn Reader>, output: Box<dyn Writer>) -> Self {
        Self::new(input, output, Direction::Read)
    }

    /// Creates a connector that feeds `output` (a container-facing sink)
    /// from `input`.
    pub fn writer(input: Box<dyn Reader>, output: Box<dyn Writer>) -> Self {
        Self::new(input, output, Direction::Write)
    }

    fn new(input: Box<dyn Reader>, output: Box<dyn Writer>, direction: Direction) -> Self {
        Self {
            input,
            output,
            direction,
            chunk_size: CHUNK_SIZE,
            pending: Vec::new(),
            closed: false,
        }
    }

    /// Sets the per-step transfer ceiling.
    #[must_use]
    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size.max(1);
        self
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Returns true once the polled side accepts traffic.
    pub fn is_open(&self) -> bool {
        !self.closed && (self.direction == Direction::Read || self.output.is_open())
    }

    /// Returns true while the connector holds bytes its output has not
    /// accepted yet.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// True when the loop should wait for the output to drain rather than
    /// for the input to produce.
    pub fn waits_on_output(&self) -> bool {
        self.direction == Direction::Write || self.has_pending()
    }

    /// What the loop should wait on for this connector.
    pub fn poll_handle(&self) -> PollHandle {
        if self.closed {
            return PollHandle::NotReady;
        }
        if !self.waits_on_output() {
            return self.input.poll_handle();
        }
        if self.output.is_open() {
            self.output.poll_handle()
        } else {
            PollHandle::NotReady
        }
    }

    /// Path the container should be given to reach this connector's
    /// container-facing side.
    pub fn container_arg(&self) -> Option<&str> {
        match self.direction {
            Direction::Read => self.input.container_arg(),
            Direction::Write => self.output.container_arg(),
        }
    }

    /// Opens the input side, then the output side. Idempotent.
    pub fn open(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.input.open()?;
        self.output.open()
    }

    /// Performs one bounded transfer.
    pub fn step(&mut self) -> Result<Step> {
        if self.closed {
            return Ok(Step::Finished);
        }
        match self.direction {
            Direction::Read => self.read_step(),
            Direction::Write => self.write_step(),
        }
    }

    fn read_step(&mut self) -> Result<Step> {
        if self.pending.is_empty() {
            match self.input.read(self.chunk_size)? {
                Chunk::Data(buf) => self.pending = buf,
                Chunk::Pending => return Ok(Step::Progress(0)),
                Chunk::Eof => {
                    self.close()?;
                    return Ok(Step::Finished);
                }
            }
        }

        let n = self.output.write(&self.pending)?;
        self.pending.drain(..n);
        Ok(Step::Progress(n))
    }

    fn write_step(&mut self) -> Result<Step> {
        if self.pending.is_empty() {
            match self.input.read(self.chunk_size)? {
                Chunk::Data(buf) => self.pending = buf,
                Chunk::Pending => return Ok(Step::Progress(0)),
                Chunk::Eof => {
                    self.close()?;
                    return Ok(Step::Finished);
                }
            }
        }

        match self.output.write(&self.pending) {
            Ok(n) => {
                self.pending.drain(..n);
                Ok(Step::Progress(n))
            }
            Err(Error::Io(e)) if e.kind() == std::io::ErrorKind::BrokenPipe => {
                // The container closed its read end before consuming all input.
                warn!(
                    unsent = self.pending.len(),
                    path = self.output.container_arg().unwrap_or("-"),
                    "Input consumer went away, dropping remaining data"
                );
                self.pending.clear();
                self.close()?;
                Ok(Step::Finished)
            }
            Err(e) => Err(e),
        }
    }

    /// Closes the output side, then the input side. Only the first call has
    /// any effect. Both sides are closed even if the first close fails.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if !self.pending.is_empty() {
            warn!(
                direction = ?self.direction,
                unsent = self.pending.len(),
                "Closing stream connector with undelivered data"
            );
            self.pending.clear();
        }
        debug!(direction = ?self.direction, "Closing stream connector");
        let output = self.output.close();
        let input = self.input.close();
        output.and(input)
    }
}

impl std::fmt::Debug for StreamConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamConnector")
            .field("direction", &self.direction)
            .field("chunk_size", &self.chunk_size)
            .field("pending", &self.pending.len())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
