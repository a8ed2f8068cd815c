//! Container stdio frame demultiplexer.
//!
//! When a container's output streams are attached over a single channel,
//! the runtime interleaves them as a sequence of frames:
//!
//! ```text
//! ┌────────┬─────────────┬──────────────────────┬───────────────────┐
//! │ type:1 │ reserved:3  │ length:4 (big-endian)│ payload: length   │
//! └────────┴─────────────┴──────────────────────┴───────────────────┘
//!  0        1             4                      8
//! ```
//!
//! There is no terminator frame; end-of-stream is the transport closing.
//!
//! [`Demultiplexer`] is itself a [`Writer`]: the connector feeds it whatever
//! chunk the socket returned, and it forwards payload bytes to the wrapped
//! downstream writer. Chunk boundaries are arbitrary. One `write` call may
//! carry a fraction of a header, a header plus partial payload, or several
//! complete frames.
//!
//! When the downstream accepts only part of a payload, `write` reports how
//! much of the chunk it consumed; the connector re-offers the rest later.

use crate::constants::FRAME_HEADER_LEN;
use crate::error::Result;
use crate::stream::{PollHandle, Writer};
use tracing::trace;

/// Stream tag carried in byte 0 of a frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamType {
    Stdin,
    Stdout,
    Stderr,
    /// A tag outside the documented range; its payload is still forwarded.
    Other(u8),
}

impl From<u8> for StreamType {
    fn from(tag: u8) -> Self {
        match tag {
            0 => Self::Stdin,
            1 => Self::Stdout,
            2 => Self::Stderr,
            other => Self::Other(other),
        }
    }
}

impl From<StreamType> for u8 {
    fn from(stream: StreamType) -> Self {
        match stream {
            StreamType::Stdin => 0,
            StreamType::Stdout => 1,
            StreamType::Stderr => 2,
            StreamType::Other(tag) => tag,
        }
    }
}

/// Decodes a framed stdio stream into its payload bytes.
///
/// State is `(header, payload_remaining)`:
///
/// - `payload_remaining == None`: awaiting header; `header.len() < 8`.
/// - `payload_remaining == Some(n)`: forwarding the next `n` payload bytes.
///
/// One downstream per instance, so the type byte tags the frame for logging
/// but does not route it.
pub struct Demultiplexer {
    downstream: Box<dyn Writer>,
    header: Vec<u8>,
    payload_remaining: Option<usize>,
    current: Option<StreamType>,
}

impl Demultiplexer {
    pub fn new(downstream: Box<dyn Writer>) -> Self {
        Self {
            downstream,
            header: Vec::with_capacity(FRAME_HEADER_LEN),
            payload_remaining: None,
            current: None,
        }
    }

    /// Returns true between frames, with no partial header buffered.
    pub fn is_idle(&self) -> bool {
        self.header.is_empty() && self.payload_remaining.is_none()
    }

    /// Stream tag of the frame currently being forwarded.
    pub fn current_stream(&self) -> Option<StreamType> {
        self.current
    }

    /// Feeds one chunk of framed input and returns how many of its bytes
    /// were consumed. Consumption stops early only when the downstream
    /// accepts fewer payload bytes than offered.
    pub fn feed(&mut self, data: &[u8]) -> Result<usize> {
        let mut consumed = 0;
        while consumed < data.len() {
            let rest = &data[consumed..];
            match self.payload_remaining {
                None => {
                    let needed = FRAME_HEADER_LEN - self.header.len();
                    let take = needed.min(rest.len());
                    self.header.extend_from_slice(&rest[..take]);
                    consumed += take;

                    if self.header.len() == FRAME_HEADER_LEN {
                        self.start_frame();
                    }
                }
                Some(remaining) => {
                    let offered = remaining.min(rest.len());
                    let accepted = self.downstream.write(&rest[..offered])?;
                    consumed += accepted;
                    self.advance(remaining - accepted);
                    if accepted < offered {
                        break;
                    }
                }
            }
        }
        Ok(consumed)
    }

    fn start_frame(&mut self) {
        let stream = StreamType::from(self.header[0]);
        let length = u32::from_be_bytes([
            self.header[4],
            self.header[5],
            self.header[6],
            self.header[7],
        ]) as usize;
        self.header.clear();
        trace!(?stream, length, "Frame header decoded");

        self.current = Some(stream);
        // A zero-length frame completes immediately; nothing is forwarded.
        self.advance(length);
    }

    fn advance(&mut self, remaining: usize) {
        if remaining == 0 {
            self.payload_remaining = None;
            self.current = None;
        } else {
            self.payload_remaining = Some(remaining);
        }
    }
}

impl std::fmt::Debug for Demultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Demultiplexer")
            .field("header_len", &self.header.len())
            .field("payload_remaining", &self.payload_remaining)
            .field("current", &self.current)
            .finish_non_exhaustive()
    }
}

impl Writer for Demultiplexer {
    fn poll_handle(&self) -> PollHandle {
        self.downstream.poll_handle()
    }

    fn open(&mut self) -> Result<()> {
        self.downstream.open()
    }

    fn is_open(&self) -> bool {
        self.downstream.is_open()
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        self.feed(buf)
    }

    fn close(&mut self) -> Result<()> {
        if !self.is_idle() {
            trace!(
                header_len = self.header.len(),
                payload_remaining = ?self.payload_remaining,
                "Demultiplexer closed mid-frame"
            );
        }
        self.downstream.close()
    }
}

/// Encodes one frame. Mostly useful for feeding a [`Demultiplexer`] in tests.
pub fn encode_frame(stream: StreamType, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.push(u8::from(stream));
    frame.extend_from_slice(&[0, 0, 0]);
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(payload);
    frame
}
