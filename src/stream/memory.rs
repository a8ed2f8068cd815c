//! In-memory fetch adapter.

use super::{Chunk, PollHandle, Reader};
use crate::error::Result;

/// Serves a fixed byte buffer in successive slices, then end-of-stream.
///
/// Used to feed non-streaming inputs (e.g. inline `_stdin` data) through the
/// same connector machinery as live pipes. Never blocks.
#[derive(Debug, Clone, Default)]
pub struct MemoryReader {
    data: Vec<u8>,
    pos: usize,
}

impl MemoryReader {
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self {
            data: data.into(),
            pos: 0,
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }
}

impl Reader for MemoryReader {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::Always
    }

    fn read(&mut self, max: usize) -> Result<Chunk> {
        if self.remaining() == 0 {
            return Ok(Chunk::Eof);
        }
        let end = self.data.len().min(self.pos + max);
        let chunk = self.data[self.pos..end].to_vec();
        self.pos = end;
        Ok(Chunk::Data(chunk))
    }

    fn close(&mut self) -> Result<()> {
        self.pos = self.data.len();
        Ok(())
    }
}
