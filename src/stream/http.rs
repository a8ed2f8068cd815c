//! Chunked-transfer HTTP upload sink.
//!
//! [`ChunkedUploadWriter`] streams everything written to it as the body of
//! one `POST` request. The body length is not known up front, so the request
//! goes out with `Transfer-Encoding: chunked`:
//!
//! ```text
//!  loop thread                     upload thread
//!  ───────────                     ─────────────
//!  write(buf) ──► bounded queue ──► body reader ──► chunked POST body
//!  close()    ──► drop sender       EOF          ──► 0\r\n\r\n, await status
//!             ◄── join ◄──────────────────────────── Ok / UploadFailed
//! ```
//!
//! The request runs on a dedicated thread with a blocking client, so the
//! writer works from the synchronous loop without a runtime context.

use super::{PollHandle, Writer};
use crate::constants::{HTTP_CONNECT_TIMEOUT, HTTP_UPLOAD_QUEUE_DEPTH};
use crate::error::{Error, Result};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

/// Pushes bytes to an HTTP endpoint as a chunked request body.
pub struct ChunkedUploadWriter {
    url: String,
    sender: Option<SyncSender<Vec<u8>>>,
    request: Option<JoinHandle<Result<()>>>,
}

impl ChunkedUploadWriter {
    /// Starts the request. Headers are sent as given; `Transfer-Encoding` is
    /// set by the client.
    pub fn new(url: &str, headers: &BTreeMap<String, String>) -> Result<Self> {
        let target = reqwest::Url::parse(url).map_err(|e| upload_error(url, e))?;
        let mut header_map = HeaderMap::new();
        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes()).map_err(|e| upload_error(url, e))?;
            let value = HeaderValue::from_str(value).map_err(|e| upload_error(url, e))?;
            header_map.insert(name, value);
        }

        let (sender, receiver) = mpsc::sync_channel(HTTP_UPLOAD_QUEUE_DEPTH);
        let request = std::thread::Builder::new()
            .name("chunked-upload".into())
            .spawn(move || upload(target, header_map, receiver))?;
        debug!(url = %url, "Started chunked upload");

        Ok(Self {
            url: url.to_string(),
            sender: Some(sender),
            request: Some(request),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

impl std::fmt::Debug for ChunkedUploadWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkedUploadWriter")
            .field("url", &self.url)
            .field("open", &self.sender.is_some())
            .finish_non_exhaustive()
    }
}

impl Writer for ChunkedUploadWriter {
    fn poll_handle(&self) -> PollHandle {
        PollHandle::Always
    }

    fn write(&mut self, buf: &[u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(sender) = &self.sender
            && sender.send(buf.to_vec()).is_err()
        {
            // The request already ended; close() reports why.
            warn!(url = %self.url, "Upload ended early, discarding remaining output");
            self.sender = None;
        }
        Ok(buf.len())
    }

    fn close(&mut self) -> Result<()> {
        self.sender.take();
        let Some(request) = self.request.take() else {
            return Ok(());
        };
        let result = request
            .join()
            .map_err(|_| Error::Internal(format!("upload thread for {} panicked", self.url)))?;
        if result.is_ok() {
            debug!(url = %self.url, "Chunked upload finished");
        }
        result
    }
}

fn upload(url: reqwest::Url, headers: HeaderMap, chunks: Receiver<Vec<u8>>) -> Result<()> {
    let client = reqwest::blocking::Client::builder()
        .connect_timeout(HTTP_CONNECT_TIMEOUT)
        .timeout(None::<Duration>)
        .build()
        .map_err(|e| upload_error(url.as_str(), e))?;

    let response = client
        .post(url.clone())
        .headers(headers)
        .body(reqwest::blocking::Body::new(ChunkReader::new(chunks)))
        .send()
        .map_err(|e| upload_error(url.as_str(), e))?;

    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        return Err(upload_error(url.as_str(), format!("server responded {status}")));
    }
    Ok(())
}

fn upload_error(url: &str, reason: impl std::fmt::Display) -> Error {
    Error::UploadFailed {
        url: url.to_string(),
        reason: reason.to_string(),
    }
}

/// Request body fed from the writer's queue; EOF once the sender is gone.
struct ChunkReader {
    chunks: Receiver<Vec<u8>>,
    current: Vec<u8>,
    offset: usize,
}

impl ChunkReader {
    fn new(chunks: Receiver<Vec<u8>>) -> Self {
        Self {
            chunks,
            current: Vec::new(),
            offset: 0,
        }
    }
}

impl Read for ChunkReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.offset == self.current.len() {
            match self.chunks.recv() {
                Ok(chunk) => {
                    self.current = chunk;
                    self.offset = 0;
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.current.len() - self.offset);
        buf[..n].copy_from_slice(&self.current[self.offset..self.offset + n]);
        self.offset += n;
        Ok(n)
    }
}
