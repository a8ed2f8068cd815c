//! Shared test fixtures: an in-process container runtime.
//!
//! `FakeRuntime::run` spawns a thread that plays the container. The thread
//! gets the far ends of socket pairs for its standard streams, the run
//! request, and a way to map container paths to host paths through the
//! request's mounts.

#![allow(dead_code)]

use async_trait::async_trait;
use magikworker::demux::{StreamType, encode_frame};
use magikworker::runtime::{
    AttachedStream, ContainerRuntime, ContainerStatus, RunRequest, StdStream,
};
use magikworker::{Error, Result};
use std::collections::HashMap;
use std::io::Write;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// How the fake reacts to `stop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Stop returns once the container has exited.
    Graceful,
    /// Stop times out, the container exits shortly after.
    TimesOut,
    /// Stop times out and the container never reports exited.
    Hangs,
}

/// The container side of a run.
pub struct Container {
    pub request: RunRequest,
    pub stdout: UnixStream,
    pub stderr: UnixStream,
    pub stdin: Option<UnixStream>,
    framed: bool,
    stopped: Arc<AtomicBool>,
}

impl Container {
    pub fn write_stdout(&mut self, data: &[u8]) {
        let bytes = self.encode(StreamType::Stdout, data);
        self.stdout.write_all(&bytes).unwrap();
    }

    pub fn write_stderr(&mut self, data: &[u8]) {
        let bytes = self.encode(StreamType::Stderr, data);
        self.stderr.write_all(&bytes).unwrap();
    }

    fn encode(&self, stream: StreamType, data: &[u8]) -> Vec<u8> {
        if self.framed {
            encode_frame(stream, data)
        } else {
            data.to_vec()
        }
    }

    /// Maps a container path to the host path behind its mount.
    pub fn host_path(&self, container_path: &str) -> PathBuf {
        self.request
            .mounts
            .iter()
            .filter_map(|m| {
                let rest = container_path.strip_prefix(&m.container_path)?;
                if !rest.is_empty() && !rest.starts_with('/') {
                    return None;
                }
                Some((m.container_path.len(), m.host_path.join(rest.trim_start_matches('/'))))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, path)| path)
            .unwrap_or_else(|| panic!("{container_path} is not under any mount"))
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    pub fn wait_for_stop(&self) {
        while !self.stopped.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(2));
        }
    }
}

type Script = dyn Fn(&mut Container) + Send + Sync;

#[derive(Default)]
struct Shared {
    calls: Mutex<Vec<String>>,
    requests: Mutex<Vec<RunRequest>>,
    attachable: Mutex<HashMap<&'static str, UnixStream>>,
    exited: AtomicBool,
    stopped: Arc<AtomicBool>,
}

pub struct FakeRuntime {
    script: Arc<Script>,
    framed: bool,
    stop_mode: StopMode,
    fail_pull: bool,
    shared: Arc<Shared>,
}

impl FakeRuntime {
    pub fn new(script: impl Fn(&mut Container) + Send + Sync + 'static) -> Self {
        Self {
            script: Arc::new(script),
            framed: true,
            stop_mode: StopMode::Graceful,
            fail_pull: false,
            shared: Arc::new(Shared::default()),
        }
    }

    pub fn raw_streams(mut self) -> Self {
        self.framed = false;
        self
    }

    pub fn with_stop_mode(mut self, mode: StopMode) -> Self {
        self.stop_mode = mode;
        self
    }

    pub fn failing_pull(mut self) -> Self {
        self.fail_pull = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.shared.calls.lock().unwrap().clone()
    }

    pub fn count(&self, call: &str) -> usize {
        self.calls().iter().filter(|c| c.as_str() == call).count()
    }

    pub fn last_request(&self) -> Option<RunRequest> {
        self.shared.requests.lock().unwrap().last().cloned()
    }

    fn record(&self, call: &str) {
        self.shared.calls.lock().unwrap().push(call.to_string());
    }
}

fn stream_key(stream: StdStream) -> &'static str {
    match stream {
        StdStream::Stdin => "stdin",
        StdStream::Stdout => "stdout",
        StdStream::Stderr => "stderr",
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    fn name(&self) -> &str {
        "fake"
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record("pull");
        if self.fail_pull {
            return Err(Error::ImagePullFailed {
                image: image.to_string(),
                reason: "not found".into(),
            });
        }
        Ok(())
    }

    async fn run(&self, request: &RunRequest) -> Result<String> {
        self.record("run");
        self.shared.requests.lock().unwrap().push(request.clone());

        let (host_out, container_out) = UnixStream::pair()?;
        let (host_err, container_err) = UnixStream::pair()?;
        let mut attachable = self.shared.attachable.lock().unwrap();
        attachable.insert("stdout", host_out);
        attachable.insert("stderr", host_err);
        let stdin = if request.stdin_open {
            let (host_in, container_in) = UnixStream::pair()?;
            attachable.insert("stdin", host_in);
            Some(container_in)
        } else {
            None
        };
        drop(attachable);

        let mut container = Container {
            request: request.clone(),
            stdout: container_out,
            stderr: container_err,
            stdin,
            framed: self.framed,
            stopped: Arc::clone(&self.shared.stopped),
        };
        let script = Arc::clone(&self.script);
        let shared = Arc::clone(&self.shared);
        let stop_mode = self.stop_mode;
        std::thread::spawn(move || {
            script(&mut container);
            drop(container);
            if !(stop_mode == StopMode::Hangs && shared.stopped.load(Ordering::SeqCst)) {
                shared.exited.store(true, Ordering::SeqCst);
            }
        });
        Ok("fake-container".to_string())
    }

    async fn attach(&self, id: &str, stream: StdStream) -> Result<AttachedStream> {
        self.record(&format!("attach:{stream}"));
        let socket = self
            .shared
            .attachable
            .lock()
            .unwrap()
            .remove(stream_key(stream))
            .ok_or_else(|| Error::AttachFailed {
                id: id.to_string(),
                stream: stream.to_string(),
                reason: "stream not available".into(),
            })?;
        if self.framed && stream != StdStream::Stdin {
            Ok(AttachedStream::framed(socket))
        } else {
            Ok(AttachedStream::raw(socket))
        }
    }

    async fn status(&self, _id: &str) -> Result<ContainerStatus> {
        self.record("status");
        if self.shared.exited.load(Ordering::SeqCst) {
            Ok(ContainerStatus::Exited)
        } else {
            Ok(ContainerStatus::Running)
        }
    }

    async fn stop(&self, id: &str) -> Result<()> {
        self.record("stop");
        self.shared.stopped.store(true, Ordering::SeqCst);
        match self.stop_mode {
            StopMode::Graceful => {
                while !self.shared.exited.load(Ordering::SeqCst) {
                    tokio::time::sleep(Duration::from_millis(2)).await;
                }
                Ok(())
            }
            StopMode::TimesOut | StopMode::Hangs => Err(Error::StopTimedOut { id: id.to_string() }),
        }
    }

    async fn remove(&self, _id: &str) -> Result<()> {
        self.record("remove");
        Ok(())
    }
}
