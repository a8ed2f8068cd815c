//! Container run orchestration.
//!
//! [`Orchestrator::run_container`] composes the stream engine around one
//! container execution:
//!
//! ```text
//!  PREPARING ─────────────► RUNNING ──────────────► (STOPPING) ───► DONE
//!  pull image               attach stdout/stderr    only if canceled  remove container
//!  split stream args        (+ stdin)               stop(), then      (if requested and
//!  open read connectors     select loop until       poll status on    not running)
//!  run(detached)            exited/dead             a stop timeout
//! ```
//!
//! ## Threading
//!
//! The multiplexing loop is synchronous. It runs on a tokio blocking thread
//! and reloads the container status from its exit predicate through the
//! runtime handle, so the async [`ContainerRuntime`] stays the only client.
//!
//! ## Cancellation
//!
//! The exit predicate checks the [`CancelFlag`] on every pass. The first
//! time it sees it set, it stops the container from inside the loop, so a
//! container that keeps writing cannot hold the loop open. Once the stop
//! took effect the loop drains what is left; if the container could not be
//! stopped the loop is aborted.
//!
//! If the `run_container` future itself is dropped, a guard flags the loop,
//! which aborts on its next pass and closes every connector.
//!
//! ## Cleanup Guarantees
//!
//! Every connector handed to a run is closed on every path, including
//! failures before the container starts. Container removal is attempted
//! whenever the container was started, even if the loop or stop failed.

use crate::config::WorkerConfig;
use crate::connector::{Direction, StreamConnector};
use crate::demux::Demultiplexer;
use crate::error::{Error, Result};
use crate::runtime::{ContainerRuntime, ContainerStatus, RunRequest, StdStream};
use crate::select_loop::{LoopSignal, LoopStats, select_loop};
use crate::stream::{FdReader, FdWriter, Reader, StdStreamWriter, Writer};
use crate::volume::Mount;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tracing::{debug, error, info, warn};

// =============================================================================
// Cancellation
// =============================================================================

/// Cooperative cancellation flag shared with the task-queue layer.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

// =============================================================================
// Run Phase
// =============================================================================

/// Per-run state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Preparing,
    Running,
    Stopping,
    Done,
}

impl std::fmt::Display for RunPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Preparing => write!(f, "preparing"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Done => write!(f, "done"),
        }
    }
}

// =============================================================================
// Run Spec
// =============================================================================

/// One container argument: literal text, or a stream whose container-side
/// path is substituted and whose connector joins the loop.
#[derive(Debug)]
pub enum ContainerArg {
    Literal(String),
    Stream(StreamConnector),
}

impl From<String> for ContainerArg {
    fn from(s: String) -> Self {
        Self::Literal(s)
    }
}

impl From<&str> for ContainerArg {
    fn from(s: &str) -> Self {
        Self::Literal(s.to_string())
    }
}

impl From<StreamConnector> for ContainerArg {
    fn from(connector: StreamConnector) -> Self {
        Self::Stream(connector)
    }
}

/// Everything one container run needs.
pub struct ContainerRunSpec {
    pub image: String,
    pub entrypoint: Option<Vec<String>>,
    pub args: Vec<ContainerArg>,
    /// Connectors that are not container arguments.
    pub connectors: Vec<StreamConnector>,
    pub mounts: Vec<Mount>,
    pub pull_image: bool,
    pub remove_container: bool,
    pub run_args: BTreeMap<String, serde_json::Value>,
    /// Source for the container's stdin; `None` leaves stdin unattached.
    pub stdin: Option<Box<dyn Reader>>,
    /// Sink for the container's stdout; `None` forwards to the host stdout.
    pub stdout: Option<Box<dyn Writer>>,
    /// Sink for the container's stderr; `None` forwards to the host stderr.
    pub stderr: Option<Box<dyn Writer>>,
}

impl ContainerRunSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            entrypoint: None,
            args: Vec::new(),
            connectors: Vec::new(),
            mounts: Vec::new(),
            pull_image: true,
            remove_container: false,
            run_args: BTreeMap::new(),
            stdin: None,
            stdout: None,
            stderr: None,
        }
    }

    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: Vec<String>) -> Self {
        self.entrypoint = Some(entrypoint);
        self
    }

    #[must_use]
    pub fn with_arg(mut self, arg: impl Into<ContainerArg>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ContainerArg>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn with_connector(mut self, connector: StreamConnector) -> Self {
        self.connectors.push(connector);
        self
    }

    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    #[must_use]
    pub fn with_pull_image(mut self, pull_image: bool) -> Self {
        self.pull_image = pull_image;
        self
    }

    #[must_use]
    pub fn with_remove_container(mut self, remove: bool) -> Self {
        self.remove_container = remove;
        self
    }

    #[must_use]
    pub fn with_run_args(mut self, run_args: BTreeMap<String, serde_json::Value>) -> Self {
        self.run_args = run_args;
        self
    }

    #[must_use]
    pub fn with_stdin(mut self, stdin: Box<dyn Reader>) -> Self {
        self.stdin = Some(stdin);
        self
    }

    #[must_use]
    pub fn with_stdout(mut self, stdout: Box<dyn Writer>) -> Self {
        self.stdout = Some(stdout);
        self
    }

    #[must_use]
    pub fn with_stderr(mut self, stderr: Box<dyn Writer>) -> Self {
        self.stderr = Some(stderr);
        self
    }
}

impl std::fmt::Debug for ContainerRunSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRunSpec")
            .field("image", &self.image)
            .field("entrypoint", &self.entrypoint)
            .field("args", &self.args)
            .field("connectors", &self.connectors.len())
            .field("mounts", &self.mounts)
            .field("pull_image", &self.pull_image)
            .field("remove_container", &self.remove_container)
            .finish_non_exhaustive()
    }
}

/// Result of a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    pub container_id: String,
    /// The run was canceled and the container was asked to stop.
    pub canceled: bool,
    pub stats: LoopStats,
}

// =============================================================================
// Orchestrator
// =============================================================================

/// Runs containers through a [`ContainerRuntime`].
#[derive(Clone)]
pub struct Orchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    config: WorkerConfig,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("runtime", &self.runtime.name())
            .field("config", &self.config)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, config: WorkerConfig) -> Self {
        Self { runtime, config }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Runs one container to completion or cancellation.
    pub async fn run_container(
        &self,
        spec: ContainerRunSpec,
        cancel: &CancelFlag,
    ) -> Result<RunOutcome> {
        let ContainerRunSpec {
            image,
            entrypoint,
            args,
            connectors,
            mounts,
            pull_image,
            remove_container,
            run_args,
            stdin,
            stdout,
            stderr,
        } = spec;

        debug!(image = %image, phase = %RunPhase::Preparing, "Container run phase");
        let mut readers = Vec::new();
        let mut writers = Vec::new();
        let mut container_args = Vec::with_capacity(args.len());
        let mut arg_error = None;

        for arg in args {
            match arg {
                ContainerArg::Literal(s) => container_args.push(s),
                ContainerArg::Stream(connector) => {
                    match connector.container_arg() {
                        Some(path) => container_args.push(path.to_string()),
                        None => {
                            arg_error.get_or_insert(Error::InvalidBinding {
                                id: "container_args".into(),
                                reason: "stream argument has no container path".into(),
                            });
                        }
                    }
                    push_connector(connector, &mut readers, &mut writers);
                }
            }
        }
        for connector in connectors {
            push_connector(connector, &mut readers, &mut writers);
        }
        if let Some(e) = arg_error {
            close_all(&mut readers, &mut writers);
            return Err(e);
        }

        if pull_image {
            info!(image = %image, "Pulling image");
            if let Err(e) = self.runtime.pull(&image).await {
                error!(image = %image, "Error pulling image: {}", e);
                close_all(&mut readers, &mut writers);
                return Err(e);
            }
        }

        // Output FIFOs must be open for reading before the container starts.
        for reader in &mut readers {
            if let Err(e) = reader.open() {
                close_all(&mut readers, &mut writers);
                return Err(e);
            }
        }

        let request = RunRequest::new(image.clone())
            .with_args(container_args)
            .with_entrypoint(entrypoint)
            .with_mounts(mounts)
            .with_stdin_open(stdin.is_some())
            .with_extra(run_args);
        info!(
            image = %image,
            args = ?request.args,
            runtime = self.runtime.name(),
            "Running container"
        );
        let id = match self.runtime.run(&request).await {
            Ok(id) => id,
            Err(e) => {
                error!(image = %image, "Error running container: {}", e);
                close_all(&mut readers, &mut writers);
                return Err(e);
            }
        };

        debug!(container = %id, phase = %RunPhase::Running, "Container run phase");
        let stop_requested = Arc::new(AtomicBool::new(false));
        let result = self
            .attach_and_loop(
                &id,
                readers,
                writers,
                (stdin, stdout, stderr),
                cancel,
                &stop_requested,
            )
            .await;

        // A cancel that landed after the loop's last look still stops it.
        let canceled = cancel.is_canceled();
        let result = match result {
            Ok(stats) if canceled && !stop_requested.load(Ordering::SeqCst) => {
                debug!(container = %id, phase = %RunPhase::Stopping, "Container run phase");
                self.stop_container(&id).await.map(|_| stats)
            }
            other => other,
        };

        let removal = if remove_container {
            self.remove_container(&id).await
        } else {
            Ok(())
        };

        debug!(container = %id, phase = %RunPhase::Done, "Container run phase");
        let stats = result?;
        removal?;
        Ok(RunOutcome {
            container_id: id,
            canceled,
            stats,
        })
    }

    async fn attach_and_loop(
        &self,
        id: &str,
        mut readers: Vec<StreamConnector>,
        mut writers: Vec<StreamConnector>,
        (stdin, stdout, stderr): StdStreams,
        cancel: &CancelFlag,
        stop_requested: &Arc<AtomicBool>,
    ) -> Result<LoopStats> {
        let stdout = stdout.unwrap_or_else(|| Box::new(StdStreamWriter::stdout()));
        let stderr = stderr.unwrap_or_else(|| Box::new(StdStreamWriter::stderr()));

        let attached = async {
            readers.push(self.attach_output(id, StdStream::Stdout, stdout).await?);
            readers.push(self.attach_output(id, StdStream::Stderr, stderr).await?);
            if let Some(source) = stdin {
                writers.push(self.attach_input(id, source).await?);
            }
            Ok::<(), Error>(())
        }
        .await;
        if let Err(e) = attached {
            error!(container = %id, "Error attaching to container: {}", e);
            close_all(&mut readers, &mut writers);
            return Err(e);
        }

        let abandoned = Arc::new(AtomicBool::new(false));
        let _guard = AbandonOnDrop(Arc::clone(&abandoned));

        let runtime = Arc::clone(&self.runtime);
        let cancel = cancel.clone();
        let stop_requested = Arc::clone(stop_requested);
        let container = id.to_string();
        let handle = Handle::current();
        let poll_timeout = self.config.poll_timeout();
        let retries = self.config.stop_retries;
        let interval = self.config.stop_retry_interval();

        let exit_condition = move || -> Result<LoopSignal> {
            if abandoned.load(Ordering::SeqCst) {
                warn!(container = %container, "Run was abandoned, closing its streams");
                return Ok(LoopSignal::Abort);
            }
            if cancel.is_canceled() {
                if !stop_requested.swap(true, Ordering::SeqCst) {
                    debug!(container = %container, phase = %RunPhase::Stopping, "Container run phase");
                    let stopped = handle.block_on(stop_container(
                        runtime.as_ref(),
                        &container,
                        retries,
                        interval,
                    ))?;
                    if !stopped {
                        return Ok(LoopSignal::Abort);
                    }
                }
                return Ok(LoopSignal::Exit);
            }
            let status = handle.block_on(runtime.status(&container))?;
            Ok(status.is_terminal().into())
        };

        tokio::task::spawn_blocking(move || {
            select_loop(exit_condition, readers, writers, poll_timeout)
        })
        .await
        .map_err(|e| Error::Internal(format!("select loop task failed: {e}")))?
    }

    async fn attach_output(
        &self,
        id: &str,
        stream: StdStream,
        sink: Box<dyn Writer>,
    ) -> Result<StreamConnector> {
        let attached = self.runtime.attach(id, stream).await?;
        let source = FdReader::nonblocking(attached.fd)?;
        let sink: Box<dyn Writer> = if attached.framed {
            Box::new(Demultiplexer::new(sink))
        } else {
            sink
        };
        debug!(container = %id, stream = %stream, framed = attached.framed, "Attached");
        Ok(StreamConnector::reader(Box::new(source), sink).with_chunk_size(self.config.chunk_size))
    }

    async fn attach_input(&self, id: &str, source: Box<dyn Reader>) -> Result<StreamConnector> {
        let attached = self.runtime.attach(id, StdStream::Stdin).await?;
        let sink = FdWriter::nonblocking(attached.fd)?;
        debug!(container = %id, stream = %StdStream::Stdin, "Attached");
        Ok(StreamConnector::writer(source, Box::new(sink)).with_chunk_size(self.config.chunk_size))
    }

    /// Stops a canceled container. Returns whether it is known to have
    /// exited.
    async fn stop_container(&self, id: &str) -> Result<bool> {
        stop_container(
            self.runtime.as_ref(),
            id,
            self.config.stop_retries,
            self.config.stop_retry_interval(),
        )
        .await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        let status = self.runtime.status(id).await?;
        if status.is_running() {
            warn!(container = %id, status = %status, "Container is still running, unable to remove");
            return Ok(());
        }
        if let Err(e) = self.runtime.remove(id).await {
            error!(container = %id, "Error removing container: {}", e);
            return Err(e);
        }
        debug!(container = %id, "Removed container");
        Ok(())
    }
}

/// The optional stdin source and stdout/stderr sinks of a run.
type StdStreams = (
    Option<Box<dyn Reader>>,
    Option<Box<dyn Writer>>,
    Option<Box<dyn Writer>>,
);

/// Flags the loop of a run whose future was dropped.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::SeqCst);
    }
}

/// Stops a container and reports whether it exited.
///
/// A stop timeout is followed by at most `retries` status reloads spaced by
/// `interval`; a container that still has not exited is logged, not treated
/// as a failure.
async fn stop_container(
    runtime: &dyn ContainerRuntime,
    id: &str,
    retries: u32,
    interval: Duration,
) -> Result<bool> {
    info!(container = %id, "Stopping canceled container");
    match runtime.stop(id).await {
        Ok(()) => Ok(true),
        Err(Error::StopTimedOut { .. }) => {
            for attempt in 0..retries {
                let status = runtime.status(id).await?;
                if status == ContainerStatus::Exited {
                    return Ok(true);
                }
                debug!(container = %id, attempt, status = %status, "Waiting for container to stop");
                tokio::time::sleep(interval).await;
            }
            error!(container = %id, "Unable to stop container");
            Ok(false)
        }
        Err(e) => {
            error!(container = %id, "Error stopping container: {}", e);
            Err(e)
        }
    }
}

fn push_connector(
    connector: StreamConnector,
    readers: &mut Vec<StreamConnector>,
    writers: &mut Vec<StreamConnector>,
) {
    match connector.direction() {
        Direction::Read => readers.push(connector),
        Direction::Write => writers.push(connector),
    }
}

fn close_all(readers: &mut [StreamConnector], writers: &mut [StreamConnector]) {
    for connector in readers.iter_mut().chain(writers.iter_mut()) {
        if let Err(e) = connector.close() {
            warn!("Failed to close connector: {}", e);
        }
    }
}
