//! Container runtime boundary.
//!
//! The worker does not talk to a container engine itself. It consumes a
//! [`ContainerRuntime`] client that can pull an image, start a detached
//! container, attach to its standard streams, reload its status, and stop
//! or remove it.
//!
//! # Lifecycle
//!
//! ```text
//! [pull(image)] → run(request) → attach(id, stdout|stderr|stdin)
//!               → status(id)* → [stop(id)] → [remove(id)]
//! ```
//!
//! Any error from the client is fatal to the run, except
//! [`Error::StopTimedOut`], which the orchestrator retries by polling
//! [`ContainerRuntime::status`].
//!
//! [`Error::StopTimedOut`]: crate::error::Error::StopTimedOut

use crate::constants::BLACKLISTED_RUN_ARGS;
use crate::error::Result;
use crate::volume::Mount;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::os::fd::OwnedFd;
use tracing::warn;

// =============================================================================
// Container Status
// =============================================================================

/// Container status as reported by the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
}

impl ContainerStatus {
    /// Returns true once the container process can no longer produce output.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Exited | Self::Dead)
    }

    /// Returns true while the container must not be removed.
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running | Self::Restarting)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Restarting => write!(f, "restarting"),
            Self::Removing => write!(f, "removing"),
            Self::Exited => write!(f, "exited"),
            Self::Dead => write!(f, "dead"),
        }
    }
}

// =============================================================================
// Standard Streams
// =============================================================================

/// One of the container's standard streams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StdStream {
    Stdin,
    Stdout,
    Stderr,
}

impl std::fmt::Display for StdStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdin => write!(f, "stdin"),
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// A byte channel attached to a container stream.
#[derive(Debug)]
pub struct AttachedStream {
    /// Socket or pipe carrying the stream.
    pub fd: OwnedFd,
    /// True if the channel carries stdio frames that must be demultiplexed.
    pub framed: bool,
}

impl AttachedStream {
    /// A raw channel.
    pub fn raw(fd: impl Into<OwnedFd>) -> Self {
        Self {
            fd: fd.into(),
            framed: false,
        }
    }

    /// A framed channel.
    pub fn framed(fd: impl Into<OwnedFd>) -> Self {
        Self {
            fd: fd.into(),
            framed: true,
        }
    }
}

// =============================================================================
// Run Request
// =============================================================================

/// Everything needed to start one detached container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub image: String,
    pub args: Vec<String>,
    pub entrypoint: Option<Vec<String>>,
    pub mounts: Vec<Mount>,
    /// Keep stdin open so it can be attached.
    pub stdin_open: bool,
    /// Always false: streams are attached without a TTY.
    pub tty: bool,
    /// Always true: the worker attaches rather than waiting on the run call.
    pub detach: bool,
    /// Extra engine-specific options passed through verbatim.
    pub extra: BTreeMap<String, serde_json::Value>,
}

impl RunRequest {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            args: Vec::new(),
            entrypoint: None,
            mounts: Vec::new(),
            stdin_open: false,
            tty: false,
            detach: true,
            extra: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    #[must_use]
    pub fn with_entrypoint(mut self, entrypoint: Option<Vec<String>>) -> Self {
        self.entrypoint = entrypoint;
        self
    }

    #[must_use]
    pub fn with_mounts(mut self, mounts: Vec<Mount>) -> Self {
        self.mounts = mounts;
        self
    }

    #[must_use]
    pub fn with_stdin_open(mut self, stdin_open: bool) -> Self {
        self.stdin_open = stdin_open;
        self
    }

    /// Adds extra run options, dropping those the worker controls itself.
    #[must_use]
    pub fn with_extra(mut self, extra: BTreeMap<String, serde_json::Value>) -> Self {
        for (key, value) in extra {
            if BLACKLISTED_RUN_ARGS.contains(&key.as_str()) {
                warn!("Ignoring run argument '{}': it is managed by the worker", key);
                continue;
            }
            self.extra.insert(key, value);
        }
        self
    }
}

// =============================================================================
// Runtime Trait
// =============================================================================

/// Client for a container engine.
///
/// Implementations translate engine failures into the runtime error
/// variants ([`Error::ImagePullFailed`], [`Error::RunFailed`], ...). A stop
/// call that did not complete in the engine's own timeout must surface as
/// [`Error::StopTimedOut`].
///
/// [`Error::ImagePullFailed`]: crate::error::Error::ImagePullFailed
/// [`Error::RunFailed`]: crate::error::Error::RunFailed
/// [`Error::StopTimedOut`]: crate::error::Error::StopTimedOut
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Returns the runtime name.
    fn name(&self) -> &str;

    /// Pulls an image.
    async fn pull(&self, image: &str) -> Result<()>;

    /// Starts a detached container and returns its id.
    async fn run(&self, request: &RunRequest) -> Result<String>;

    /// Attaches to one of the container's standard streams.
    async fn attach(&self, id: &str, stream: StdStream) -> Result<AttachedStream>;

    /// Reloads the container status.
    async fn status(&self, id: &str) -> Result<ContainerStatus>;

    /// Asks the container to stop.
    async fn stop(&self, id: &str) -> Result<()>;

    /// Removes the container object.
    async fn remove(&self, id: &str) -> Result<()>;
}
