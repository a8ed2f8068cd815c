//! Error types for the worker.

use std::path::PathBuf;

/// Result type alias for worker operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while preparing, running or tearing down a
/// container run.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    // =========================================================================
    // Configuration Errors
    // =========================================================================
    /// A binding spec is malformed or unsupported.
    #[error("invalid binding '{id}': {reason}")]
    InvalidBinding { id: String, reason: String },

    /// An argument token could not be resolved.
    #[error("could not expand token: {0}")]
    UnresolvedToken(String),

    /// A streaming filepath binding used an absolute path.
    #[error("streaming filepath '{path}' of binding '{id}' must be relative")]
    AbsoluteStreamPath { id: String, path: String },

    /// Worker configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // =========================================================================
    // Container Runtime Errors
    // =========================================================================
    /// Image pull failed.
    #[error("failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    /// Container could not be started.
    #[error("failed to run image '{image}': {reason}")]
    RunFailed { image: String, reason: String },

    /// Attaching to a container stream failed.
    #[error("failed to attach to {stream} of container '{id}': {reason}")]
    AttachFailed {
        id: String,
        stream: String,
        reason: String,
    },

    /// Reloading container status failed.
    #[error("failed to reload status of container '{id}': {reason}")]
    StatusFailed { id: String, reason: String },

    /// Stop request failed.
    #[error("failed to stop container '{id}': {reason}")]
    StopFailed { id: String, reason: String },

    /// Stop request timed out before the runtime answered.
    #[error("stop request for container '{id}' timed out")]
    StopTimedOut { id: String },

    /// Container removal failed.
    #[error("failed to remove container '{id}': {reason}")]
    RemoveFailed { id: String, reason: String },

    /// Operation not supported by this runtime.
    #[error("operation not supported: {0}")]
    NotSupported(String),

    // =========================================================================
    // Stream / Pipe Errors
    // =========================================================================
    /// FIFO creation failed.
    #[error("failed to create named pipe {path}: {reason}")]
    PipeCreateFailed { path: PathBuf, reason: String },

    /// Pipe path exists but is not a FIFO.
    #[error("pipe must be a fifo object: {0}")]
    NotAFifo(PathBuf),

    /// Pipe path does not exist.
    #[error("pipe does not exist: {0}")]
    PipeMissing(PathBuf),

    /// A chunked upload to an HTTP endpoint could not be set up or was
    /// rejected.
    #[error("upload to {url} failed: {reason}")]
    UploadFailed { url: String, reason: String },

    // =========================================================================
    // Lifecycle Errors
    // =========================================================================
    /// Temporary volume could not be created.
    #[error("failed to create temporary volume under {path}: {reason}")]
    VolumeCreateFailed { path: PathBuf, reason: String },

    /// A materialized volume could not be removed.
    #[error("failed to tear down volume {path}: {reason}")]
    TeardownFailed { path: PathBuf, reason: String },

    /// Expected output file was not produced by the container.
    #[error("output filepath {0} does not exist")]
    OutputMissing(PathBuf),

    // =========================================================================
    // I/O Errors
    // =========================================================================
    /// Generic I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    // =========================================================================
    // Internal Errors
    // =========================================================================
    /// Internal error (should not happen).
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true for errors caused by a malformed task or configuration.
    ///
    /// These are raised before any container or pipe exists.
    #[must_use]
    pub fn is_configuration(&self) -> bool {
        matches!(
            self,
            Self::InvalidBinding { .. }
                | Self::UnresolvedToken(_)
                | Self::AbsoluteStreamPath { .. }
                | Self::InvalidConfig(_)
        )
    }

    /// Returns true for errors reported by the container runtime client.
    #[must_use]
    pub fn is_runtime(&self) -> bool {
        matches!(
            self,
            Self::ImagePullFailed { .. }
                | Self::RunFailed { .. }
                | Self::AttachFailed { .. }
                | Self::StatusFailed { .. }
                | Self::StopFailed { .. }
                | Self::StopTimedOut { .. }
                | Self::RemoveFailed { .. }
                | Self::NotSupported(_)
        )
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
