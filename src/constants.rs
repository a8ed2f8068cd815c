//! # Worker Constants
//!
//! Defines the transfer bounds, polling cadence, mount layout and reserved
//! binding identifiers for the worker. These constants are the **single
//! source of truth** for defaults used by [`crate::config::WorkerConfig`].
//!
//! ## Cross-References
//!
//! - [`crate::select_loop`]: Uses [`POLL_TIMEOUT`] and [`CHUNK_SIZE`]
//! - [`crate::demux`]: Uses [`FRAME_HEADER_LEN`]
//! - [`crate::volume`]: Uses [`TEMP_VOLUME_MOUNT_PREFIX`]
//! - [`crate::executor`]: Uses [`DATA_VOLUME`] and the reserved binding ids
//! - [`crate::orchestrator`]: Uses the stop retry budget
//! - [`crate::stream::ChunkedUploadWriter`]: Uses the HTTP upload bounds

use std::time::Duration;

// =============================================================================
// Transfer Limits
// =============================================================================

/// Maximum number of bytes moved by a single connector step (64 KiB).
///
/// **Rationale**: Bounds the time one connector can hold the loop, so every
/// ready connector is serviced within one pass.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Maximum buffered length of a single progress line (1 MiB).
///
/// **Security**: A container that writes to the progress pipe without ever
/// emitting a newline would otherwise grow the line buffer without bound.
/// Lines exceeding this limit are discarded.
pub const MAX_PROGRESS_LINE_LEN: usize = 1024 * 1024;

/// Length of a container stdio frame header in bytes.
///
/// Layout: `[type:1][pad:3][length:4 big-endian]`.
pub const FRAME_HEADER_LEN: usize = 8;

// =============================================================================
// Timeouts
// =============================================================================

/// Readiness poll timeout for the multiplexing loop.
///
/// **Rationale**: The exit predicate (container liveness and cancellation) is
/// re-evaluated at least this often, so it also bounds cancellation latency.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Number of status reloads after a stop request timed out.
pub const STOP_STATUS_RETRIES: u32 = 10;

/// Delay between status reloads after a stop request timed out.
pub const STOP_RETRY_INTERVAL: Duration = Duration::from_millis(500);

/// Connect timeout for chunked HTTP uploads.
///
/// Only the connection is bounded; the upload itself lasts as long as the
/// container keeps producing output.
pub const HTTP_CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Chunks queued for an HTTP upload before `write` waits on the network.
pub const HTTP_UPLOAD_QUEUE_DEPTH: usize = 16;

// =============================================================================
// Mount Layout
// =============================================================================

/// Container-side prefix under which temporary volumes are mounted.
///
/// Each temporary volume is mounted at `<prefix>/<random hex id>`.
pub const TEMP_VOLUME_MOUNT_PREFIX: &str = "/mnt/magikworker";

/// Fixed container path of a task's data volume.
///
/// `$output{..}` tokens and relative filepath bindings resolve underneath
/// this directory.
pub const DATA_VOLUME: &str = "/mnt/magikworker/data";

/// Prefix for host directories created for temporary volumes.
pub const TEMP_DIR_PREFIX: &str = "magikworker-";

/// Prefix for host directories holding collected task outputs.
pub const OUTPUT_DIR_PREFIX: &str = "magikworker-out-";

/// FIFO name, inside the data volume, for structured progress messages.
pub const PROGRESS_PIPE_NAME: &str = ".progress";

/// Permission bits for created FIFOs (subject to the process umask).
pub const FIFO_MODE: u32 = 0o666;

// =============================================================================
// Reserved Binding Identifiers
// =============================================================================

/// Binding id for the container's standard input.
pub const STDIN_BINDING: &str = "_stdin";

/// Binding id for the container's standard output.
pub const STDOUT_BINDING: &str = "_stdout";

/// Binding id for the container's standard error.
pub const STDERR_BINDING: &str = "_stderr";

/// Pseudo input id that expands to the data volume's container path.
pub const TEMPDIR_TOKEN_ID: &str = "_tempdir";

/// Run arguments callers may not override: the worker always attaches
/// without a TTY and runs detached.
pub const BLACKLISTED_RUN_ARGS: &[&str] = &["tty", "detach"];
