//! # magikworker
//!
//! **Container Task Execution with Streaming I/O Plumbing**
//!
//! This crate runs a single containerized task: it materializes the task's
//! inputs into a temporary data volume, starts the container through a
//! pluggable [`ContainerRuntime`] client, pumps bytes between host endpoints
//! and the container's standard streams and named pipes, and collects the
//! produced outputs. Queueing, result transport and engine clients live in
//! higher layers.
//!
//! # Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────┐
//! │                          TaskExecutor                               │
//! │   validate → expand $input/$flag/$output → materialize → collect    │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                          Orchestrator                               │
//! │   pull → open readers → run(detached) → attach → loop → stop/remove │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │                          Stream Engine                              │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐      │
//! │  │ select_loop  │  │ StreamConnector│  │ Demultiplexer       │      │
//! │  │ poll(2) over │  │ Reader → Writer│  │ 8-byte stdio frames │      │
//! │  │ all endpoints│  │ one chunk/step │  │                     │      │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘      │
//! │  ┌──────────────┐  ┌────────────────┐  ┌─────────────────────┐      │
//! │  │ Fd / Memory  │  │ NamedPipe FIFOs│  │ Accumulate/Progress │      │
//! │  │ endpoints    │  │ lazy open      │  │ adapters            │      │
//! │  └──────────────┘  └────────────────┘  └─────────────────────┘      │
//! ├─────────────────────────────────────────────────────────────────────┤
//! │            VolumeSet: bind mounts + temporary host dirs             │
//! └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Data Flow
//!
//! ```text
//!  host source ──► NamedPipeWriter ──► FIFO ──► container reads path
//!  container writes path ──► FIFO ──► NamedPipeReader ──► host sink
//!  container stdout/stderr ──► socket ──► Demultiplexer ──► sink
//!  stdin source ──► socket ──► container stdin
//!  streaming output ──► ChunkedUploadWriter ──► chunked HTTP POST
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use magikworker::{Orchestrator, RunContext, TaskExecutor, TaskSpec, WorkerConfig};
//!
//! async fn word_count(runtime: Arc<dyn ContainerRuntime>) -> magikworker::Result<()> {
//!     let task = TaskSpec::from_yaml(include_str!("word_count.yaml"))?;
//!     let executor = TaskExecutor::new(Orchestrator::new(runtime, WorkerConfig::default()));
//!     let result = executor
//!         .run_task(&task, &inputs, &outputs, &RunContext::default())
//!         .await?;
//!     println!("{:?}", result.output("_stdout"));
//!     Ok(())
//! }
//! ```

pub mod adapters;
pub mod args;
pub mod config;
pub mod connector;
pub mod constants;
pub mod demux;
pub mod error;
pub mod executor;
pub mod orchestrator;
pub mod pipes;
pub mod runtime;
pub mod select_loop;
pub mod stream;
pub mod task;
pub mod volume;

// Re-exports
pub use adapters::{
    AccumulateAdapter, AdapterFactory, LocalAdapterFactory, OutputMap, ProgressAdapter,
    ProgressSink, ProgressUpdate,
};
pub use args::{TokenContext, expand_args};
pub use config::WorkerConfig;
pub use connector::{Direction, Step, StreamConnector};
pub use constants::*;
pub use demux::{Demultiplexer, StreamType, encode_frame};
pub use error::{Error, Result};
pub use executor::{OutputValue, RunContext, TaskExecutor, TaskResult};
pub use orchestrator::{CancelFlag, ContainerArg, ContainerRunSpec, Orchestrator, RunOutcome};
pub use pipes::PipeBinding;
pub use runtime::{AttachedStream, ContainerRuntime, ContainerStatus, RunRequest, StdStream};
pub use select_loop::{LoopSignal, LoopStats, select_loop};
pub use stream::{Chunk, ChunkedUploadWriter, PollHandle, Reader, Writer};
pub use task::{InputBinding, OutputBinding, Target, TaskInput, TaskOutput, TaskSpec};
pub use volume::{Mount, VolumeMode, VolumeRef, VolumeSet};
