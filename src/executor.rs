//! Task execution.
//!
//! [`TaskExecutor::run_task`] runs one [`TaskSpec`] invocation end to end:
//!
//! 1. **Validate** the declared outputs and streaming paths.
//! 2. **Expand** the argument template against the bound values. Nothing
//!    has been created yet, so configuration errors leave nothing behind.
//! 3. **Materialize** the data volume: filepath inputs are written or
//!    copied into it (or bind-mounted read-only via `direct_path`), FIFOs
//!    are created for streaming bindings and the progress pipe, and
//!    standard streams get memory, accumulate or factory adapters.
//! 4. **Run** the container through the [`Orchestrator`].
//! 5. **Collect** non-streaming filepath outputs from the data volume into
//!    a result directory owned by the returned [`TaskResult`].
//! 6. **Tear down** every temporary volume, on success and failure alike.
//!
//! ## Data Volume Layout
//!
//! ```text
//! host: <tmp_root>/magikworker-XXXX/       container: /mnt/magikworker/data/
//!   ├── <input path or id>                   filepath inputs
//!   ├── <stream path or id>   (fifo)         streaming bindings
//!   ├── .progress             (fifo)         progress pipe
//!   └── <output name>                        filepath outputs
//! ```

use crate::adapters::{
    AccumulateAdapter, AdapterFactory, LocalAdapterFactory, OutputMap, ProgressAdapter,
    ProgressSink,
};
use crate::args::{TokenContext, expand_args, substitute};
use crate::connector::StreamConnector;
use crate::constants::{
    OUTPUT_DIR_PREFIX, PROGRESS_PIPE_NAME, STDERR_BINDING, STDIN_BINDING, STDOUT_BINDING,
};
use crate::error::{Error, Result};
use crate::orchestrator::{CancelFlag, ContainerRunSpec, Orchestrator};
use crate::pipes::PipeBinding;
use crate::stream::{Chunk, MemoryReader, Reader, Writer};
use crate::task::{InputBinding, OutputBinding, Target, TaskInput, TaskSpec};
use crate::volume::{Mount, ResolvedVolume, VolumeRef, VolumeSet, join_container_path};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError};
use tempfile::TempDir;
use tracing::{debug, info, warn};

// =============================================================================
// Context and Results
// =============================================================================

/// Collaborators for one task invocation.
#[derive(Clone)]
pub struct RunContext {
    pub adapters: Arc<dyn AdapterFactory>,
    pub progress: Option<Arc<dyn ProgressSink>>,
    pub cancel: CancelFlag,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            adapters: Arc::new(LocalAdapterFactory),
            progress: None,
            cancel: CancelFlag::new(),
        }
    }
}

impl RunContext {
    #[must_use]
    pub fn with_adapters(mut self, adapters: Arc<dyn AdapterFactory>) -> Self {
        self.adapters = adapters;
        self
    }

    #[must_use]
    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = Some(progress);
        self
    }

    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelFlag) -> Self {
        self.cancel = cancel;
        self
    }
}

impl std::fmt::Debug for RunContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunContext")
            .field("progress", &self.progress.is_some())
            .field("cancel", &self.cancel)
            .finish_non_exhaustive()
    }
}

/// Value produced for one output binding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputValue {
    /// Accumulated bytes of a non-streaming standard stream.
    Data(Vec<u8>),
    /// Host path of a collected filepath output.
    File(PathBuf),
}

/// Outcome of [`TaskExecutor::run_task`].
///
/// Collected output files live in a temporary directory that is removed
/// when the result is dropped.
#[derive(Debug)]
pub struct TaskResult {
    pub container_id: String,
    pub canceled: bool,
    pub outputs: BTreeMap<String, OutputValue>,
    output_dir: Option<TempDir>,
}

impl TaskResult {
    pub fn output(&self, id: &str) -> Option<&OutputValue> {
        self.outputs.get(id)
    }

    /// Directory holding collected output files, if any were collected.
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_ref().map(TempDir::path)
    }
}

// =============================================================================
// Executor
// =============================================================================

/// Runs task specs on top of an [`Orchestrator`].
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    orchestrator: Orchestrator,
}

/// Pieces assembled during preparation and handed to the orchestrator.
#[derive(Default)]
struct Plumbing {
    connectors: Vec<StreamConnector>,
    stdin: Option<Box<dyn Reader>>,
    stdout: Option<Box<dyn Writer>>,
    stderr: Option<Box<dyn Writer>>,
    accumulated: OutputMap,
}

impl Plumbing {
    fn close(&mut self) {
        for connector in &mut self.connectors {
            if let Err(e) = connector.close() {
                warn!("Failed to close connector: {}", e);
            }
        }
    }
}

/// Tears a run's volumes down if `run_task` is dropped before it does.
struct TeardownGuard(VolumeSet);

impl Drop for TeardownGuard {
    fn drop(&mut self) {
        if let Err(e) = self.0.teardown() {
            warn!("Teardown of an abandoned task failed: {}", e);
        }
    }
}

impl TaskExecutor {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self { orchestrator }
    }

    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Runs one task invocation.
    pub async fn run_task(
        &self,
        task: &TaskSpec,
        inputs: &BTreeMap<String, InputBinding>,
        outputs: &BTreeMap<String, OutputBinding>,
        ctx: &RunContext,
    ) -> Result<TaskResult> {
        let config = self.orchestrator.config();
        task.validate(&config.data_volume)?;

        let tokens = self.token_context(task, inputs, outputs)?;
        let args = expand_args(&task.container_args, &tokens)?;
        debug!(image = %task.image, args = ?args, "Expanded container arguments");

        let mut volumes = TeardownGuard(VolumeSet::new(config));
        let data = volumes.0.temporary_at(config.data_volume.clone());

        let result = self
            .execute(task, inputs, outputs, ctx, args, &mut volumes.0, data)
            .await;

        match (result, volumes.0.teardown()) {
            (Ok(result), Ok(())) => Ok(result),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), teardown) => {
                if let Err(te) = teardown {
                    warn!("Teardown after failed task also failed: {}", te);
                }
                Err(e)
            }
        }
    }

    /// Builds the token context from the declared inputs and the bindings.
    fn token_context(
        &self,
        task: &TaskSpec,
        inputs: &BTreeMap<String, InputBinding>,
        outputs: &BTreeMap<String, OutputBinding>,
    ) -> Result<TokenContext> {
        let data_volume = &self.orchestrator.config().data_volume;
        let mut tokens = TokenContext::new(data_volume.clone());

        for input in &task.inputs {
            let Some(id) = input.key() else { continue };
            if let Some(arg) = &input.arg {
                tokens = tokens.with_flag_arg(id, arg.clone());
            }
            let Some(binding) = inputs.get(id) else {
                continue;
            };
            let value = match input.target {
                Target::Filepath if binding.is_direct() => {
                    Value::String(path_text(binding.direct_path.as_deref())?)
                }
                Target::Filepath => {
                    Value::String(join_container_path(data_volume, input_file_name(input, id)))
                }
                Target::Inline => match (&binding.data, &binding.path) {
                    (Some(data), _) => data.clone(),
                    (None, Some(path)) => Value::String(fs::read_to_string(path)?),
                    (None, None) => Value::Null,
                },
            };
            tokens = tokens.with_input(id, value);
        }

        for (id, binding) in outputs {
            tokens = tokens.with_output(id.clone(), binding.name.clone());
        }
        Ok(tokens)
    }

    #[allow(clippy::too_many_arguments)]
    async fn execute(
        &self,
        task: &TaskSpec,
        inputs: &BTreeMap<String, InputBinding>,
        outputs: &BTreeMap<String, OutputBinding>,
        ctx: &RunContext,
        args: Vec<String>,
        volumes: &mut VolumeSet,
        data: VolumeRef,
    ) -> Result<TaskResult> {
        let config = self.orchestrator.config();
        let data_dir = volumes.resolve(data)?;

        let mut plumbing = Plumbing::default();
        if let Err(e) = self
            .prepare(task, inputs, outputs, ctx, volumes, data, &data_dir, &mut plumbing)
            .await
        {
            plumbing.close();
            return Err(e);
        }

        let Plumbing {
            connectors,
            stdin,
            stdout,
            stderr,
            accumulated,
        } = plumbing;

        let mut spec = ContainerRunSpec::new(task.image.clone())
            .with_args(args)
            .with_mounts(volumes.mounts())
            .with_pull_image(task.pull_image)
            .with_remove_container(task.remove_container.unwrap_or(config.remove_container))
            .with_run_args(task.run_args.clone());
        if let Some(entrypoint) = &task.entrypoint {
            spec = spec.with_entrypoint(entrypoint.to_vec());
        }
        for connector in connectors {
            spec = spec.with_connector(connector);
        }
        spec.stdin = stdin;
        spec.stdout = stdout;
        spec.stderr = stderr;

        let outcome = self.orchestrator.run_container(spec, &ctx.cancel).await?;

        let mut result = TaskResult {
            container_id: outcome.container_id,
            canceled: outcome.canceled,
            outputs: BTreeMap::new(),
            output_dir: None,
        };
        let accumulated =
            std::mem::take(&mut *accumulated.lock().unwrap_or_else(PoisonError::into_inner));
        for (id, data) in accumulated {
            result.outputs.insert(id, OutputValue::Data(data));
        }

        if result.canceled {
            info!(container = %result.container_id, "Task canceled, skipping output collection");
            return Ok(result);
        }
        self.collect_outputs(task, outputs, &data_dir, &mut result)?;
        Ok(result)
    }

    #[allow(clippy::too_many_arguments)]
    async fn prepare(
        &self,
        task: &TaskSpec,
        inputs: &BTreeMap<String, InputBinding>,
        outputs: &BTreeMap<String, OutputBinding>,
        ctx: &RunContext,
        volumes: &mut VolumeSet,
        data: VolumeRef,
        data_dir: &ResolvedVolume,
        plumbing: &mut Plumbing,
    ) -> Result<()> {
        for input in &task.inputs {
            let Some(id) = input.key() else { continue };
            let Some(binding) = inputs.get(id) else {
                continue;
            };

            if id == STDIN_BINDING {
                plumbing.stdin = Some(if input.stream {
                    ctx.adapters.fetch_adapter(id, binding)?
                } else {
                    Box::new(MemoryReader::new(input_bytes(binding)?))
                });
                continue;
            }
            if input.target != Target::Filepath {
                continue;
            }

            let name = input_file_name(input, id);
            if input.stream {
                let source = ctx.adapters.fetch_adapter(id, binding)?;
                ensure_parent(&data_dir.host_join(name))?;
                let connector = PipeBinding::in_volume(name, data).connect_input(volumes, source)?;
                plumbing.connectors.push(connector);
            } else if binding.is_direct() {
                let path = path_text(binding.direct_path.as_deref())?;
                debug!(binding = %id, path = %path, "Mounting input in place");
                volumes.add_bind(Mount::read_only(path.clone(), path));
            } else {
                let target = data_dir.host_join(name);
                ensure_parent(&target)?;
                let source = ctx.adapters.fetch_adapter(id, binding)?;
                let written = self.write_input(source, &target).await?;
                debug!(binding = %id, path = %target.display(), written, "Materialized input");
            }
        }

        for output in &task.outputs {
            let Some(id) = output.key() else { continue };
            let Some(binding) = outputs.get(id) else {
                continue;
            };

            let sink: Box<dyn Writer> = if output.stream {
                ctx.adapters.push_adapter(id, binding)?
            } else if id == STDOUT_BINDING || id == STDERR_BINDING {
                Box::new(AccumulateAdapter::new(plumbing.accumulated.clone(), id))
            } else {
                continue;
            };

            match id {
                STDOUT_BINDING => plumbing.stdout = Some(sink),
                STDERR_BINDING => plumbing.stderr = Some(sink),
                _ => {
                    let name = output.path.as_deref().unwrap_or(id);
                    ensure_parent(&data_dir.host_join(name))?;
                    let connector = PipeBinding::in_volume(name, data).connect_output(volumes, sink)?;
                    plumbing.connectors.push(connector);
                }
            }
        }

        if task.progress_pipe
            && let Some(sink) = &ctx.progress
        {
            let connector = PipeBinding::in_volume(PROGRESS_PIPE_NAME, data)
                .connect_output(volumes, Box::new(ProgressAdapter::new(Arc::clone(sink))))?;
            plumbing.connectors.push(connector);
        }
        Ok(())
    }

    /// Drains a fetch adapter into a host file.
    async fn write_input(&self, mut source: Box<dyn Reader>, target: &Path) -> Result<usize> {
        let chunk_size = self.orchestrator.config().chunk_size;
        let poll_timeout = self.orchestrator.config().poll_timeout();
        let mut file = fs::File::create(target)?;
        let mut written = 0;

        source.open()?;
        let result = loop {
            match source.read(chunk_size) {
                Ok(Chunk::Data(buf)) => {
                    if let Err(e) = file.write_all(&buf) {
                        break Err(e.into());
                    }
                    written += buf.len();
                }
                Ok(Chunk::Pending) => tokio::time::sleep(poll_timeout).await,
                Ok(Chunk::Eof) => break Ok(written),
                Err(e) => break Err(e),
            }
        };
        source.close()?;
        result
    }

    /// Locates non-streaming filepath outputs and moves them out of the data
    /// volume before it is torn down.
    fn collect_outputs(
        &self,
        task: &TaskSpec,
        outputs: &BTreeMap<String, OutputBinding>,
        data_dir: &ResolvedVolume,
        result: &mut TaskResult,
    ) -> Result<()> {
        let config = self.orchestrator.config();

        for output in &task.outputs {
            let Some(id) = output.key() else { continue };
            if output.target != Target::Filepath || output.stream {
                continue;
            }
            let Some(binding) = outputs.get(id) else {
                continue;
            };

            let template = output
                .path
                .clone()
                .unwrap_or_else(|| format!("$output{{{id}}}"));
            let explicit = output.path.is_some();
            let path = substitute(&template, "output", |oid| {
                match outputs.get(oid).and_then(|b| b.name.clone()) {
                    Some(name) => Ok(name),
                    None if explicit => Err(Error::UnresolvedToken(format!("$output{{{oid}}}"))),
                    None => Ok(id.to_string()),
                }
            })?;

            let container_path = if path.starts_with('/') {
                path
            } else {
                join_container_path(&config.data_volume, &path)
            };
            let relative = Path::new(&container_path)
                .strip_prefix(&config.data_volume)
                .map_err(|_| Error::InvalidBinding {
                    id: id.to_string(),
                    reason: format!("output path {container_path} is outside the data volume"),
                })?;
            let host_path = data_dir.host_path.join(relative);
            if !host_path.exists() {
                return Err(Error::OutputMissing(host_path));
            }

            if result.output_dir.is_none() {
                let dir = tempfile::Builder::new()
                    .prefix(OUTPUT_DIR_PREFIX)
                    .tempdir_in(&config.tmp_root)?;
                result.output_dir = Some(dir);
            }
            let Some(output_dir) = result.output_dir.as_ref() else {
                return Err(Error::Internal("output directory missing".into()));
            };

            let file_name = host_path
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(id));
            let dest_dir = output_dir.path().join(id);
            fs::create_dir_all(&dest_dir)?;
            let dest = dest_dir.join(file_name);
            move_path(&host_path, &dest)?;
            debug!(
                binding = %id,
                name = binding.name.as_deref().unwrap_or("-"),
                path = %dest.display(),
                "Collected output"
            );
            result.outputs.insert(id.to_string(), OutputValue::File(dest));
        }
        Ok(())
    }
}

// =============================================================================
// Helpers
// =============================================================================

fn input_file_name<'a>(input: &'a TaskInput, id: &'a str) -> &'a str {
    input.path.as_deref().unwrap_or(id)
}

fn path_text(path: Option<&Path>) -> Result<String> {
    path.and_then(Path::to_str)
        .map(str::to_string)
        .ok_or_else(|| Error::Internal("direct path is not valid UTF-8".into()))
}

/// Bytes of a non-streaming input: inline data, or the bound host file.
fn input_bytes(binding: &InputBinding) -> Result<Vec<u8>> {
    if let Some(data) = binding.inline_bytes() {
        return Ok(data);
    }
    match &binding.path {
        Some(path) => Ok(fs::read(path)?),
        None => Ok(Vec::new()),
    }
}

fn ensure_parent(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.exists()
    {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

/// Renames `from` to `to`, copying regular files across filesystems.
fn move_path(from: &Path, to: &Path) -> Result<()> {
    match fs::rename(from, to) {
        Ok(()) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::EXDEV) && from.is_file() => {
            fs::copy(from, to)?;
            fs::remove_file(from)?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_input_bytes_prefers_inline() {
        assert_eq!(input_bytes(&InputBinding::inline("abc")).unwrap(), b"abc");
        assert!(input_bytes(&InputBinding::default()).unwrap().is_empty());
    }

    #[test]
    fn test_input_bytes_reads_local_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("stdin.txt");
        fs::write(&path, b"from disk").unwrap();
        assert_eq!(input_bytes(&InputBinding::local(&path)).unwrap(), b"from disk");
    }

    #[test]
    fn test_move_path_renames() {
        let temp = TempDir::new().unwrap();
        let from = temp.path().join("a");
        let to = temp.path().join("b");
        fs::write(&from, b"x").unwrap();
        move_path(&from, &to).unwrap();
        assert!(!from.exists());
        assert_eq!(fs::read(&to).unwrap(), b"x");
    }

    #[test]
    fn test_input_file_name_defaults_to_id() {
        let input = TaskInput {
            id: Some("table".into()),
            target: Target::Filepath,
            ..TaskInput::default()
        };
        assert_eq!(input_file_name(&input, "table"), "table");
    }
}
