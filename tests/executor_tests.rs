//! Tests for task execution.
//!
//! Runs whole task specs through `TaskExecutor` with an in-process runtime
//! and checks argument expansion, input materialization, streaming bindings,
//! progress reporting, output collection and volume teardown.

mod common;

use common::FakeRuntime;
use magikworker::adapters::{ProgressSink, ProgressUpdate};
use magikworker::executor::{OutputValue, RunContext, TaskExecutor};
use magikworker::orchestrator::{CancelFlag, Orchestrator};
use magikworker::task::{InputBinding, OutputBinding, TaskSpec};
use magikworker::{DATA_VOLUME, Error, WorkerConfig};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

fn executor(runtime: &Arc<FakeRuntime>, temp: &TempDir) -> TaskExecutor {
    let config = WorkerConfig::default()
        .with_tmp_root(temp.path())
        .with_poll_timeout(Duration::from_millis(10));
    TaskExecutor::new(Orchestrator::new(runtime.clone(), config))
}

fn data_volume_host_dir(runtime: &FakeRuntime) -> PathBuf {
    runtime
        .last_request()
        .unwrap()
        .mounts
        .into_iter()
        .find(|m| m.container_path == DATA_VOLUME)
        .unwrap()
        .host_path
}

fn bindings<T: Clone>(pairs: &[(&str, T)]) -> BTreeMap<String, T> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

#[derive(Default)]
struct RecordingSink {
    updates: Mutex<Vec<ProgressUpdate>>,
}

impl ProgressSink for RecordingSink {
    fn update_progress(&self, update: ProgressUpdate) {
        self.updates.lock().unwrap().push(update);
    }
}

// =============================================================================
// Argument Expansion Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_args_are_expanded_before_run() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|_| {}));
    let task = TaskSpec::from_yaml(
        r#"
image: example/tool
pull_image: false
container_args: ["--name", "$input{name}", "$flag{verbose}", "$flag{quiet}", "--out=$output{report}"]
inputs:
  - id: name
  - id: verbose
    arg: "-v"
  - id: quiet
    arg: "-q"
outputs:
  - id: report
    target: filepath
"#,
    )
    .unwrap();

    let inputs = bindings(&[
        ("name", InputBinding::inline("world")),
        ("verbose", InputBinding::inline(true)),
        ("quiet", InputBinding::inline(false)),
    ]);
    let outputs = BTreeMap::new();
    // `report` is declared but unbound, so `$output{report}` is unresolved.
    let err = executor(&runtime, &temp)
        .run_task(&task, &inputs, &outputs, &RunContext::default())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnresolvedToken(_)));
    assert!(err.is_configuration());
    assert!(runtime.calls().is_empty());

    let outputs = bindings(&[("report", OutputBinding::named("report.txt"))]);
    let runtime = Arc::new(FakeRuntime::new(|c| {
        let path = c.host_path(&format!("{DATA_VOLUME}/report.txt"));
        std::fs::write(path, b"ok").unwrap();
    }));
    executor(&runtime, &temp)
        .run_task(&task, &inputs, &outputs, &RunContext::default())
        .await
        .unwrap();

    let request = runtime.last_request().unwrap();
    assert_eq!(
        request.args,
        vec![
            "--name".to_string(),
            "world".to_string(),
            "-v".to_string(),
            format!("--out={DATA_VOLUME}/report.txt"),
        ]
    );
}

#[tokio::test(flavor = "multi_thread")]
async fn test_invalid_output_rejected_before_anything_runs() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|_| {}));
    let task = TaskSpec::from_json(
        r#"{"image": "a", "outputs": [{"id": "table", "target": "inline"}]}"#,
    )
    .unwrap();

    let err = executor(&runtime, &temp)
        .run_task(&task, &BTreeMap::new(), &BTreeMap::new(), &RunContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::InvalidBinding { .. }));
    assert!(runtime.calls().is_empty());
    assert_eq!(std::fs::read_dir(temp.path()).unwrap().count(), 0);
}

// =============================================================================
// Input Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_filepath_input_and_stdout_accumulation() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|c| {
        let contents = std::fs::read(c.host_path(&c.request.args[0])).unwrap();
        c.write_stdout(&contents);
        c.write_stderr(b"done");
    }));
    let task = TaskSpec::from_yaml(
        r#"
image: example/cat
container_args: ["$input{text}"]
inputs:
  - id: text
    target: filepath
    path: nested/input.txt
outputs:
  - id: _stdout
  - id: _stderr
"#,
    )
    .unwrap();

    let inputs = bindings(&[("text", InputBinding::inline("file contents"))]);
    let outputs = bindings(&[
        ("_stdout", OutputBinding::default()),
        ("_stderr", OutputBinding::default()),
    ]);
    let result = executor(&runtime, &temp)
        .run_task(&task, &inputs, &outputs, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(
        runtime.last_request().unwrap().args,
        vec![format!("{DATA_VOLUME}/nested/input.txt")]
    );
    assert_eq!(
        result.output("_stdout"),
        Some(&OutputValue::Data(b"file contents".to_vec()))
    );
    assert_eq!(result.output("_stderr"), Some(&OutputValue::Data(b"done".to_vec())));
    assert!(!data_volume_host_dir(&runtime).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_direct_path_input_is_bind_mounted() {
    let temp = TempDir::new().unwrap();
    let source = temp.path().join("dataset.csv");
    std::fs::write(&source, b"a,b\n1,2\n").unwrap();

    let runtime = Arc::new(FakeRuntime::new(|_| {}));
    let task = TaskSpec::from_yaml(
        r#"
image: example/tool
container_args: ["$input{table}"]
inputs:
  - id: table
    target: filepath
"#,
    )
    .unwrap();

    let inputs = bindings(&[(
        "table",
        InputBinding::local(&source).with_direct_path(&source),
    )]);
    executor(&runtime, &temp)
        .run_task(&task, &inputs, &BTreeMap::new(), &RunContext::default())
        .await
        .unwrap();

    let request = runtime.last_request().unwrap();
    let source_text = source.to_str().unwrap().to_string();
    assert_eq!(request.args, vec![source_text.clone()]);
    let mount = request
        .mounts
        .iter()
        .find(|m| m.host_path == source)
        .expect("direct path should be mounted");
    assert_eq!(mount.container_path, source_text);
    assert_eq!(mount.mode, magikworker::VolumeMode::ReadOnly);
    assert!(source.exists(), "direct inputs are never moved or removed");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stdin_from_inline_input() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|c| {
        let mut input = String::new();
        c.stdin.as_mut().unwrap().read_to_string(&mut input).unwrap();
        c.write_stdout(input.to_uppercase().as_bytes());
    }));
    let task = TaskSpec::from_yaml(
        r#"
image: example/upper
inputs:
  - id: _stdin
outputs:
  - id: _stdout
"#,
    )
    .unwrap();

    let inputs = bindings(&[("_stdin", InputBinding::inline("shout"))]);
    let outputs = bindings(&[("_stdout", OutputBinding::default())]);
    let result = executor(&runtime, &temp)
        .run_task(&task, &inputs, &outputs, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(result.output("_stdout"), Some(&OutputValue::Data(b"SHOUT".to_vec())));
}

// =============================================================================
// Streaming Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_streaming_input_and_output_fifos() {
    let temp = TempDir::new().unwrap();
    let sink_path = temp.path().join("streamed.out");

    let runtime = Arc::new(FakeRuntime::new(|c| {
        let mut data = Vec::new();
        std::fs::File::open(c.host_path(&c.request.args[0]))
            .unwrap()
            .read_to_end(&mut data)
            .unwrap();
        let mut out = std::fs::OpenOptions::new()
            .write(true)
            .open(c.host_path(&c.request.args[1]))
            .unwrap();
        out.write_all(&data).unwrap();
        out.write_all(b"!").unwrap();
    }));
    let task = TaskSpec::from_yaml(
        r#"
image: example/stream
container_args: ["$input{source}", "$input{_tempdir}/sink.fifo"]
inputs:
  - id: source
    target: filepath
    stream: true
    path: source.fifo
outputs:
  - id: sink
    target: filepath
    stream: true
    path: sink.fifo
"#,
    )
    .unwrap();

    let inputs = bindings(&[("source", InputBinding::inline("flowing bytes"))]);
    let outputs = bindings(&[("sink", OutputBinding::local(&sink_path))]);
    let result = executor(&runtime, &temp)
        .run_task(&task, &inputs, &outputs, &RunContext::default())
        .await
        .unwrap();

    assert_eq!(std::fs::read(&sink_path).unwrap(), b"flowing bytes!");
    assert!(result.output("sink").is_none(), "streamed outputs are not collected");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_absolute_streaming_path_rejected() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|_| {}));
    let task = TaskSpec::from_yaml(
        r#"
image: example/stream
inputs:
  - id: source
    target: filepath
    stream: true
    path: /abs/source.fifo
"#,
    )
    .unwrap();

    let inputs = bindings(&[("source", InputBinding::inline("x"))]);
    let err = executor(&runtime, &temp)
        .run_task(&task, &inputs, &BTreeMap::new(), &RunContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::AbsoluteStreamPath { .. }));
    assert!(runtime.calls().is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_progress_pipe_reports_updates() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|c| {
        let path = c.host_path(&format!("{DATA_VOLUME}/.progress"));
        let mut pipe = std::fs::OpenOptions::new().write(true).open(path).unwrap();
        pipe.write_all(b"{\"total\": 4, \"current\": 1, \"message\": \"start\"}\n")
            .unwrap();
        pipe.write_all(b"not json\n").unwrap();
        pipe.write_all(b"{\"total\": 4, \"current\": 4}\n").unwrap();
    }));
    let task = TaskSpec::from_yaml("image: example/progress\nprogress_pipe: true\n").unwrap();

    let sink = Arc::new(RecordingSink::default());
    let ctx = RunContext::default().with_progress(sink.clone());
    executor(&runtime, &temp)
        .run_task(&task, &BTreeMap::new(), &BTreeMap::new(), &ctx)
        .await
        .unwrap();

    let updates = sink.updates.lock().unwrap();
    assert_eq!(updates.len(), 2);
    assert_eq!(updates[0].message.as_deref(), Some("start"));
    assert_eq!(updates[0].current, Some(1.0));
    assert_eq!(updates[1].current, Some(4.0));
    assert_eq!(updates[1].total, Some(4.0));
}

// =============================================================================
// Output Collection Tests
// =============================================================================

#[tokio::test(flavor = "multi_thread")]
async fn test_filepath_output_survives_teardown() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|c| {
        let path = c.host_path(&c.request.args[0]);
        std::fs::write(path, b"42 words").unwrap();
    }));
    let task = TaskSpec::from_yaml(
        r#"
image: example/wc
container_args: ["$output{counts}"]
outputs:
  - id: counts
    target: filepath
"#,
    )
    .unwrap();

    let outputs = bindings(&[("counts", OutputBinding::named("counts.txt"))]);
    let result = executor(&runtime, &temp)
        .run_task(&task, &BTreeMap::new(), &outputs, &RunContext::default())
        .await
        .unwrap();

    let Some(OutputValue::File(path)) = result.output("counts") else {
        panic!("expected a collected file");
    };
    assert_eq!(std::fs::read(path).unwrap(), b"42 words");
    assert!(path.ends_with("counts/counts.txt"));
    assert!(!data_volume_host_dir(&runtime).exists());

    let output_dir = result.output_dir().unwrap().to_path_buf();
    drop(result);
    assert!(!output_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_missing_output_fails_and_tears_down() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|_| {}));
    let task = TaskSpec::from_yaml(
        r#"
image: example/lazy
outputs:
  - id: result
    target: filepath
    path: result.bin
"#,
    )
    .unwrap();

    let outputs = bindings(&[("result", OutputBinding::default())]);
    let err = executor(&runtime, &temp)
        .run_task(&task, &BTreeMap::new(), &outputs, &RunContext::default())
        .await
        .unwrap_err();

    assert!(matches!(err, Error::OutputMissing(_)));
    assert!(!data_volume_host_dir(&runtime).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_canceled_task_skips_collection() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(FakeRuntime::new(|c| c.wait_for_stop()));
    let task = TaskSpec::from_yaml(
        r#"
image: example/slow
outputs:
  - id: result
    target: filepath
"#,
    )
    .unwrap();

    let cancel = CancelFlag::new();
    cancel.cancel();
    let outputs = bindings(&[("result", OutputBinding::named("result.txt"))]);
    let ctx = RunContext::default().with_cancel(cancel);
    let result = executor(&runtime, &temp)
        .run_task(&task, &BTreeMap::new(), &outputs, &ctx)
        .await
        .unwrap();

    assert!(result.canceled);
    assert!(result.outputs.is_empty());
    assert_eq!(runtime.count("stop"), 1);
    assert!(!data_volume_host_dir(&runtime).exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_dropped_task_tears_down_volumes() {
    let temp = TempDir::new().unwrap();
    let runtime = Arc::new(
        FakeRuntime::new(|c| {
            while !c.is_stopped() {
                if c.stdout.write_all(b"busy\n").is_err() {
                    break;
                }
                std::thread::sleep(Duration::from_millis(2));
            }
        })
        .raw_streams(),
    );
    let task = TaskSpec::from_yaml("image: example/forever\noutputs:\n  - id: _stdout\n").unwrap();

    let outputs = bindings(&[("_stdout", OutputBinding::default())]);
    let worker = executor(&runtime, &temp);
    let files = BTreeMap::new();
    let ctx = RunContext::default();
    let run = worker.run_task(&task, &files, &outputs, &ctx);
    assert!(
        tokio::time::timeout(Duration::from_millis(100), run)
            .await
            .is_err()
    );

    assert!(runtime.last_request().is_some());
    assert!(!data_volume_host_dir(&runtime).exists());
}
