//! Tests for task spec parsing and validation.

use magikworker::task::{Target, TaskOutput, TaskSpec};
use magikworker::{DATA_VOLUME, Error};

fn spec(yaml: &str) -> TaskSpec {
    TaskSpec::from_yaml(yaml).unwrap()
}

// =============================================================================
// Parsing Tests
// =============================================================================

#[test]
fn test_full_spec_parses() {
    let task = spec(
        r#"
image: example/word-count:latest
container_args: ["--in", "$input{text}"]
entrypoint: ["python", "-m", "wc"]
pull_image: false
progress_pipe: true
remove_container: true
run_args:
  network: none
inputs:
  - id: text
    target: filepath
    path: text.txt
  - name: verbose
    arg: "-v"
outputs:
  - id: counts
    target: filepath
  - id: _stdout
"#,
    );

    assert_eq!(task.image, "example/word-count:latest");
    assert!(!task.pull_image);
    assert!(task.progress_pipe);
    assert_eq!(task.remove_container, Some(true));
    assert_eq!(task.run_args["network"], "none");
    assert_eq!(task.entrypoint.as_ref().unwrap().to_vec(), vec!["python", "-m", "wc"]);
    assert_eq!(task.input("text").unwrap().target, Target::Filepath);
    assert_eq!(task.input("verbose").unwrap().arg.as_deref(), Some("-v"));
    assert!(task.output("_stdout").is_some());
    assert!(task.output("missing").is_none());
}

#[test]
fn test_malformed_spec_is_serialization_error() {
    let err = TaskSpec::from_json("{\"container_args\": []}").unwrap_err();
    assert!(matches!(err, Error::Serialization(_)));
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_valid_outputs() {
    let task = spec(
        r#"
image: a
outputs:
  - id: _stdout
  - id: _stderr
  - id: relative
    target: filepath
    path: out/relative.txt
  - id: absolute
    target: filepath
    path: /mnt/magikworker/data/absolute.txt
  - id: templated
    target: filepath
    path: $output{templated}
"#,
    );
    task.validate(DATA_VOLUME).unwrap();
}

#[test]
fn test_inline_output_other_than_std_streams_rejected() {
    let task = spec("image: a\noutputs:\n  - id: table\n");
    let err = task.validate(DATA_VOLUME).unwrap_err();
    assert!(matches!(err, Error::InvalidBinding { ref id, .. } if id == "table"));
    assert!(err.is_configuration());
}

#[test]
fn test_absolute_output_outside_data_volume_rejected() {
    let task = spec("image: a\noutputs:\n  - id: x\n    target: filepath\n    path: /etc/passwd\n");
    assert!(matches!(
        task.validate(DATA_VOLUME),
        Err(Error::InvalidBinding { .. })
    ));

    // A sibling directory sharing the prefix is still outside.
    let task = spec(
        "image: a\noutputs:\n  - id: x\n    target: filepath\n    path: /mnt/magikworker/database\n",
    );
    assert!(task.validate(DATA_VOLUME).is_err());
}

#[test]
fn test_absolute_streaming_paths_rejected() {
    let task = spec(
        "image: a\ninputs:\n  - id: s\n    target: filepath\n    stream: true\n    path: /abs\n",
    );
    assert!(matches!(
        task.validate(DATA_VOLUME),
        Err(Error::AbsoluteStreamPath { ref id, ref path }) if id == "s" && path == "/abs"
    ));

    let task = spec(
        "image: a\noutputs:\n  - id: s\n    target: filepath\n    stream: true\n    path: /mnt/magikworker/data/s\n",
    );
    assert!(matches!(
        task.validate(DATA_VOLUME),
        Err(Error::AbsoluteStreamPath { .. })
    ));
}

#[test]
fn test_binding_without_key_rejected() {
    let mut task = TaskSpec::new("a");
    task.outputs.push(TaskOutput {
        target: Target::Filepath,
        ..TaskOutput::default()
    });
    assert!(matches!(
        task.validate(DATA_VOLUME),
        Err(Error::InvalidBinding { .. })
    ));
}
