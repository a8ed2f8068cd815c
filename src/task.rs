//! Task specifications and runtime bindings.
//!
//! A [`TaskSpec`] describes what a task declares: its image, argument
//! template, and the inputs/outputs it accepts. Runtime bindings
//! ([`InputBinding`], [`OutputBinding`]) describe what one invocation
//! supplies for each declared id.
//!
//! ```yaml
//! image: example/word-count:latest
//! container_args: ["--in", "$input{text}", "--out", "$output{counts}", "$flag{verbose}"]
//! progress_pipe: true
//! inputs:
//!   - id: text
//!     target: filepath
//!   - id: verbose
//!     arg: "-v"
//! outputs:
//!   - id: counts
//!     target: filepath
//!   - id: _stdout
//! ```

use crate::constants::{STDERR_BINDING, STDOUT_BINDING};
use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

// =============================================================================
// Declared Bindings
// =============================================================================

/// Where a binding's data lives from the container's point of view.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
    /// The value itself (or a standard stream's bytes).
    #[default]
    #[serde(alias = "memory")]
    Inline,
    /// A file inside the data volume.
    Filepath,
}

/// A declared task input.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskInput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub target: Target,
    pub stream: bool,
    /// File name (relative to the data volume) for filepath targets.
    pub path: Option<String>,
    /// Text substituted for `$flag{id}` when the input is truthy.
    pub arg: Option<String>,
}

impl TaskInput {
    /// The binding id: `id`, falling back to `name`.
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }

    pub fn is_streaming_filepath(&self) -> bool {
        self.stream && self.target == Target::Filepath
    }
}

/// A declared task output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TaskOutput {
    pub id: Option<String>,
    pub name: Option<String>,
    pub target: Target,
    pub stream: bool,
    /// Output location; may contain `$output{..}` tokens.
    pub path: Option<String>,
}

impl TaskOutput {
    pub fn key(&self) -> Option<&str> {
        self.id.as_deref().or(self.name.as_deref())
    }

    pub fn is_streaming_filepath(&self) -> bool {
        self.stream && self.target == Target::Filepath
    }
}

/// Container entrypoint, given as a single string or a list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Entrypoint {
    One(String),
    Many(Vec<String>),
}

impl Entrypoint {
    pub fn to_vec(&self) -> Vec<String> {
        match self {
            Self::One(cmd) => vec![cmd.clone()],
            Self::Many(cmd) => cmd.clone(),
        }
    }
}

fn default_pull_image() -> bool {
    true
}

/// A container task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskSpec {
    pub image: String,
    #[serde(default)]
    pub container_args: Vec<String>,
    #[serde(default)]
    pub entrypoint: Option<Entrypoint>,
    #[serde(default = "default_pull_image")]
    pub pull_image: bool,
    /// Create a `.progress` FIFO for structured progress messages.
    #[serde(default)]
    pub progress_pipe: bool,
    /// Remove the container afterwards; `None` defers to the worker config.
    #[serde(default)]
    pub remove_container: Option<bool>,
    /// Extra runtime options passed to the container runtime.
    #[serde(default)]
    pub run_args: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    pub inputs: Vec<TaskInput>,
    #[serde(default)]
    pub outputs: Vec<TaskOutput>,
}

impl TaskSpec {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            container_args: Vec::new(),
            entrypoint: None,
            pull_image: true,
            progress_pipe: false,
            remove_container: None,
            run_args: BTreeMap::new(),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn from_yaml(s: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json(s: &str) -> Result<Self> {
        Ok(serde_json::from_str(s)?)
    }

    pub fn input(&self, id: &str) -> Option<&TaskInput> {
        self.inputs.iter().find(|i| i.key() == Some(id))
    }

    pub fn output(&self, id: &str) -> Option<&TaskOutput> {
        self.outputs.iter().find(|o| o.key() == Some(id))
    }

    /// Checks the declared bindings before anything is fetched or created.
    ///
    /// - every binding has an id or a name;
    /// - streaming filepath bindings use relative paths;
    /// - an output is `_stdout`, `_stderr` or a filepath target;
    /// - an absolute filepath output lies under `data_volume`.
    pub fn validate(&self, data_volume: &str) -> Result<()> {
        for input in &self.inputs {
            let id = require_key(input.key())?;
            if input.is_streaming_filepath() {
                check_relative_stream_path(id, input.path.as_deref())?;
            }
        }

        let prefix = format!("{}/", data_volume.trim_end_matches('/'));
        for output in &self.outputs {
            let id = require_key(output.key())?;
            match output.target {
                Target::Filepath => {
                    if output.stream {
                        check_relative_stream_path(id, output.path.as_deref())?;
                    }
                    let path = output.path.as_deref().unwrap_or(id);
                    if path.starts_with('/') && !path.starts_with(&prefix) {
                        return Err(Error::InvalidBinding {
                            id: id.to_string(),
                            reason: format!(
                                "filepath outputs must start with \"{prefix}\" or be relative to it"
                            ),
                        });
                    }
                }
                Target::Inline if id == STDOUT_BINDING || id == STDERR_BINDING => {}
                Target::Inline => {
                    return Err(Error::InvalidBinding {
                        id: id.to_string(),
                        reason: format!(
                            "outputs must be \"{STDOUT_BINDING}\", \"{STDERR_BINDING}\" or filepath targets"
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

fn require_key(key: Option<&str>) -> Result<&str> {
    key.ok_or_else(|| Error::InvalidBinding {
        id: String::new(),
        reason: "binding has neither id nor name".into(),
    })
}

fn check_relative_stream_path(id: &str, path: Option<&str>) -> Result<()> {
    let path = path.unwrap_or(id);
    if Path::new(path).is_absolute() {
        return Err(Error::AbsoluteStreamPath {
            id: id.to_string(),
            path: path.to_string(),
        });
    }
    Ok(())
}

// =============================================================================
// Runtime Bindings
// =============================================================================

fn default_mode() -> String {
    "inline".to_string()
}

/// What one invocation supplies for a declared input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InputBinding {
    /// Data source kind, interpreted by the adapter factory.
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Inline value.
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Host file holding the value.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// Host path the worker may mount read-only instead of copying.
    #[serde(default)]
    pub direct_path: Option<PathBuf>,
}

impl Default for InputBinding {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            data: None,
            path: None,
            direct_path: None,
        }
    }
}

impl InputBinding {
    /// An inline value.
    pub fn inline(data: impl Into<serde_json::Value>) -> Self {
        Self {
            data: Some(data.into()),
            ..Self::default()
        }
    }

    /// A host file.
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: "local".to_string(),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Marks the host file as mountable in place.
    #[must_use]
    pub fn with_direct_path(mut self, direct_path: impl Into<PathBuf>) -> Self {
        self.direct_path = Some(direct_path.into());
        self
    }

    /// Returns true if the host file can be mounted instead of copied.
    pub fn is_direct(&self) -> bool {
        matches!((&self.direct_path, &self.path), (Some(d), Some(p)) if d == p)
    }

    /// Inline data as bytes. Strings are taken verbatim, other values are
    /// JSON-encoded.
    pub fn inline_bytes(&self) -> Option<Vec<u8>> {
        match self.data.as_ref()? {
            serde_json::Value::String(s) => Some(s.clone().into_bytes()),
            other => Some(other.to_string().into_bytes()),
        }
    }
}

/// What one invocation supplies for a declared output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputBinding {
    #[serde(default = "default_mode")]
    pub mode: String,
    /// File name substituted for `$output{id}`.
    #[serde(default)]
    pub name: Option<String>,
    /// Host destination for streamed data.
    #[serde(default)]
    pub path: Option<PathBuf>,
    /// HTTP endpoint receiving streamed data as a chunked upload.
    #[serde(default)]
    pub url: Option<String>,
    /// Extra request headers for `url`.
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl Default for OutputBinding {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            name: None,
            path: None,
            url: None,
            headers: BTreeMap::new(),
        }
    }
}

impl OutputBinding {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            mode: "local".to_string(),
            path: Some(path.into()),
            ..Self::default()
        }
    }

    /// Streams to an HTTP endpoint.
    pub fn url(url: impl Into<String>) -> Self {
        Self {
            mode: "url".to_string(),
            url: Some(url.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entrypoint_one_or_many() {
        let spec = TaskSpec::from_json(r#"{"image": "a", "entrypoint": "sh"}"#).unwrap();
        assert_eq!(spec.entrypoint.unwrap().to_vec(), vec!["sh"]);
        let spec = TaskSpec::from_json(r#"{"image": "a", "entrypoint": ["sh", "-c"]}"#).unwrap();
        assert_eq!(spec.entrypoint.unwrap().to_vec(), vec!["sh", "-c"]);
    }

    #[test]
    fn test_defaults() {
        let spec = TaskSpec::from_yaml("image: alpine\n").unwrap();
        assert!(spec.pull_image);
        assert!(!spec.progress_pipe);
        assert_eq!(spec.remove_container, None);
        assert_eq!(InputBinding::default().mode, "inline");
    }

    #[test]
    fn test_memory_target_alias() {
        let input: TaskInput = serde_json::from_str(r#"{"id": "x", "target": "memory"}"#).unwrap();
        assert_eq!(input.target, Target::Inline);
    }

    #[test]
    fn test_key_falls_back_to_name() {
        let input = TaskInput {
            name: Some("n".into()),
            ..TaskInput::default()
        };
        assert_eq!(input.key(), Some("n"));
    }

    #[test]
    fn test_inline_bytes() {
        assert_eq!(InputBinding::inline("abc").inline_bytes().unwrap(), b"abc");
        assert_eq!(InputBinding::inline(42).inline_bytes().unwrap(), b"42");
        assert_eq!(InputBinding::default().inline_bytes(), None);
    }

    #[test]
    fn test_is_direct() {
        let binding = InputBinding::local("/data/a").with_direct_path("/data/a");
        assert!(binding.is_direct());
        let binding = InputBinding::local("/tmp/copy").with_direct_path("/data/a");
        assert!(!binding.is_direct());
    }
}
