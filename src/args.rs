//! Container argument expansion.
//!
//! Argument templates may reference bindings with three token kinds,
//! expanded in this order:
//!
//! | Token | Expands to | Unresolvable |
//! |-------|------------|--------------|
//! | `$input{id}` | the input's resolved value; `$input{_tempdir}` is the data volume | error |
//! | `$flag{id}` | the input's `arg` (or `id`) if the input is truthy, else nothing | nothing |
//! | `$output{id}` | `<data volume>/<output name>` | error |
//!
//! An argument that contains flag tokens and is empty once they are
//! expanded is dropped from the argument list. Falsy flags embedded in
//! longer arguments expand to nothing and the rest of the argument is kept.

use crate::constants::TEMPDIR_TOKEN_ID;
use crate::error::{Error, Result};
use crate::volume::join_container_path;
use serde_json::Value;
use std::collections::BTreeMap;

/// Values available to token expansion.
#[derive(Debug, Clone, Default)]
pub struct TokenContext {
    /// Resolved input values by id. Filepath inputs hold container paths.
    pub inputs: BTreeMap<String, Value>,
    /// `arg` overrides for `$flag{id}`.
    pub flag_args: BTreeMap<String, String>,
    /// Output names by id.
    pub outputs: BTreeMap<String, Option<String>>,
    /// Container path of the data volume.
    pub data_volume: String,
}

impl TokenContext {
    pub fn new(data_volume: impl Into<String>) -> Self {
        Self {
            data_volume: data_volume.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_input(mut self, id: impl Into<String>, value: impl Into<Value>) -> Self {
        self.inputs.insert(id.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_flag_arg(mut self, id: impl Into<String>, arg: impl Into<String>) -> Self {
        self.flag_args.insert(id.into(), arg.into());
        self
    }

    #[must_use]
    pub fn with_output(mut self, id: impl Into<String>, name: Option<String>) -> Self {
        self.outputs.insert(id.into(), name);
        self
    }

    /// Expands one argument. Returns `None` if the argument is dropped.
    pub fn expand(&self, arg: &str) -> Result<Option<String>> {
        let arg = substitute(arg, "input", |id| {
            if let Some(value) = self.inputs.get(id) {
                Ok(value_text(value))
            } else if id == TEMPDIR_TOKEN_ID {
                Ok(self.data_volume.clone())
            } else {
                Err(Error::UnresolvedToken(format!("$input{{{id}}}")))
            }
        })?;

        let mut has_flag = false;
        let arg = substitute(&arg, "flag", |id| {
            has_flag = true;
            match self.inputs.get(id) {
                Some(value) if is_truthy(value) => Ok(self
                    .flag_args
                    .get(id)
                    .cloned()
                    .unwrap_or_else(|| id.to_string())),
                _ => Ok(String::new()),
            }
        })?;
        if has_flag && arg.is_empty() {
            return Ok(None);
        }

        let arg = substitute(&arg, "output", |id| match self.outputs.get(id) {
            Some(Some(name)) => Ok(join_container_path(&self.data_volume, name)),
            _ => Err(Error::UnresolvedToken(format!("$output{{{id}}}"))),
        })?;
        Ok(Some(arg))
    }
}

/// Expands every argument, dropping those emptied by falsy flags.
pub fn expand_args(args: &[String], ctx: &TokenContext) -> Result<Vec<String>> {
    let mut expanded = Vec::with_capacity(args.len());
    for arg in args {
        if let Some(arg) = ctx.expand(arg)? {
            expanded.push(arg);
        }
    }
    Ok(expanded)
}

/// Replaces every `$kind{id}` in `s` with `resolve(id)`.
///
/// Text that does not form a complete token is kept as is.
pub(crate) fn substitute<F>(s: &str, kind: &str, mut resolve: F) -> Result<String>
where
    F: FnMut(&str) -> Result<String>,
{
    let open = format!("${kind}{{");
    let mut out = String::with_capacity(s.len());
    let mut rest = s;

    while let Some(start) = rest.find(&open) {
        let after = &rest[start + open.len()..];
        match after.find('}') {
            Some(end) if end > 0 => {
                out.push_str(&rest[..start]);
                out.push_str(&resolve(&after[..end])?);
                rest = &after[end + 1..];
            }
            _ => {
                out.push_str(&rest[..start + open.len()]);
                rest = after;
            }
        }
    }
    out.push_str(rest);
    Ok(out)
}

/// Textual form of a value inside an argument.
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// JSON truthiness: `null`, `false`, `0`, `""`, `[]` and `{}` are falsy.
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}
