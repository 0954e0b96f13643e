use ptyhost_common::error::{PtyError, Result};
use ptyhost_common::types::{Encoding, Size};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::PathBuf;
use tracing::warn;

use crate::flow::FlowControlConfig;

/// Arguments passed to the spawned program
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Args {
    Argv(Vec<String>),
    /// Pre-escaped command line. Only accepted on Windows.
    CommandLine(String),
}

impl Default for Args {
    fn default() -> Self {
        Args::Argv(Vec::new())
    }
}

impl From<Vec<String>> for Args {
    fn from(argv: Vec<String>) -> Self {
        Args::Argv(argv)
    }
}

impl From<&[&str]> for Args {
    fn from(argv: &[&str]) -> Self {
        Args::Argv(argv.iter().map(|s| s.to_string()).collect())
    }
}

/// Options recognized when spawning a terminal
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TerminalOptions {
    /// Terminal name, exported as `TERM` on Unix.
    pub name: Option<String>,
    pub size: Size,
    pub cwd: Option<PathBuf>,
    /// Child environment. `None` inherits the current process environment.
    pub env: Option<HashMap<String, String>>,
    /// Unix only.
    pub uid: Option<u32>,
    /// Unix only.
    pub gid: Option<u32>,
    /// Unix only; ignored with a warning elsewhere.
    pub encoding: Option<Encoding>,
    pub flow_control: FlowControlConfig,
    /// Windows backend selection. `None` picks automatically.
    pub use_conpty: Option<bool>,
}

impl TerminalOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn size(mut self, cols: u16, rows: u16) -> Self {
        self.size = Size::new(cols, rows);
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = Some(encoding);
        self
    }

    pub fn flow_control(mut self, pause: impl Into<Vec<u8>>, resume: impl Into<Vec<u8>>) -> Self {
        self.flow_control = FlowControlConfig::enabled(pause, resume);
        self
    }

    /// Check invariants that static types cannot express.
    pub fn validate(&self) -> Result<()> {
        if !self.size.is_valid() {
            return Err(PtyError::InvalidArgument(format!(
                "cols and rows must be positive, got {}",
                self.size
            )));
        }
        let flow = &self.flow_control;
        if flow.enabled && (flow.pause.is_empty() || flow.resume.is_empty()) {
            return Err(PtyError::InvalidArgument(
                "flow control markers must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    /// The environment the child will see.
    pub fn resolved_env(&self) -> HashMap<String, String> {
        match &self.env {
            Some(env) => env.clone(),
            None => std::env::vars().collect(),
        }
    }

    /// The working directory the child will start in.
    pub fn resolved_cwd(&self) -> Result<PathBuf> {
        match &self.cwd {
            Some(cwd) => Ok(cwd.clone()),
            None => Ok(std::env::current_dir()?),
        }
    }

    /// Build options from untyped configuration such as a JSON file.
    ///
    /// Keys follow the camelCase names used by JavaScript callers
    /// (`handleFlowControl`, `flowControlPause`, ...). `null` means absent.
    pub fn from_json(value: &Value) -> Result<Self> {
        let object = value.as_object().ok_or_else(|| mismatch("options", "object", value))?;
        let mut options = TerminalOptions::default();
        let mut cols = None;
        let mut rows = None;
        let mut pause = None;
        let mut resume = None;

        for (key, value) in object {
            if value.is_null() {
                continue;
            }
            match key.as_str() {
                "name" => options.name = Some(expect_str(key, value)?.to_string()),
                "cols" => cols = Some(expect_dimension(key, value)?),
                "rows" => rows = Some(expect_dimension(key, value)?),
                "cwd" => options.cwd = Some(PathBuf::from(expect_str(key, value)?)),
                "env" => options.env = Some(expect_env(value)?),
                "uid" => options.uid = Some(expect_u32(key, value)?),
                "gid" => options.gid = Some(expect_u32(key, value)?),
                "encoding" => options.encoding = Some(expect_str(key, value)?.parse()?),
                "handleFlowControl" => options.flow_control.enabled = expect_bool(key, value)?,
                "flowControlPause" => pause = Some(expect_str(key, value)?.as_bytes().to_vec()),
                "flowControlResume" => resume = Some(expect_str(key, value)?.as_bytes().to_vec()),
                "useConpty" | "experimentalUseConpty" => {
                    options.use_conpty = Some(expect_bool(key, value)?)
                }
                other => warn!("Ignoring unknown terminal option: {}", other),
            }
        }

        options.size = Size::new(
            cols.unwrap_or(Size::DEFAULT_COLS),
            rows.unwrap_or(Size::DEFAULT_ROWS),
        );
        if let Some(pause) = pause {
            options.flow_control.pause = pause;
        }
        if let Some(resume) = resume {
            options.flow_control.resume = resume;
        }
        options.validate()?;
        Ok(options)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn mismatch(field: &str, expected: &'static str, value: &Value) -> PtyError {
    PtyError::InvalidType {
        field: field.to_string(),
        expected,
        found: json_type(value),
    }
}

fn expect_str<'a>(field: &str, value: &'a Value) -> Result<&'a str> {
    value.as_str().ok_or_else(|| mismatch(field, "string", value))
}

fn expect_bool(field: &str, value: &Value) -> Result<bool> {
    value.as_bool().ok_or_else(|| mismatch(field, "boolean", value))
}

fn expect_u32(field: &str, value: &Value) -> Result<u32> {
    let n = value.as_u64().ok_or_else(|| mismatch(field, "number", value))?;
    u32::try_from(n).map_err(|_| PtyError::InvalidArgument(format!("{field} is out of range: {n}")))
}

fn expect_dimension(field: &str, value: &Value) -> Result<u16> {
    if !value.is_number() {
        return Err(mismatch(field, "number", value));
    }
    match value.as_u64().and_then(|n| u16::try_from(n).ok()) {
        Some(n) if n > 0 => Ok(n),
        _ => Err(PtyError::InvalidArgument(format!(
            "{field} must be a positive integer, got {value}"
        ))),
    }
}

fn expect_env(value: &Value) -> Result<HashMap<String, String>> {
    let object: &Map<String, Value> = value.as_object().ok_or_else(|| mismatch("env", "object", value))?;
    object
        .iter()
        .map(|(key, value)| {
            let value = expect_str(&format!("env.{key}"), value)?;
            Ok((key.clone(), value.to_string()))
        })
        .collect()
}
