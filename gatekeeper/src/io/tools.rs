//! Tool abstraction and the registry the scheduler executes against.
//!
//! The [`Tool`] trait decouples the loop from how an action is carried out.
//! [`CommandTool`] spawns a child process; [`FnTool`] wraps a closure and is
//! what tests use.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Result, bail};
use serde_json::Value;
use tracing::{debug, instrument};

use crate::cancel::CancellationToken;
use crate::core::action::ActionRef;
use crate::error::{ConfigurationError, ToolExecutionError};
use crate::io::process::{ChildExit, run_child};

pub const DEFAULT_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Limits handed to a tool for one call.
#[derive(Debug, Clone)]
pub struct ToolContext {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
    pub cancel: CancellationToken,
}

impl ToolContext {
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            timeout,
            output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            cancel,
        }
    }
}

/// An executable action.
///
/// Failures are returned as errors; the loop records them as the step output.
/// Return a [`ToolExecutionError`] with `timed_out` set when the call ran out
/// of time.
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn call(&self, input: &Value, ctx: &ToolContext) -> Result<String>;
}

/// Registered tools keyed by name.
#[derive(Clone, Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ActionRef, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Result<Self, ConfigurationError> {
        self.register(Arc::new(tool))?;
        Ok(self)
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ConfigurationError> {
        let name = ActionRef::new(tool.name());
        if name.is_final_answer() {
            return Err(ConfigurationError::ReservedToolName);
        }
        if self.tools.contains_key(&name) {
            return Err(ConfigurationError::DuplicateTool(name.to_string()));
        }
        self.tools.insert(name, tool);
        Ok(())
    }

    pub fn get(&self, action: &ActionRef) -> Option<&Arc<dyn Tool>> {
        self.tools.get(action)
    }

    /// Every registered tool; `final_answer` is not included.
    pub fn known_actions(&self) -> BTreeSet<ActionRef> {
        self.tools.keys().cloned().collect()
    }

    /// `(name, description)` pairs, sorted by name.
    pub fn describe(&self) -> Vec<(String, String)> {
        self.tools
            .iter()
            .map(|(name, tool)| (name.to_string(), tool.description().to_string()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl fmt::Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.tools.keys()).finish()
    }
}

type ToolFn = dyn Fn(&Value) -> Result<String> + Send + Sync;

/// In-process tool backed by a closure.
pub struct FnTool {
    name: String,
    description: String,
    func: Box<ToolFn>,
}

impl FnTool {
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&Value) -> Result<String> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            description: String::new(),
            func: Box::new(func),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Tool for FnTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn call(&self, input: &Value, _ctx: &ToolContext) -> Result<String> {
        (self.func)(input)
    }
}

/// Tool backed by a child process.
///
/// The input JSON is written to stdin; stdout (trailing whitespace trimmed) is
/// the output. A non-zero exit fails the call with stderr as the cause.
#[derive(Debug, Clone)]
pub struct CommandTool {
    name: String,
    description: String,
    argv: Vec<String>,
}

impl CommandTool {
    pub fn new(name: impl Into<String>, argv: Vec<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            argv,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

impl Tool for CommandTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    #[instrument(skip_all, fields(tool = %self.name))]
    fn call(&self, input: &Value, ctx: &ToolContext) -> Result<String> {
        if ctx.cancel.is_cancelled() {
            bail!("cancelled before '{}' started", self.name);
        }
        let payload = serde_json::to_vec(input)?;
        let text = match run_child(&self.argv, &payload, ctx.timeout, ctx.output_limit_bytes)? {
            ChildExit::Success(stdout) => stdout.trim_end().to_string(),
            ChildExit::Failed { code, stderr } => bail!(ChildExit::failure_cause(code, &stderr)),
            ChildExit::TimedOut => {
                return Err(ToolExecutionError {
                    tool: ActionRef::new(&self.name),
                    cause: format!("timed out after {:?}", ctx.timeout),
                    timed_out: true,
                }
                .into());
            }
        };
        debug!(bytes = text.len(), "tool produced output");
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> ToolContext {
        ToolContext::new(Duration::from_secs(5), CancellationToken::new())
    }

    #[test]
    fn register_rejects_duplicates_and_reserved_name() {
        let mut registry = ToolRegistry::new();
        registry
            .register(Arc::new(FnTool::new("search", |_| Ok(String::new()))))
            .expect("first");
        let err = registry
            .register(Arc::new(FnTool::new("search", |_| Ok(String::new()))))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::DuplicateTool("search".to_string()));

        let err = registry
            .register(Arc::new(FnTool::new("final_answer", |_| Ok(String::new()))))
            .unwrap_err();
        assert_eq!(err, ConfigurationError::ReservedToolName);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn fn_tool_sees_input() {
        let tool = FnTool::new("echo", |input| Ok(input["q"].as_str().unwrap_or("").to_string()));
        let out = tool
            .call(&serde_json::json!({"q": "NYC"}), &ctx())
            .expect("call");
        assert_eq!(out, "NYC");
    }

    #[cfg(unix)]
    #[test]
    fn command_tool_reads_stdin_json() {
        let tool = CommandTool::new(
            "cat",
            vec!["sh".to_string(), "-c".to_string(), "cat".to_string()],
        );
        let out = tool
            .call(&serde_json::json!({"a": 1}), &ctx())
            .expect("call");
        assert_eq!(out, r#"{"a":1}"#);
    }

    #[cfg(unix)]
    #[test]
    fn command_tool_timeout_is_typed() {
        let tool = CommandTool::new(
            "slow",
            vec!["sh".to_string(), "-c".to_string(), "sleep 5".to_string()],
        );
        let ctx = ToolContext::new(Duration::from_millis(100), CancellationToken::new());
        let err = tool.call(&Value::Null, &ctx).unwrap_err();
        let typed = err.downcast_ref::<ToolExecutionError>().expect("typed");
        assert!(typed.timed_out);
    }

    #[cfg(unix)]
    #[test]
    fn command_tool_failure_carries_stderr() {
        let tool = CommandTool::new(
            "bad",
            vec!["sh".to_string(), "-c".to_string(), "echo nope >&2; exit 3".to_string()],
        );
        let err = tool.call(&Value::Null, &ctx()).unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
