//! Delegation to a nested agent, exposed to the parent as an ordinary tool.
//!
//! The parent's rules see the handoff only as an action name. The nested agent
//! starts a fresh trajectory (its own instructions plus the task text), so its
//! requirement state never mixes with the parent's. Whatever the nested run
//! ends with comes back as this tool's output or error.

use std::sync::Arc;

use anyhow::{Context, Result, bail};
use serde_json::Value;
use tracing::{info, instrument};

use crate::agent::Agent;
use crate::core::types::RunStatus;
use crate::io::tools::{Tool, ToolContext};

pub struct HandoffTool {
    name: String,
    description: String,
    agent: Arc<Agent>,
}

impl HandoffTool {
    pub fn new(name: impl Into<String>, description: impl Into<String>, agent: Arc<Agent>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            agent,
        }
    }
}

impl Tool for HandoffTool {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    /// The nested agent's own step budget bounds the call; `ctx.timeout` does not apply.
    #[instrument(skip_all, fields(handoff = %self.name, agent = %self.agent.name()))]
    fn call(&self, input: &Value, ctx: &ToolContext) -> Result<String> {
        let task = task_text(input)?;
        if ctx.cancel.is_cancelled() {
            bail!("cancelled before handoff to '{}'", self.agent.name());
        }
        info!("handing off");
        let outcome = self
            .agent
            .run(&task, &ctx.cancel)
            .with_context(|| format!("sub-agent '{}' failed", self.agent.name()))?;
        match outcome.status {
            RunStatus::Completed => Ok(outcome.answer.unwrap_or_default()),
            RunStatus::Incomplete => bail!(
                "sub-agent '{}' ran out of steps after {}",
                self.agent.name(),
                outcome.trajectory.len()
            ),
            RunStatus::Cancelled => bail!("sub-agent '{}' was cancelled", self.agent.name()),
        }
    }
}

/// Task text from a bare string or a `{"task": ...}` object.
fn task_text(input: &Value) -> Result<String> {
    let text = match input {
        Value::String(text) => text.clone(),
        Value::Object(map) => match map.get("task") {
            Some(Value::String(text)) => text.clone(),
            _ => input.to_string(),
        },
        Value::Null => String::new(),
        other => other.to_string(),
    };
    if text.trim().is_empty() {
        bail!("handoff needs a task");
    }
    Ok(text)
}
