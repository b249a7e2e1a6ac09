//! Proposer abstraction: the collaborator that picks the next action.
//!
//! The scheduler never chooses actions itself. It hands the proposer the
//! trajectory, the permitted set and any forced target, then checks the answer.
//! [`CommandProposer`] delegates to an external process speaking JSON; tests use
//! the scripted proposers in `test_support`.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use jsonschema::{Draft, Validator};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, instrument, warn};

use crate::core::action::ActionRef;
use crate::core::memory::Memory;
use crate::core::types::Step;
use crate::io::process::{ChildExit, run_child};

const PROPOSAL_SCHEMA: &str = include_str!("../../schemas/proposal.schema.json");

/// Name and description of a registered tool, as shown to the proposer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
}

/// Everything the proposer may look at for one turn.
#[derive(Debug, Clone, Serialize)]
pub struct ProposalRequest<'a> {
    pub memory: &'a Memory,
    pub steps: &'a [Step],
    pub tools: &'a [ToolSpec],
    pub permitted: &'a BTreeSet<ActionRef>,
    /// When set the proposer only supplies the input; the action is fixed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub forced: Option<&'a ActionRef>,
    /// Feedback after a rejected proposal.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correction: Option<&'a str>,
}

impl ProposalRequest<'_> {
    /// Directives injected for this turn only.
    pub fn directives(&self) -> impl Iterator<Item = &str> {
        self.memory.directives()
    }
}

/// An action plus its input payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposal {
    pub action: ActionRef,
    #[serde(default)]
    pub input: Value,
}

impl Proposal {
    pub fn tool(action: impl Into<ActionRef>, input: Value) -> Self {
        Self {
            action: action.into(),
            input,
        }
    }

    pub fn final_answer(text: impl Into<String>) -> Self {
        Self {
            action: ActionRef::final_answer(),
            input: Value::String(text.into()),
        }
    }

    /// Answer text carried by a `final_answer` proposal.
    ///
    /// Accepts a bare string, or an object with an `answer` or `text` field.
    pub fn answer_text(&self) -> String {
        match &self.input {
            Value::String(text) => text.clone(),
            Value::Null => String::new(),
            Value::Object(map) => map
                .get("answer")
                .or_else(|| map.get("text"))
                .and_then(Value::as_str)
                .map_or_else(|| self.input.to_string(), str::to_string),
            other => other.to_string(),
        }
    }
}

pub trait ActionProposer: Send + Sync {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal>;
}

/// Proposer backed by an external command.
///
/// The request is written as JSON on stdin; stdout must hold one proposal
/// object matching `schemas/proposal.schema.json`.
pub struct CommandProposer {
    argv: Vec<String>,
    timeout: Duration,
    output_limit_bytes: usize,
    validator: Validator,
}

impl CommandProposer {
    pub fn new(argv: Vec<String>, timeout: Duration) -> Result<Self> {
        if argv.is_empty() {
            bail!("proposer.command must be a non-empty array");
        }
        let schema: Value = serde_json::from_str(PROPOSAL_SCHEMA).context("parse proposal schema")?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft202012)
            .build(&schema)
            .map_err(|err| anyhow!("compile proposal schema: {err}"))?;
        Ok(Self {
            argv,
            timeout,
            output_limit_bytes: 1_000_000,
            validator,
        })
    }

    fn parse(&self, stdout: &str) -> Result<Proposal> {
        let value: Value = serde_json::from_str(stdout.trim()).context("parse proposal json")?;
        let messages: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|err| err.to_string())
            .collect();
        if !messages.is_empty() {
            bail!("proposal schema validation failed:\n- {}", messages.join("\n- "));
        }
        serde_json::from_value(value).context("deserialize proposal")
    }
}

impl ActionProposer for CommandProposer {
    #[instrument(skip_all, fields(steps = request.steps.len(), forced = ?request.forced))]
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        let payload = serde_json::to_vec(request).context("serialize proposal request")?;
        let stdout = match run_child(&self.argv, &payload, self.timeout, self.output_limit_bytes)
            .context("run proposer")?
        {
            ChildExit::Success(stdout) => stdout,
            ChildExit::Failed { code, stderr } => {
                bail!("proposer failed: {}", ChildExit::failure_cause(code, &stderr))
            }
            ChildExit::TimedOut => {
                warn!(timeout_ms = self.timeout.as_millis() as u64, "proposer timed out");
                bail!("proposer timed out after {:?}", self.timeout);
            }
        };
        let proposal = self.parse(&stdout)?;
        debug!(action = %proposal.action, "proposal received");
        Ok(proposal)
    }
}
