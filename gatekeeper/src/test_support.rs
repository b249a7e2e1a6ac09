//! Scripted collaborators and canned tools for tests.

use std::collections::{BTreeSet, VecDeque};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Result, anyhow};
use serde_json::Value;

use crate::cancel::CancellationToken;
use crate::core::action::ActionRef;
use crate::core::types::ApprovalDecision;
use crate::io::approval::{ApprovalRequest, Approver};
use crate::io::proposer::{ActionProposer, Proposal, ProposalRequest};
use crate::io::tools::{FnTool, ToolRegistry};

/// What a proposer was shown on one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposalCall {
    pub permitted: BTreeSet<ActionRef>,
    pub forced: Option<ActionRef>,
    pub step_count: usize,
    pub correction: Option<String>,
    pub directives: Vec<String>,
}

impl ProposalCall {
    fn capture(request: &ProposalRequest<'_>) -> Self {
        Self {
            permitted: request.permitted.clone(),
            forced: request.forced.cloned(),
            step_count: request.steps.len(),
            correction: request.correction.map(str::to_string),
            directives: request.directives().map(str::to_string).collect(),
        }
    }
}

/// Replays proposals in order; answers `"done"` once the script runs out.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    script: Mutex<VecDeque<Proposal>>,
    calls: Mutex<Vec<ProposalCall>>,
}

impl ScriptedProposer {
    pub fn new(script: Vec<Proposal>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Vec<ProposalCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }
}

impl ActionProposer for ScriptedProposer {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(ProposalCall::capture(request));
        let next = self
            .script
            .lock()
            .map_err(|_| anyhow!("script lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(|| Proposal::final_answer("done")))
    }
}

/// Stand-in for a model with a fixed wish list.
///
/// Picks the first preferred tool that is permitted and has not run yet (or
/// any permitted preference when repeats are allowed); otherwise answers. On a
/// forced `final_answer` it repeats the first pending directive verbatim.
#[derive(Debug)]
pub struct PreferenceProposer {
    preferences: Vec<ActionRef>,
    repeats: bool,
    answer: String,
    calls: Mutex<Vec<ProposalCall>>,
}

impl PreferenceProposer {
    pub fn new<I, A>(preferences: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ActionRef>,
    {
        Self {
            preferences: preferences.into_iter().map(Into::into).collect(),
            repeats: false,
            answer: "done".to_string(),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn with_repeats(mut self) -> Self {
        self.repeats = true;
        self
    }

    pub fn with_answer(mut self, answer: impl Into<String>) -> Self {
        self.answer = answer.into();
        self
    }

    pub fn calls(&self) -> Vec<ProposalCall> {
        self.calls.lock().map(|calls| calls.clone()).unwrap_or_default()
    }

    fn input_for(action: &ActionRef, step: usize) -> Value {
        Value::String(format!("{action} input #{step}"))
    }
}

impl ActionProposer for PreferenceProposer {
    fn propose(&self, request: &ProposalRequest<'_>) -> Result<Proposal> {
        self.calls
            .lock()
            .map_err(|_| anyhow!("calls lock poisoned"))?
            .push(ProposalCall::capture(request));
        let step = request.steps.len();

        if let Some(forced) = request.forced {
            if forced.is_final_answer() {
                let answer = request
                    .directives()
                    .next()
                    .map_or_else(|| self.answer.clone(), str::to_string);
                return Ok(Proposal::final_answer(answer));
            }
            return Ok(Proposal::tool(forced.clone(), Self::input_for(forced, step)));
        }

        let choice = self.preferences.iter().find(|action| {
            request.permitted.contains(*action)
                && (self.repeats || !request.steps.iter().any(|s| &s.action == *action))
        });
        if let Some(action) = choice {
            return Ok(Proposal::tool(action.clone(), Self::input_for(action, step)));
        }
        if request.permitted.contains(&ActionRef::final_answer()) {
            return Ok(Proposal::final_answer(self.answer.clone()));
        }
        let fallback = request
            .permitted
            .iter()
            .next()
            .ok_or_else(|| anyhow!("nothing permitted"))?;
        Ok(Proposal::tool(fallback.clone(), Self::input_for(fallback, step)))
    }
}

/// Replays verdicts in order and records every request; denies once exhausted.
#[derive(Debug, Default)]
pub struct ScriptedApprover {
    verdicts: Mutex<VecDeque<ApprovalDecision>>,
    requests: Mutex<Vec<ApprovalRequest>>,
}

impl ScriptedApprover {
    pub fn new(verdicts: Vec<ApprovalDecision>) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<ApprovalRequest> {
        self.requests
            .lock()
            .map(|requests| requests.clone())
            .unwrap_or_default()
    }
}

impl Approver for ScriptedApprover {
    fn decide(
        &self,
        request: &ApprovalRequest,
        _cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        self.requests
            .lock()
            .map_err(|_| anyhow!("requests lock poisoned"))?
            .push(request.clone());
        let next = self
            .verdicts
            .lock()
            .map_err(|_| anyhow!("verdicts lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or(ApprovalDecision::Deny))
    }
}

/// Tool that always returns `output`.
pub fn static_tool(name: &str, output: &str) -> FnTool {
    let output = output.to_string();
    FnTool::new(name, move |_| Ok(output.clone()))
}

/// Tool that echoes its input as `"<name>: <input>"`.
pub fn echo_tool(name: &str) -> FnTool {
    let label = name.to_string();
    FnTool::new(name, move |input| {
        let text = input
            .as_str()
            .map_or_else(|| input.to_string(), str::to_string);
        Ok(format!("{label}: {text}"))
    })
}

/// Tool that always fails with `message`.
pub fn failing_tool(name: &str, message: &str) -> FnTool {
    let message = message.to_string();
    FnTool::new(name, move |_| Err(anyhow!(message.clone())))
}

/// Tool whose outputs come from a script, then `fallback` once exhausted.
pub fn sequence_tool(name: &str, outputs: &[&str], fallback: &str) -> FnTool {
    let outputs: Mutex<VecDeque<String>> =
        Mutex::new(outputs.iter().map(|s| s.to_string()).collect());
    let fallback = fallback.to_string();
    FnTool::new(name, move |_| {
        let next = outputs
            .lock()
            .map_err(|_| anyhow!("outputs lock poisoned"))?
            .pop_front();
        Ok(next.unwrap_or_else(|| fallback.clone()))
    })
}

/// Registry holding `tools`. Panics on duplicate names.
pub fn registry(tools: Vec<FnTool>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    for tool in tools {
        registry.register(Arc::new(tool)).expect("register tool");
    }
    registry
}

/// Write a policy file under `dir` and return its path.
pub fn write_policy(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, contents).expect("write policy");
    path
}
