//! A named, runnable bundle of scheduler, proposer and approver.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info_span};

use crate::cancel::CancellationToken;
use crate::core::trajectory::Trajectory;
use crate::core::types::Step;
use crate::handoff::HandoffTool;
use crate::io::approval::Approver;
use crate::io::config::{PolicyConfig, load_policy};
use crate::io::proposer::{ActionProposer, CommandProposer};
use crate::io::tools::{CommandTool, ToolRegistry};
use crate::looping::{RunOutcome, Scheduler, run_loop};

pub struct Agent {
    name: String,
    instructions: Option<String>,
    scheduler: Scheduler,
    proposer: Arc<dyn ActionProposer>,
    approver: Arc<dyn Approver>,
}

impl Agent {
    pub fn new(
        name: impl Into<String>,
        scheduler: Scheduler,
        proposer: Arc<dyn ActionProposer>,
        approver: Arc<dyn Approver>,
    ) -> Self {
        Self {
            name: name.into(),
            instructions: None,
            scheduler,
            proposer,
            approver,
        }
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = Some(instructions.into());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Start a fresh run on `prompt`.
    pub fn run(&self, prompt: &str, cancel: &CancellationToken) -> Result<RunOutcome> {
        self.run_with(prompt, cancel, |_| {})
    }

    pub fn run_with<F: FnMut(&Step)>(
        &self,
        prompt: &str,
        cancel: &CancellationToken,
        on_step: F,
    ) -> Result<RunOutcome> {
        let trajectory = Trajectory::with_prompt(self.instructions.as_deref(), prompt);
        info_span!("agent", name = %self.name).in_scope(|| {
            run_loop(
                &self.scheduler,
                trajectory,
                self.proposer.as_ref(),
                self.approver.as_ref(),
                cancel,
                on_step,
            )
        })
    }

    /// Expose this agent to another one as a tool named after it.
    pub fn into_handoff(self, description: impl Into<String>) -> HandoffTool {
        HandoffTool::new(self.name.clone(), description, Arc::new(self))
    }

    /// Build an agent from a policy file, including nested handoff agents.
    ///
    /// Handoff policies are resolved relative to the file naming them. Every
    /// agent in the tree shares `approver`.
    pub fn from_policy(path: &Path, approver: Arc<dyn Approver>) -> Result<Self> {
        let mut stack = Vec::new();
        build_from_policy(path, &approver, &mut stack)
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("name", &self.name)
            .field("scheduler", &self.scheduler)
            .finish_non_exhaustive()
    }
}

fn build_from_policy(
    path: &Path,
    approver: &Arc<dyn Approver>,
    stack: &mut Vec<PathBuf>,
) -> Result<Agent> {
    let canonical =
        fs::canonicalize(path).with_context(|| format!("resolve policy {}", path.display()))?;
    if stack.contains(&canonical) {
        bail!("handoff cycle through {}", canonical.display());
    }
    stack.push(canonical.clone());

    let policy = load_policy(&canonical)?;
    let name = canonical
        .file_stem()
        .map_or_else(|| "agent".to_string(), |stem| stem.to_string_lossy().into_owned());
    debug!(agent = %name, path = %canonical.display(), "building agent from policy");

    let tools = build_tools(&canonical, &policy, approver, stack)?;
    let requirements = policy
        .build_requirements()
        .with_context(|| format!("requirements in {}", canonical.display()))?;
    let scheduler = Scheduler::new(tools, requirements, policy.scheduler_config())
        .with_context(|| format!("scheduler for {}", canonical.display()))?;

    if policy.proposer.command.is_empty() {
        bail!("{}: proposer.command must be set", canonical.display());
    }
    let proposer = CommandProposer::new(
        policy.proposer.command.clone(),
        Duration::from_secs(policy.proposer.timeout_secs),
    )?;

    stack.pop();
    let mut agent = Agent::new(name, scheduler, Arc::new(proposer), Arc::clone(approver));
    if let Some(instructions) = policy.instructions {
        agent = agent.with_instructions(instructions);
    }
    Ok(agent)
}

fn build_tools(
    policy_path: &Path,
    policy: &PolicyConfig,
    approver: &Arc<dyn Approver>,
    stack: &mut Vec<PathBuf>,
) -> Result<ToolRegistry> {
    let mut registry = ToolRegistry::new();
    for tool in &policy.tools {
        let command =
            CommandTool::new(tool.name.clone(), tool.command.clone()).describe(&tool.description);
        registry.register(Arc::new(command))?;
    }
    for handoff in &policy.handoffs {
        let nested_path = PolicyConfig::handoff_policy_path(policy_path, handoff);
        let nested = build_from_policy(&nested_path, approver, stack)
            .with_context(|| format!("handoff '{}'", handoff.name))?;
        let tool = HandoffTool::new(handoff.name.clone(), &handoff.description, Arc::new(nested));
        registry.register(Arc::new(tool))?;
    }
    Ok(registry)
}
