//! Agent policy files (TOML).
//!
//! A policy names the tools, nested agents and requirements of one agent plus
//! the scheduler limits. It is meant to be edited by hand; missing fields fall
//! back to defaults and [`PolicyConfig::validate`] catches the rest before
//! anything runs.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::action::ActionRef;
use crate::error::ConfigurationError;
use crate::looping::SchedulerConfig;
use crate::requirements::{
    AskPermissionRequirement, ConditionalOptions, ConditionalRequirement, PatternStopRequirement,
    RequirementSet, RetryOnEmptyRequirement, StopMode,
};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PolicyConfig {
    /// Upper bound on steps per run; the run ends `Incomplete` beyond it.
    pub max_steps: usize,

    /// Per-call tool budget in seconds.
    pub tool_timeout_secs: u64,

    /// How long to wait for a human verdict. 0 waits indefinitely.
    pub approval_timeout_secs: u64,

    /// Truncate command tool stdout beyond this many bytes.
    pub tool_output_limit_bytes: usize,

    /// Tools whose failures abort the run instead of being recorded.
    pub fatal_tools: Vec<String>,

    /// System instructions placed ahead of the prompt.
    pub instructions: Option<String>,

    pub proposer: ProposerConfig,

    pub tools: Vec<ToolConfig>,

    pub handoffs: Vec<HandoffConfig>,

    pub requirements: Vec<RequirementConfig>,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout_secs: 60,
            approval_timeout_secs: 0,
            tool_output_limit_bytes: 100_000,
            fatal_tools: Vec::new(),
            instructions: None,
            proposer: ProposerConfig::default(),
            tools: Vec::new(),
            handoffs: Vec::new(),
            requirements: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Command receiving proposal requests on stdin (e.g. `["python3", "propose.py"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            command: Vec::new(),
            timeout_secs: 120,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ToolConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub command: Vec<String>,
}

/// A nested agent exposed to this one as a tool.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HandoffConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Policy of the nested agent, relative to this file.
    pub policy: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequirementConfig {
    Conditional {
        target: ActionRef,
        #[serde(flatten)]
        options: ConditionalOptions,
    },
    AskPermission {
        target: ActionRef,
        #[serde(default = "default_true")]
        remember_choices: bool,
        #[serde(default = "default_true")]
        enabled: bool,
    },
    PatternStop {
        pattern: String,
        reason: String,
        #[serde(default)]
        mode: StopMode,
        #[serde(default)]
        directive: Option<String>,
    },
    RetryOnEmpty {
        remedy: ActionRef,
        #[serde(default)]
        watch: Option<ActionRef>,
    },
}

fn default_true() -> bool {
    true
}

impl RequirementConfig {
    fn build(&self, requirements: &mut RequirementSet) -> Result<(), ConfigurationError> {
        match self {
            Self::Conditional { target, options } => {
                requirements.push(ConditionalRequirement::new(target.clone(), options.clone())?);
            }
            Self::AskPermission {
                target,
                remember_choices,
                enabled,
            } => {
                let mut requirement =
                    AskPermissionRequirement::new(target.clone(), *remember_choices);
                if !enabled {
                    requirement = requirement.disabled();
                }
                requirements.push(requirement);
            }
            Self::PatternStop {
                pattern,
                reason,
                mode,
                directive,
            } => {
                let mut requirement =
                    PatternStopRequirement::new(pattern, reason.clone())?.with_mode(*mode);
                if let Some(template) = directive {
                    requirement = requirement.with_directive(template.clone())?;
                }
                requirements.push(requirement);
            }
            Self::RetryOnEmpty { remedy, watch } => {
                let mut requirement = RetryOnEmptyRequirement::new(remedy.clone());
                if let Some(tool) = watch {
                    requirement = requirement.watching(tool.clone());
                }
                requirements.push(requirement);
            }
        }
        Ok(())
    }
}

impl PolicyConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_steps == 0 {
            return Err(anyhow!("max_steps must be > 0"));
        }
        if self.tool_timeout_secs == 0 {
            return Err(anyhow!("tool_timeout_secs must be > 0"));
        }
        if self.tool_output_limit_bytes == 0 {
            return Err(anyhow!("tool_output_limit_bytes must be > 0"));
        }
        if self.proposer.timeout_secs == 0 {
            return Err(anyhow!("proposer.timeout_secs must be > 0"));
        }
        for tool in &self.tools {
            if tool.name.trim().is_empty() {
                return Err(anyhow!("tools: name must be non-empty"));
            }
            if tool.command.is_empty() || tool.command[0].trim().is_empty() {
                return Err(anyhow!("tools.{}: command must be a non-empty array", tool.name));
            }
        }
        for handoff in &self.handoffs {
            if handoff.name.trim().is_empty() {
                return Err(anyhow!("handoffs: name must be non-empty"));
            }
        }
        let actions = self.action_names();
        for fatal in &self.fatal_tools {
            if !actions.contains(&ActionRef::new(fatal.as_str())) {
                return Err(anyhow!("fatal_tools names unknown tool '{fatal}'"));
            }
        }
        Ok(())
    }

    /// Names of every tool and handoff this policy registers.
    pub fn action_names(&self) -> BTreeSet<ActionRef> {
        self.tools
            .iter()
            .map(|tool| ActionRef::new(tool.name.as_str()))
            .chain(
                self.handoffs
                    .iter()
                    .map(|handoff| ActionRef::new(handoff.name.as_str())),
            )
            .collect()
    }

    /// Turn the `[[requirements]]` tables into live requirements, in file order.
    pub fn build_requirements(&self) -> Result<RequirementSet, ConfigurationError> {
        let mut requirements = RequirementSet::new();
        for config in &self.requirements {
            config.build(&mut requirements)?;
        }
        Ok(requirements)
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            max_steps: self.max_steps,
            tool_timeout: Duration::from_secs(self.tool_timeout_secs),
            tool_output_limit_bytes: self.tool_output_limit_bytes,
            approval_timeout: (self.approval_timeout_secs > 0)
                .then(|| Duration::from_secs(self.approval_timeout_secs)),
            fatal_tools: self
                .fatal_tools
                .iter()
                .map(|name| ActionRef::new(name.as_str()))
                .collect(),
        }
    }

    /// Resolve a handoff's policy path against the directory of `policy_path`.
    pub fn handoff_policy_path(policy_path: &Path, handoff: &HandoffConfig) -> PathBuf {
        if handoff.policy.is_absolute() {
            return handoff.policy.clone();
        }
        policy_path
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&handoff.policy)
    }
}

/// Load a policy from a TOML file.
///
/// A missing file yields `PolicyConfig::default()`.
pub fn load_policy(path: &Path) -> Result<PolicyConfig> {
    if !path.exists() {
        let cfg = PolicyConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: PolicyConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("validate {}", path.display()))?;
    Ok(cfg)
}
