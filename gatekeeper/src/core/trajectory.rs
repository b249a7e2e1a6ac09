//! Append-only run history plus per-requirement private state.
//!
//! The scheduler loop owns the [`Trajectory`] for its run. Requirements only see
//! it through [`EvalContext`], which exposes the steps read-only, their own
//! state cell, and append-only memory access.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::core::action::ActionRef;
use crate::core::memory::{Memory, Role};
use crate::core::types::{RequirementId, Step};
use crate::error::SequencingError;

/// Approval remembered by a gating requirement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ApprovalMemo {
    /// Granted for the rest of the run.
    Granted,
    /// Granted for the single step taken while the trajectory has `at_len` steps.
    GrantedOnce { at_len: usize },
    /// Denied for the rest of the run.
    Denied,
}

/// Private state cell for one requirement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequirementState {
    /// Disabled requirements are skipped; the rest of the cell is left untouched.
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<ApprovalMemo>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, u64>,
}

impl RequirementState {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            approval: None,
            counters: BTreeMap::new(),
        }
    }

    pub fn counter(&self, key: &str) -> u64 {
        self.counters.get(key).copied().unwrap_or(0)
    }

    pub fn set_counter(&mut self, key: &str, value: u64) {
        self.counters.insert(key.to_string(), value);
    }

    pub fn bump_counter(&mut self, key: &str) {
        *self.counters.entry(key.to_string()).or_insert(0) += 1;
    }
}

/// Ordered steps, requirement state cells and conversation memory for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Trajectory {
    steps: Vec<Step>,
    #[serde(default, rename = "requirements")]
    states: BTreeMap<RequirementId, RequirementState>,
    #[serde(default)]
    memory: Memory,
}

impl Trajectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a run: optional system instructions followed by the user prompt.
    pub fn with_prompt(instructions: Option<&str>, prompt: &str) -> Self {
        let mut trajectory = Self::new();
        if let Some(instructions) = instructions {
            trajectory.memory.push(Role::System, instructions);
        }
        trajectory.memory.push(Role::User, prompt);
        trajectory
    }

    /// Append a completed step. Its index must equal the current length.
    pub fn append(&mut self, step: Step) -> Result<(), SequencingError> {
        let expected = self.steps.len();
        if step.index != expected {
            return Err(SequencingError {
                expected,
                found: step.index,
            });
        }
        self.steps.push(step);
        Ok(())
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn last(&self) -> Option<&Step> {
        self.steps.last()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Private cell for `id`, created on first access.
    pub fn state_for(&mut self, id: &RequirementId, enabled: bool) -> &mut RequirementState {
        self.states
            .entry(id.clone())
            .or_insert_with(|| RequirementState::new(enabled))
    }

    pub fn state(&self, id: &RequirementId) -> Option<&RequirementState> {
        self.states.get(id)
    }

    /// Host toggle. Disabling freezes the cell; it is not cleared.
    pub fn set_enabled(&mut self, id: &RequirementId, enabled: bool) {
        self.state_for(id, enabled).enabled = enabled;
    }

    pub fn memory(&self) -> &Memory {
        &self.memory
    }

    pub fn push_memory(&mut self, role: Role, text: impl Into<String>) {
        self.memory.push(role, text);
    }

    /// Add a directive visible to the proposer for exactly one turn.
    pub fn inject_directive(&mut self, text: impl Into<String>) {
        self.memory.push_directive(text);
    }

    /// Drop last turn's directives. Called once at the start of every evaluation pass.
    pub fn prune_directives(&mut self) -> usize {
        self.memory.prune_transient()
    }

    /// Check step indices are contiguous from 0 (for trajectories loaded from disk).
    pub fn check_sequence(&self) -> Result<(), SequencingError> {
        for (expected, step) in self.steps.iter().enumerate() {
            if step.index != expected {
                return Err(SequencingError {
                    expected,
                    found: step.index,
                });
            }
        }
        Ok(())
    }

    pub(crate) fn eval_context<'a>(
        &'a mut self,
        id: &'a RequirementId,
        enabled: bool,
    ) -> EvalContext<'a> {
        let state = self
            .states
            .entry(id.clone())
            .or_insert_with(|| RequirementState::new(enabled));
        EvalContext {
            id,
            steps: &self.steps,
            state,
            memory: &mut self.memory,
        }
    }
}

/// Capability handed to a requirement during evaluation.
pub struct EvalContext<'a> {
    id: &'a RequirementId,
    steps: &'a [Step],
    state: &'a mut RequirementState,
    memory: &'a mut Memory,
}

impl EvalContext<'_> {
    pub fn id(&self) -> &RequirementId {
        self.id
    }

    pub fn steps(&self) -> &[Step] {
        self.steps
    }

    pub fn last_step(&self) -> Option<&Step> {
        self.steps.last()
    }

    /// Index the next appended step will get.
    pub fn next_index(&self) -> usize {
        self.steps.len()
    }

    /// Number of prior steps whose action is `action`.
    pub fn invocations(&self, action: &ActionRef) -> usize {
        self.steps
            .iter()
            .filter(|step| &step.action == action)
            .count()
    }

    pub fn has_run(&self, action: &ActionRef) -> bool {
        self.steps.iter().any(|step| &step.action == action)
    }

    pub fn state(&self) -> &RequirementState {
        &*self.state
    }

    pub fn state_mut(&mut self) -> &mut RequirementState {
        &mut *self.state
    }

    pub fn inject_directive(&mut self, text: impl Into<String>) {
        self.memory.push_directive(text);
    }
}
