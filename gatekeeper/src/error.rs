//! Error taxonomy for scheduler runs.
//!
//! Fatal kinds are typed so hosts can `downcast_ref::<RunFailure>()` on the
//! `anyhow::Error` returned by a run and branch on [`SchedulerError`].

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::core::action::ActionRef;
use crate::core::types::{RequirementId, Step};

/// Invalid requirement or tool setup. Raised at construction, never mid-run.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigurationError {
    #[error("{requirement}: min_invocations ({min}) exceeds max_invocations ({max})")]
    InvocationBounds {
        requirement: String,
        min: usize,
        max: usize,
    },
    #[error("{requirement}: {detail}")]
    Invalid { requirement: String, detail: String },
    #[error("{requirement} references unknown action '{action}'")]
    UnknownAction {
        requirement: String,
        action: ActionRef,
    },
    #[error("duplicate tool '{0}'")]
    DuplicateTool(String),
    #[error("'final_answer' is reserved and cannot name a tool")]
    ReservedToolName,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ConflictKind {
    /// A target is forced and disallowed in the same turn.
    ForcedAndDisallowed { target: ActionRef },
    /// More than one distinct target is forced.
    MultipleForced { targets: Vec<ActionRef> },
    /// Every action, including `final_answer`, is disallowed.
    NothingPermitted,
    /// A forced target is not a registered action.
    UnknownForcedTarget { target: ActionRef },
}

impl fmt::Display for ConflictKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ForcedAndDisallowed { target } => {
                write!(f, "'{target}' is both forced and disallowed")
            }
            Self::MultipleForced { targets } => {
                write!(f, "multiple forced targets: {}", join(targets))
            }
            Self::NothingPermitted => write!(f, "no action is permitted"),
            Self::UnknownForcedTarget { target } => {
                write!(f, "forced target '{target}' is not a known action")
            }
        }
    }
}

/// Contradictory rules for one turn. Fatal; never resolved silently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("specification conflict: {kind} (requirements: {})", join(.requirements))]
pub struct SpecificationConflict {
    pub kind: ConflictKind,
    /// Requirements whose rules took part in the conflict, sorted and unique.
    pub requirements: Vec<RequirementId>,
}

/// A step was appended out of order. Indicates a driver bug.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("step index {found} appended but trajectory expects {expected}")]
pub struct SequencingError {
    pub expected: usize,
    pub found: usize,
}

/// The proposer kept selecting an action outside the permitted set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("proposer selected '{proposed}' outside permitted set [{}] after {attempts} attempts", join(.permitted))]
pub struct ProposalViolation {
    pub proposed: ActionRef,
    pub permitted: BTreeSet<ActionRef>,
    pub attempts: u32,
}

/// A tool failed or timed out.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("tool '{tool}' failed: {cause}")]
pub struct ToolExecutionError {
    pub tool: ActionRef,
    pub cause: String,
    pub timed_out: bool,
}

/// A requirement aborted the run after spotting forbidden content.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("safety stop: {reason} (detected in step {step_index})")]
pub struct SafetyStop {
    pub reason: String,
    pub step_index: usize,
}

/// No grant or deny arrived within the configured approval window.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("approval for '{target}' timed out after {timeout:?}")]
pub struct ApprovalTimedOut {
    pub target: ActionRef,
    pub timeout: Duration,
}

/// Every fatal error kind a run can end with.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    Conflict(#[from] SpecificationConflict),
    #[error(transparent)]
    Proposal(#[from] ProposalViolation),
    #[error(transparent)]
    Sequencing(#[from] SequencingError),
    #[error(transparent)]
    Tool(#[from] ToolExecutionError),
    #[error(transparent)]
    SafetyStop(#[from] SafetyStop),
    #[error(transparent)]
    ApprovalTimedOut(#[from] ApprovalTimedOut),
    #[error("requirement {requirement} failed: {cause}")]
    Requirement {
        requirement: RequirementId,
        cause: String,
    },
    #[error("{collaborator} failed: {cause}")]
    Collaborator {
        collaborator: &'static str,
        cause: String,
    },
}

/// A fatal run error together with the trajectory prefix that produced it.
#[derive(Debug, thiserror::Error)]
#[error("run aborted after {} steps", .steps.len())]
pub struct RunFailure {
    #[source]
    pub error: SchedulerError,
    pub steps: Vec<Step>,
}

impl RunFailure {
    /// Compact `index:action` listing, enough to replay the failing prefix.
    pub fn trajectory_prefix(&self) -> String {
        self.steps
            .iter()
            .map(|step| format!("{}:{}", step.index, step.action))
            .collect::<Vec<_>>()
            .join(" -> ")
    }
}

fn join<T: fmt::Display>(items: impl IntoIterator<Item = T>) -> String {
    items
        .into_iter()
        .map(|item| item.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
