//! Shared deterministic types for scheduler core logic.
//!
//! These types define stable contracts between requirements, the reconciler and
//! the scheduler loop. They carry no I/O and serialize deterministically.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::action::ActionRef;

/// One completed turn of a run. Immutable once appended to a trajectory.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// 0-based position in the trajectory.
    pub index: usize,
    pub action: ActionRef,
    /// Opaque payload chosen by the proposer.
    #[serde(default)]
    pub input: Value,
    /// Text result (tool output, recorded tool error, or final answer).
    pub output: String,
    /// Set when `output` is a recorded tool execution error.
    #[serde(default, skip_serializing_if = "is_false")]
    pub failed: bool,
    pub timestamp: DateTime<Utc>,
}

impl Step {
    pub fn new(index: usize, action: ActionRef, input: Value, output: impl Into<String>) -> Self {
        Self {
            index,
            action,
            input,
            output: output.into(),
            failed: false,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(mut self) -> Self {
        self.failed = true;
        self
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Identity of a requirement inside one requirement set.
///
/// Keys the requirement's private state cell in the trajectory.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequirementId(String);

impl RequirementId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RequirementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Disposition {
    Forced,
    Disallowed,
}

/// A single constraint contribution for the upcoming turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    pub target: ActionRef,
    pub disposition: Disposition,
    /// Requirement that produced the rule. Stamped by the requirement set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<RequirementId>,
}

impl Rule {
    pub fn forced(target: impl Into<ActionRef>) -> Self {
        Self {
            target: target.into(),
            disposition: Disposition::Forced,
            source: None,
        }
    }

    pub fn disallowed(target: impl Into<ActionRef>) -> Self {
        Self {
            target: target.into(),
            disposition: Disposition::Disallowed,
            source: None,
        }
    }
}

/// Output of one requirement evaluation: rules plus an optional approval gate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Evaluation {
    pub rules: Vec<Rule>,
    /// Target that needs a human grant before it may run this turn.
    pub approval: Option<ActionRef>,
}

impl Evaluation {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn rules(rules: Vec<Rule>) -> Self {
        Self {
            rules,
            approval: None,
        }
    }

    pub fn await_approval(target: ActionRef) -> Self {
        Self {
            rules: Vec::new(),
            approval: Some(target),
        }
    }
}

/// Pause condition attached to a decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "target")]
pub enum Interrupt {
    /// A human must grant or deny the target before it runs.
    AwaitApproval(ActionRef),
    /// The next action is a forced `final_answer`; the run ends with it.
    HaltWithAnswer,
}

/// Reconciled outcome for one turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Decision {
    pub permitted: BTreeSet<ActionRef>,
    pub forced: Option<ActionRef>,
    pub interrupt: Option<Interrupt>,
    /// Every eligible target gated on approval this turn. `interrupt` names the first.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub requires_approval: BTreeSet<ActionRef>,
}

impl Decision {
    pub fn is_permitted(&self, action: &ActionRef) -> bool {
        self.permitted.contains(action)
    }
}

/// Human verdict on a gated action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalDecision {
    Grant,
    Deny,
}

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// `final_answer` was produced.
    Completed,
    /// The step budget ran out before a final answer.
    Incomplete,
    /// The run-level cancellation signal fired.
    Cancelled,
}
