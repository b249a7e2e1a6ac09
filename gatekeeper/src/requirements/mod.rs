//! Pluggable policies that turn the trajectory into rules for the next turn.
//!
//! Built-in policies are plain data ([`ConditionalRequirement`],
//! [`AskPermissionRequirement`]); anything else implements [`Requirement`]
//! directly. All state that must survive between turns lives in the
//! requirement's cell in the trajectory, never on the requirement itself, so a
//! single definition can drive any number of independent runs.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, trace};

use crate::core::action::ActionRef;
use crate::core::trajectory::{EvalContext, RequirementState, Trajectory};
use crate::core::types::{ApprovalDecision, Evaluation, RequirementId};
use crate::error::{ConfigurationError, SafetyStop, SchedulerError};

pub mod ask_permission;
pub mod conditional;
pub mod pattern_stop;
pub mod retry;

pub use ask_permission::AskPermissionRequirement;
pub use conditional::{ConditionalOptions, ConditionalRequirement};
pub use pattern_stop::{PatternStopRequirement, StopMode};
pub use retry::RetryOnEmptyRequirement;

/// A policy evaluated once per turn.
///
/// `evaluate` must give the same result when called twice at the same
/// trajectory length; it may only touch its own state cell and append
/// directives to memory.
pub trait Requirement: Send + Sync {
    /// Short label; the requirement set derives the identity from it.
    fn label(&self) -> String;

    fn enabled_by_default(&self) -> bool {
        true
    }

    /// Actions named by this requirement, checked against the registry when a
    /// scheduler is built.
    fn references(&self) -> Vec<ActionRef> {
        Vec::new()
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation>;

    /// Fold a human verdict into this requirement's state. `at_len` is the
    /// trajectory length when the verdict arrived.
    fn resolve_approval(
        &self,
        _state: &mut RequirementState,
        _target: &ActionRef,
        _decision: ApprovalDecision,
        _at_len: usize,
    ) {
    }
}

#[derive(Clone)]
struct Entry {
    id: RequirementId,
    requirement: Arc<dyn Requirement>,
}

/// Ordered requirements for one agent definition.
#[derive(Clone, Default)]
pub struct RequirementSet {
    entries: Vec<Entry>,
}

impl RequirementSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, requirement: impl Requirement + 'static) -> Self {
        self.push(requirement);
        self
    }

    pub fn push(&mut self, requirement: impl Requirement + 'static) -> RequirementId {
        self.push_arc(Arc::new(requirement))
    }

    pub fn push_arc(&mut self, requirement: Arc<dyn Requirement>) -> RequirementId {
        let id = RequirementId::new(format!("{}#{}", requirement.label(), self.entries.len()));
        self.entries.push(Entry {
            id: id.clone(),
            requirement,
        });
        id
    }

    pub fn ids(&self) -> impl Iterator<Item = &RequirementId> {
        self.entries.iter().map(|entry| &entry.id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Reject requirements that name actions outside `known` (plus `final_answer`).
    pub fn check_references(&self, known: &BTreeSet<ActionRef>) -> Result<(), ConfigurationError> {
        for entry in &self.entries {
            for action in entry.requirement.references() {
                if !action.is_final_answer() && !known.contains(&action) {
                    return Err(ConfigurationError::UnknownAction {
                        requirement: entry.id.to_string(),
                        action,
                    });
                }
            }
        }
        Ok(())
    }

    /// Evaluate every enabled requirement against the current trajectory.
    ///
    /// Rules come back stamped with the producing requirement.
    pub fn evaluate(
        &self,
        trajectory: &mut Trajectory,
    ) -> Result<Vec<(RequirementId, Evaluation)>, SchedulerError> {
        let mut evaluations = Vec::with_capacity(self.entries.len());
        for entry in &self.entries {
            let mut ctx =
                trajectory.eval_context(&entry.id, entry.requirement.enabled_by_default());
            if !ctx.state().enabled {
                trace!(requirement = %entry.id, "requirement disabled, skipping");
                continue;
            }
            let mut evaluation = entry
                .requirement
                .evaluate(&mut ctx)
                .map_err(|err| requirement_error(&entry.id, err))?;
            for rule in &mut evaluation.rules {
                rule.source.get_or_insert_with(|| entry.id.clone());
            }
            debug!(
                requirement = %entry.id,
                rules = evaluation.rules.len(),
                approval = ?evaluation.approval,
                "requirement evaluated"
            );
            evaluations.push((entry.id.clone(), evaluation));
        }
        Ok(evaluations)
    }

    /// Hand a human verdict on `target` to every enabled requirement.
    pub fn resolve_approval(
        &self,
        trajectory: &mut Trajectory,
        target: &ActionRef,
        decision: ApprovalDecision,
    ) {
        let at_len = trajectory.len();
        for entry in &self.entries {
            let state = trajectory.state_for(&entry.id, entry.requirement.enabled_by_default());
            if !state.enabled {
                continue;
            }
            entry
                .requirement
                .resolve_approval(state, target, decision, at_len);
        }
    }
}

impl fmt::Debug for RequirementSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|entry| &entry.id))
            .finish()
    }
}

fn requirement_error(id: &RequirementId, err: anyhow::Error) -> SchedulerError {
    match err.downcast::<SafetyStop>() {
        Ok(stop) => SchedulerError::SafetyStop(stop),
        Err(err) => SchedulerError::Requirement {
            requirement: id.clone(),
            cause: format!("{err:#}"),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::{Rule, Step};
    use serde_json::Value;

    struct AlwaysDisallow(&'static str);

    impl Requirement for AlwaysDisallow {
        fn label(&self) -> String {
            "always".to_string()
        }

        fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
            ctx.state_mut().bump_counter("evaluations");
            Ok(Evaluation::rules(vec![Rule::disallowed(self.0)]))
        }
    }

    struct Broken;

    impl Requirement for Broken {
        fn label(&self) -> String {
            "broken".to_string()
        }

        fn evaluate(&self, _ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
            Err(anyhow::anyhow!("lookup failed"))
        }
    }

    #[test]
    fn ids_are_label_and_position() {
        let set = RequirementSet::new()
            .with(AlwaysDisallow("a"))
            .with(AlwaysDisallow("b"));
        let ids: Vec<&str> = set.ids().map(RequirementId::as_str).collect();
        assert_eq!(ids, vec!["always#0", "always#1"]);
    }

    #[test]
    fn evaluate_stamps_sources_and_skips_disabled() {
        let set = RequirementSet::new()
            .with(AlwaysDisallow("a"))
            .with(AlwaysDisallow("b"));
        let mut trajectory = Trajectory::new();
        trajectory
            .append(Step::new(0, ActionRef::new("a"), Value::Null, "ok"))
            .expect("append");
        trajectory.set_enabled(&RequirementId::new("always#1"), false);

        let evaluations = set.evaluate(&mut trajectory).expect("evaluate");
        assert_eq!(evaluations.len(), 1);
        assert_eq!(
            evaluations[0].1.rules[0].source,
            Some(RequirementId::new("always#0"))
        );
        let frozen = trajectory
            .state(&RequirementId::new("always#1"))
            .expect("state");
        assert_eq!(frozen.counter("evaluations"), 0);
    }

    #[test]
    fn failing_requirement_is_named() {
        let set = RequirementSet::new().with(Broken);
        let err = set.evaluate(&mut Trajectory::new()).unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Requirement { ref requirement, .. } if requirement.as_str() == "broken#0"
        ));
    }

    #[test]
    fn references_are_checked_against_known_actions() {
        let gate = ConditionalRequirement::builder("book")
            .only_after(["search"])
            .build()
            .expect("valid");
        let set = RequirementSet::new().with(gate);
        let known: BTreeSet<ActionRef> = [ActionRef::new("book")].into_iter().collect();
        let err = set.check_references(&known).unwrap_err();
        assert!(matches!(err, ConfigurationError::UnknownAction { .. }));
    }
}
