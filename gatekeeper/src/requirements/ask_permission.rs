//! Human-in-the-loop gate on a single action.

use anyhow::Result;

use crate::core::action::ActionRef;
use crate::core::trajectory::{ApprovalMemo, EvalContext, RequirementState};
use crate::core::types::{ApprovalDecision, Evaluation, Rule};
use crate::requirements::Requirement;

/// Holds `target` until a human grants it.
///
/// A deny disallows the target for the rest of the run. A grant is kept for the
/// rest of the run when `remember_choices` is set; otherwise it covers only the
/// step taken right after it and the next use asks again.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AskPermissionRequirement {
    target: ActionRef,
    remember_choices: bool,
    enabled: bool,
}

impl AskPermissionRequirement {
    pub fn new(target: impl Into<ActionRef>, remember_choices: bool) -> Self {
        Self {
            target: target.into(),
            remember_choices,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn target(&self) -> &ActionRef {
        &self.target
    }
}

impl Requirement for AskPermissionRequirement {
    fn label(&self) -> String {
        format!("ask_permission:{}", self.target)
    }

    fn enabled_by_default(&self) -> bool {
        self.enabled
    }

    fn references(&self) -> Vec<ActionRef> {
        vec![self.target.clone()]
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
        let next = ctx.next_index();
        Ok(match ctx.state().approval {
            Some(ApprovalMemo::Denied) => {
                Evaluation::rules(vec![Rule::disallowed(self.target.clone())])
            }
            Some(ApprovalMemo::Granted) => Evaluation::none(),
            Some(ApprovalMemo::GrantedOnce { at_len }) if at_len == next => Evaluation::none(),
            Some(ApprovalMemo::GrantedOnce { .. }) | None => {
                Evaluation::await_approval(self.target.clone())
            }
        })
    }

    fn resolve_approval(
        &self,
        state: &mut RequirementState,
        target: &ActionRef,
        decision: ApprovalDecision,
        at_len: usize,
    ) {
        if target != &self.target {
            return;
        }
        match decision {
            ApprovalDecision::Grant => {
                state.approval = Some(if self.remember_choices {
                    ApprovalMemo::Granted
                } else {
                    ApprovalMemo::GrantedOnce { at_len }
                });
                state.bump_counter("grants");
            }
            ApprovalDecision::Deny => {
                state.approval = Some(ApprovalMemo::Denied);
                state.bump_counter("denials");
            }
        }
    }
}
