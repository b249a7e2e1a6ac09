//! Force a remedy tool after an empty tool result.

use anyhow::Result;

use crate::core::action::ActionRef;
use crate::core::trajectory::EvalContext;
use crate::core::types::{Evaluation, Rule};
use crate::requirements::Requirement;

/// Forces `remedy` when the latest step came back empty.
///
/// With `watch` set only that tool's results are considered. Combine with a
/// `max_invocations` limit on the watched tool to bound the retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryOnEmptyRequirement {
    remedy: ActionRef,
    watch: Option<ActionRef>,
}

impl RetryOnEmptyRequirement {
    pub fn new(remedy: impl Into<ActionRef>) -> Self {
        Self {
            remedy: remedy.into(),
            watch: None,
        }
    }

    pub fn watching(mut self, tool: impl Into<ActionRef>) -> Self {
        self.watch = Some(tool.into());
        self
    }
}

impl Requirement for RetryOnEmptyRequirement {
    fn label(&self) -> String {
        format!("retry_on_empty:{}", self.remedy)
    }

    fn references(&self) -> Vec<ActionRef> {
        std::iter::once(self.remedy.clone())
            .chain(self.watch.clone())
            .collect()
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
        let Some(last) = ctx.last_step() else {
            return Ok(Evaluation::none());
        };
        let watched = match &self.watch {
            Some(tool) => &last.action == tool,
            None => !last.action.is_final_answer() && last.action != self.remedy,
        };
        if watched && last.output.trim().is_empty() {
            return Ok(Evaluation::rules(vec![Rule::forced(self.remedy.clone())]));
        }
        Ok(Evaluation::none())
    }
}
