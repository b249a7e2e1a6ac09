//! Early stop when the latest tool output matches a forbidden pattern.

use anyhow::Result;
use minijinja::{Environment, context};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::core::action::ActionRef;
use crate::core::trajectory::EvalContext;
use crate::core::types::{Evaluation, Rule};
use crate::error::{ConfigurationError, SafetyStop};
use crate::requirements::Requirement;

const DEFAULT_DIRECTIVE: &str = "Your ONLY allowed response is exactly this: \
'I cannot complete this task because {{ reason }}.' Say nothing else. \
This is a mandatory safety requirement.";

/// What happens once the pattern is seen.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopMode {
    /// Inject the refusal directive and force `final_answer`.
    #[default]
    ForceAnswer,
    /// Fail the run with [`SafetyStop`].
    Abort,
}

#[derive(Debug, Clone)]
pub struct PatternStopRequirement {
    pattern: Regex,
    reason: String,
    mode: StopMode,
    directive: String,
}

impl PatternStopRequirement {
    pub fn new(pattern: &str, reason: impl Into<String>) -> Result<Self, ConfigurationError> {
        let pattern = Regex::new(pattern).map_err(|err| ConfigurationError::Invalid {
            requirement: format!("pattern_stop:{pattern}"),
            detail: format!("invalid pattern: {err}"),
        })?;
        Ok(Self {
            pattern,
            reason: reason.into(),
            mode: StopMode::default(),
            directive: DEFAULT_DIRECTIVE.to_string(),
        })
    }

    pub fn with_mode(mut self, mode: StopMode) -> Self {
        self.mode = mode;
        self
    }

    /// Replace the refusal directive. The template sees `reason`, `action`
    /// and `step_index`.
    pub fn with_directive(mut self, template: impl Into<String>) -> Result<Self, ConfigurationError> {
        self.directive = template.into();
        self.render(&ActionRef::new("tool"), 0)
            .map_err(|err| ConfigurationError::Invalid {
                requirement: self.label(),
                detail: format!("invalid directive template: {err}"),
            })?;
        Ok(self)
    }

    fn render(&self, action: &ActionRef, step_index: usize) -> Result<String, minijinja::Error> {
        Environment::new().render_str(
            &self.directive,
            context! {
                reason => self.reason.as_str(),
                action => action.name(),
                step_index => step_index,
            },
        )
    }
}

impl Requirement for PatternStopRequirement {
    fn label(&self) -> String {
        format!("pattern_stop:{}", self.pattern.as_str())
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
        let Some(last) = ctx.last_step() else {
            return Ok(Evaluation::none());
        };
        if !self.pattern.is_match(&last.output) {
            return Ok(Evaluation::none());
        }
        let (action, step_index) = (last.action.clone(), last.index);
        warn!(requirement = %ctx.id(), step = step_index, action = %action, "forbidden pattern detected");

        match self.mode {
            StopMode::Abort => Err(SafetyStop {
                reason: self.reason.clone(),
                step_index,
            }
            .into()),
            StopMode::ForceAnswer => {
                let directive = self.render(&action, step_index)?;
                ctx.inject_directive(directive);
                ctx.state_mut().set_counter("stopped_at", step_index as u64);
                Ok(Evaluation::rules(vec![Rule::forced(ActionRef::final_answer())]))
            }
        }
    }
}
