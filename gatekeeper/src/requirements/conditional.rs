//! Declarative ordering and cardinality policy over one target action.

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::core::action::{ActionMatcher, ActionRef};
use crate::core::trajectory::EvalContext;
use crate::core::types::{Evaluation, Rule};
use crate::error::ConfigurationError;
use crate::requirements::Requirement;

/// Knobs of a [`ConditionalRequirement`]. Doubles as its TOML representation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConditionalOptions {
    /// `final_answer` is disallowed until the target ran this many times.
    pub min_invocations: usize,
    /// The target is disallowed once it ran this many times.
    pub max_invocations: Option<usize>,
    /// The target is disallowed until every listed action ran at least once.
    pub only_after: Vec<ActionRef>,
    /// 1-based step number at which the target is forced.
    pub force_at_step: Option<usize>,
    /// The target is forced right after any matching action.
    pub force_after: Vec<ActionMatcher>,
    /// When false, the target may not run twice in a row.
    pub consecutive_allowed: bool,
    pub enabled: bool,
}

impl Default for ConditionalOptions {
    fn default() -> Self {
        Self {
            min_invocations: 0,
            max_invocations: None,
            only_after: Vec::new(),
            force_at_step: None,
            force_after: Vec::new(),
            consecutive_allowed: true,
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConditionalRequirement {
    target: ActionRef,
    options: ConditionalOptions,
}

impl ConditionalRequirement {
    pub fn new(
        target: impl Into<ActionRef>,
        options: ConditionalOptions,
    ) -> Result<Self, ConfigurationError> {
        let requirement = Self {
            target: target.into(),
            options,
        };
        requirement.validate()?;
        Ok(requirement)
    }

    pub fn builder(target: impl Into<ActionRef>) -> ConditionalBuilder {
        ConditionalBuilder {
            target: target.into(),
            options: ConditionalOptions::default(),
        }
    }

    pub fn target(&self) -> &ActionRef {
        &self.target
    }

    fn validate(&self) -> Result<(), ConfigurationError> {
        let opts = &self.options;
        if let Some(max) = opts.max_invocations
            && opts.min_invocations > max
        {
            return Err(ConfigurationError::InvocationBounds {
                requirement: self.label(),
                min: opts.min_invocations,
                max,
            });
        }
        if opts.force_at_step == Some(0) {
            return Err(self.invalid("force_at_step is 1-based and must be > 0"));
        }
        if opts.only_after.contains(&self.target) {
            return Err(self.invalid("target cannot be its own prerequisite"));
        }
        if self.target.is_final_answer() && opts.min_invocations > 0 {
            return Err(self.invalid("min_invocations cannot apply to final_answer"));
        }
        Ok(())
    }

    fn invalid(&self, detail: &str) -> ConfigurationError {
        ConfigurationError::Invalid {
            requirement: self.label(),
            detail: detail.to_string(),
        }
    }

    /// Whether `last` fires one of the `force_after` triggers.
    ///
    /// The `AnyTool` wildcard never fires on the target itself; only an
    /// explicit trigger naming the target does.
    fn triggered_by(&self, last: &ActionRef) -> bool {
        self.options.force_after.iter().any(|trigger| match trigger {
            ActionMatcher::AnyTool => trigger.matches(last) && last != &self.target,
            ActionMatcher::Exact(_) => trigger.matches(last),
        })
    }
}

impl Requirement for ConditionalRequirement {
    fn label(&self) -> String {
        format!("conditional:{}", self.target)
    }

    fn enabled_by_default(&self) -> bool {
        self.options.enabled
    }

    fn references(&self) -> Vec<ActionRef> {
        let mut refs = vec![self.target.clone()];
        refs.extend(self.options.only_after.iter().cloned());
        refs.extend(
            self.options
                .force_after
                .iter()
                .filter_map(ActionMatcher::as_exact)
                .cloned(),
        );
        refs
    }

    fn evaluate(&self, ctx: &mut EvalContext<'_>) -> Result<Evaluation> {
        let opts = &self.options;
        let count = ctx.invocations(&self.target);
        ctx.state_mut().set_counter("invocations", count as u64);
        let last = ctx.last_step().map(|step| step.action.clone());

        let exhausted = opts.max_invocations.is_some_and(|max| count >= max);
        let prerequisites_missing = opts.only_after.iter().any(|action| !ctx.has_run(action));
        let repeated = !opts.consecutive_allowed && last.as_ref() == Some(&self.target);
        let blocked = exhausted || prerequisites_missing || repeated;

        let mut rules = Vec::new();
        if blocked {
            rules.push(Rule::disallowed(self.target.clone()));
        }
        if count < opts.min_invocations {
            rules.push(Rule::disallowed(ActionRef::final_answer()));
        }

        let at_step = !blocked && opts.force_at_step == Some(ctx.next_index() + 1);
        let after = last.as_ref().is_some_and(|last| self.triggered_by(last));
        if at_step || after {
            rules.push(Rule::forced(self.target.clone()));
        }

        Ok(Evaluation::rules(rules))
    }
}

/// Chained construction for [`ConditionalRequirement`].
#[derive(Debug, Clone)]
pub struct ConditionalBuilder {
    target: ActionRef,
    options: ConditionalOptions,
}

impl ConditionalBuilder {
    pub fn min_invocations(mut self, min: usize) -> Self {
        self.options.min_invocations = min;
        self
    }

    pub fn max_invocations(mut self, max: usize) -> Self {
        self.options.max_invocations = Some(max);
        self
    }

    pub fn only_after<I, A>(mut self, actions: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<ActionRef>,
    {
        self.options
            .only_after
            .extend(actions.into_iter().map(Into::into));
        self
    }

    pub fn force_at_step(mut self, step: usize) -> Self {
        self.options.force_at_step = Some(step);
        self
    }

    pub fn force_after<I, M>(mut self, triggers: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<ActionMatcher>,
    {
        self.options
            .force_after
            .extend(triggers.into_iter().map(Into::into));
        self
    }

    pub fn consecutive_allowed(mut self, allowed: bool) -> Self {
        self.options.consecutive_allowed = allowed;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.options.enabled = false;
        self
    }

    pub fn build(self) -> Result<ConditionalRequirement, ConfigurationError> {
        ConditionalRequirement::new(self.target, self.options)
    }
}
