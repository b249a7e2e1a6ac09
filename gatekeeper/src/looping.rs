//! The scheduler loop: evaluate, reconcile, propose, gate, execute, record.
//!
//! One call to [`run_loop`] drives one run to completion. The loop owns the
//! trajectory; requirements, the proposer, tools and the approver only see it
//! through the interfaces they are handed. Fatal errors come back as an
//! `anyhow::Error` wrapping [`RunFailure`], so hosts can downcast for the typed
//! [`SchedulerError`] and the trajectory prefix.

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Result;
use tracing::{debug, info, instrument, warn};

use crate::cancel::CancellationToken;
use crate::core::action::ActionRef;
use crate::core::reconcile::reconcile;
use crate::core::trajectory::Trajectory;
use crate::core::types::{ApprovalDecision, Decision, RunStatus, Step};
use crate::error::{
    ApprovalTimedOut, ConfigurationError, ProposalViolation, RunFailure, SchedulerError,
    ToolExecutionError,
};
use crate::io::approval::{ApprovalRequest, Approver};
use crate::io::proposer::{ActionProposer, Proposal, ProposalRequest, ToolSpec};
use crate::io::tools::{DEFAULT_OUTPUT_LIMIT_BYTES, ToolContext, ToolRegistry};
use crate::requirements::RequirementSet;

/// Proposals per turn before a violation becomes fatal.
const PROPOSAL_ATTEMPTS: u32 = 2;

/// Limits for one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub max_steps: usize,
    pub tool_timeout: Duration,
    pub tool_output_limit_bytes: usize,
    /// `None` waits for a verdict indefinitely.
    pub approval_timeout: Option<Duration>,
    /// Tools whose failure aborts the run.
    pub fatal_tools: BTreeSet<ActionRef>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_steps: 20,
            tool_timeout: Duration::from_secs(60),
            tool_output_limit_bytes: DEFAULT_OUTPUT_LIMIT_BYTES,
            approval_timeout: None,
            fatal_tools: BTreeSet::new(),
        }
    }
}

/// Tools plus requirements, checked against each other once.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tools: ToolRegistry,
    requirements: RequirementSet,
    config: SchedulerConfig,
    known: BTreeSet<ActionRef>,
    tool_specs: Vec<ToolSpec>,
}

/// How a run ended, with the full trajectory.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    /// The `final_answer` text when `status` is `Completed`.
    pub answer: Option<String>,
    pub trajectory: Trajectory,
}

impl Scheduler {
    pub fn new(
        tools: ToolRegistry,
        requirements: RequirementSet,
        config: SchedulerConfig,
    ) -> Result<Self, ConfigurationError> {
        let known = tools.known_actions();
        requirements.check_references(&known)?;
        if let Some(unknown) = config.fatal_tools.iter().find(|tool| !known.contains(*tool)) {
            return Err(ConfigurationError::UnknownAction {
                requirement: "fatal_tools".to_string(),
                action: unknown.clone(),
            });
        }
        let tool_specs = tools
            .describe()
            .into_iter()
            .map(|(name, description)| ToolSpec { name, description })
            .collect();
        Ok(Self {
            tools,
            requirements,
            config,
            known,
            tool_specs,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn requirements(&self) -> &RequirementSet {
        &self.requirements
    }

    pub fn tools(&self) -> &ToolRegistry {
        &self.tools
    }

    /// Decision for the next turn of `trajectory`.
    ///
    /// Drops last turn's directives, evaluates every enabled requirement and
    /// reconciles the rules. Calling it twice at the same length gives the
    /// same decision and leaves the trajectory unchanged.
    pub fn decide(&self, trajectory: &mut Trajectory) -> Result<Decision, SchedulerError> {
        let pruned = trajectory.prune_directives();
        let evaluations = self.requirements.evaluate(trajectory)?;
        let decision = reconcile(&self.known, &evaluations)?;
        debug!(
            step = trajectory.len(),
            pruned,
            permitted = decision.permitted.len(),
            forced = ?decision.forced,
            interrupt = ?decision.interrupt,
            "turn decided"
        );
        Ok(decision)
    }

    /// Run to completion without a step callback.
    pub fn run<P, A>(
        &self,
        trajectory: Trajectory,
        proposer: &P,
        approver: &A,
        cancel: &CancellationToken,
    ) -> Result<RunOutcome>
    where
        P: ActionProposer + ?Sized,
        A: Approver + ?Sized,
    {
        run_loop(self, trajectory, proposer, approver, cancel, |_| {})
    }
}

/// Drive `trajectory` until a final answer, the step budget, cancellation or a
/// fatal error. `on_step` sees every step right after it is recorded.
#[instrument(skip_all, fields(max_steps = scheduler.config.max_steps))]
pub fn run_loop<P, A, F>(
    scheduler: &Scheduler,
    trajectory: Trajectory,
    proposer: &P,
    approver: &A,
    cancel: &CancellationToken,
    on_step: F,
) -> Result<RunOutcome>
where
    P: ActionProposer + ?Sized,
    A: Approver + ?Sized,
    F: FnMut(&Step),
{
    info!(
        tools = scheduler.known.len(),
        requirements = scheduler.requirements.len(),
        resumed_at = trajectory.len(),
        "run started"
    );
    let run = Run {
        scheduler,
        proposer,
        approver,
        cancel,
        trajectory,
        on_step,
    };
    run.drive()
}

struct Run<'a, P: ?Sized, A: ?Sized, F> {
    scheduler: &'a Scheduler,
    proposer: &'a P,
    approver: &'a A,
    cancel: &'a CancellationToken,
    trajectory: Trajectory,
    on_step: F,
}

impl<P, A, F> Run<'_, P, A, F>
where
    P: ActionProposer + ?Sized,
    A: Approver + ?Sized,
    F: FnMut(&Step),
{
    fn drive(mut self) -> Result<RunOutcome> {
        loop {
            if self.cancel.is_cancelled() {
                return Ok(self.finish(RunStatus::Cancelled, None));
            }
            if self.trajectory.len() >= self.scheduler.config.max_steps {
                warn!(max_steps = self.scheduler.config.max_steps, "step budget exhausted");
                return Ok(self.finish(RunStatus::Incomplete, None));
            }

            let decision = self.decide()?;
            let Some(proposal) = self.propose(&decision)? else {
                return Ok(self.finish(RunStatus::Cancelled, None));
            };

            if decision.requires_approval.contains(&proposal.action) {
                match self.seek_approval(&proposal)? {
                    Gate::Proceed => {}
                    Gate::Redecide => continue,
                    Gate::Cancelled => return Ok(self.finish(RunStatus::Cancelled, None)),
                }
            }

            if proposal.action.is_final_answer() {
                let answer = proposal.answer_text();
                self.record(Step::new(
                    self.trajectory.len(),
                    proposal.action,
                    proposal.input,
                    answer.clone(),
                ))?;
                return Ok(self.finish(RunStatus::Completed, Some(answer)));
            }

            if self.cancel.is_cancelled() {
                return Ok(self.finish(RunStatus::Cancelled, None));
            }
            let step = self.execute(proposal)?;
            self.record(step)?;
        }
    }

    fn decide(&mut self) -> Result<Decision> {
        self.scheduler
            .decide(&mut self.trajectory)
            .map_err(|err| self.fail(err))
    }

    /// Ask for a proposal, re-prompting once with a correction after a
    /// violation. On a forced turn only the forced action is accepted.
    /// `Ok(None)` means the run was cancelled.
    fn propose(&self, decision: &Decision) -> Result<Option<Proposal>> {
        let mut correction: Option<String> = None;
        let mut attempts = 0;
        loop {
            if self.cancel.is_cancelled() {
                return Ok(None);
            }
            attempts += 1;
            let request = ProposalRequest {
                memory: self.trajectory.memory(),
                steps: self.trajectory.steps(),
                tools: &self.scheduler.tool_specs,
                permitted: &decision.permitted,
                forced: decision.forced.as_ref(),
                correction: correction.as_deref(),
            };
            let proposal = self.proposer.propose(&request).map_err(|err| {
                self.fail(SchedulerError::Collaborator {
                    collaborator: "proposer",
                    cause: format!("{err:#}"),
                })
            })?;

            let allowed = match &decision.forced {
                Some(forced) => &proposal.action == forced,
                None => decision.is_permitted(&proposal.action),
            };
            if allowed {
                return Ok(Some(proposal));
            }

            warn!(
                proposed = %proposal.action,
                forced = ?decision.forced,
                attempts,
                "proposal outside permitted set"
            );
            if attempts >= PROPOSAL_ATTEMPTS {
                let permitted = match &decision.forced {
                    Some(forced) => BTreeSet::from([forced.clone()]),
                    None => decision.permitted.clone(),
                };
                return Err(self.fail(ProposalViolation {
                    proposed: proposal.action,
                    permitted,
                    attempts,
                }));
            }
            correction = Some(match &decision.forced {
                Some(forced) => format!(
                    "'{}' is not permitted this turn. '{forced}' is forced this turn.",
                    proposal.action
                ),
                None => format!(
                    "'{}' is not permitted this turn. Choose one of: {}.",
                    proposal.action,
                    decision
                        .permitted
                        .iter()
                        .map(ActionRef::name)
                        .collect::<Vec<_>>()
                        .join(", ")
                ),
            });
        }
    }

    /// Put a gated proposal in front of the approver and fold the verdict.
    fn seek_approval(&mut self, proposal: &Proposal) -> Result<Gate> {
        let target = &proposal.action;
        info!(action = %target, "awaiting approval");
        let request = ApprovalRequest {
            target: target.clone(),
            input: proposal.input.clone(),
            timeout: self.scheduler.config.approval_timeout,
        };
        let verdict = match self.approver.decide(&request, self.cancel) {
            Ok(verdict) => verdict,
            Err(err) => {
                // No verdict counts as a deny, whatever stopped the approver.
                self.resolve(target, ApprovalDecision::Deny);
                return Err(match err.downcast::<ApprovalTimedOut>() {
                    Ok(timed_out) => self.fail(timed_out),
                    Err(err) => self.fail(SchedulerError::Collaborator {
                        collaborator: "approver",
                        cause: format!("{err:#}"),
                    }),
                });
            }
        };

        if self.cancel.is_cancelled() {
            self.resolve(target, ApprovalDecision::Deny);
            return Ok(Gate::Cancelled);
        }
        self.resolve(target, verdict);
        if verdict == ApprovalDecision::Deny {
            return Ok(Gate::Redecide);
        }

        // The grant may have changed what the requirements say; only run the
        // held proposal if it is still exactly what this turn allows.
        let redecided = self.decide()?;
        let still_allowed = redecided.is_permitted(target)
            && redecided.forced.as_ref().is_none_or(|forced| forced == target)
            && !redecided.requires_approval.contains(target);
        Ok(if still_allowed {
            Gate::Proceed
        } else {
            Gate::Redecide
        })
    }

    fn resolve(&mut self, target: &ActionRef, verdict: ApprovalDecision) {
        info!(action = %target, ?verdict, "approval resolved");
        self.scheduler
            .requirements
            .resolve_approval(&mut self.trajectory, target, verdict);
    }

    /// Run a tool. Failures become the step output unless the tool is fatal.
    fn execute(&self, proposal: Proposal) -> Result<Step> {
        let index = self.trajectory.len();
        let action = proposal.action;
        let Some(tool) = self.scheduler.tools.get(&action) else {
            return Err(self.fail(ToolExecutionError {
                tool: action.clone(),
                cause: "not registered".to_string(),
                timed_out: false,
            }));
        };
        let ctx = ToolContext {
            timeout: self.scheduler.config.tool_timeout,
            output_limit_bytes: self.scheduler.config.tool_output_limit_bytes,
            cancel: self.cancel.clone(),
        };
        debug!(action = %action, step = index, "executing tool");
        match tool.call(&proposal.input, &ctx) {
            Ok(output) => Ok(Step::new(index, action, proposal.input, output)),
            Err(err) => {
                let failure = match err.downcast::<ToolExecutionError>() {
                    Ok(typed) => typed,
                    Err(err) => ToolExecutionError {
                        tool: action.clone(),
                        cause: format!("{err:#}"),
                        timed_out: false,
                    },
                };
                if self.scheduler.config.fatal_tools.contains(&action) {
                    return Err(self.fail(failure));
                }
                warn!(action = %action, timed_out = failure.timed_out, cause = %failure.cause, "tool failed");
                Ok(Step::new(index, action, proposal.input, format!("error: {}", failure.cause)).failed())
            }
        }
    }

    fn record(&mut self, step: Step) -> Result<()> {
        if let Err(err) = self.trajectory.append(step.clone()) {
            return Err(self.fail(err));
        }
        debug!(step = step.index, action = %step.action, failed = step.failed, "step recorded");
        (self.on_step)(&step);
        Ok(())
    }

    fn fail(&self, error: impl Into<SchedulerError>) -> anyhow::Error {
        let error = error.into();
        warn!(err = %error, steps = self.trajectory.len(), "run aborted");
        anyhow::Error::new(RunFailure {
            error,
            steps: self.trajectory.steps().to_vec(),
        })
    }

    fn finish(self, status: RunStatus, answer: Option<String>) -> RunOutcome {
        info!(?status, steps = self.trajectory.len(), "run finished");
        RunOutcome {
            status,
            answer,
            trajectory: self.trajectory,
        }
    }
}

enum Gate {
    Proceed,
    Redecide,
    Cancelled,
}
