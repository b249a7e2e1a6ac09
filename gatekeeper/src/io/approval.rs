//! Human approval collaborators.
//!
//! An [`Approver`] is asked once per gated proposal and blocks until it has a
//! verdict, the request times out, or the run is cancelled. On cancellation it
//! returns `Deny`; the loop notices the token and ends the run.

use std::collections::BTreeMap;
use std::io::{self, BufRead, Write};
use std::sync::Mutex;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, warn};

use crate::cancel::CancellationToken;
use crate::core::action::ActionRef;
use crate::core::types::ApprovalDecision;
use crate::error::ApprovalTimedOut;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// A gated action awaiting a verdict.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalRequest {
    pub target: ActionRef,
    /// The input the proposer wants to run the target with.
    pub input: Value,
    /// `None` waits indefinitely.
    #[serde(skip)]
    pub timeout: Option<Duration>,
}

pub trait Approver: Send + Sync {
    fn decide(&self, request: &ApprovalRequest, cancel: &CancellationToken)
    -> Result<ApprovalDecision>;
}

/// Fixed verdicts per target, with a fallback.
#[derive(Debug, Clone)]
pub struct StaticApprover {
    fallback: ApprovalDecision,
    per_target: BTreeMap<ActionRef, ApprovalDecision>,
}

impl StaticApprover {
    pub fn grant_all() -> Self {
        Self {
            fallback: ApprovalDecision::Grant,
            per_target: BTreeMap::new(),
        }
    }

    pub fn deny_all() -> Self {
        Self {
            fallback: ApprovalDecision::Deny,
            per_target: BTreeMap::new(),
        }
    }

    pub fn with(mut self, target: impl Into<ActionRef>, decision: ApprovalDecision) -> Self {
        self.per_target.insert(target.into(), decision);
        self
    }
}

impl Approver for StaticApprover {
    fn decide(
        &self,
        request: &ApprovalRequest,
        _cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        Ok(self
            .per_target
            .get(&request.target)
            .copied()
            .unwrap_or(self.fallback))
    }
}

/// Other end of a [`ChannelApprover`]: sees requests, sends verdicts.
#[derive(Debug)]
pub struct ApprovalHandle {
    pub requests: Receiver<ApprovalRequest>,
    pub decisions: Sender<ApprovalDecision>,
}

/// Approver fed from another thread over `std::sync::mpsc`.
#[derive(Debug)]
pub struct ChannelApprover {
    requests: Sender<ApprovalRequest>,
    decisions: Mutex<Receiver<ApprovalDecision>>,
}

impl ChannelApprover {
    pub fn pair() -> (Self, ApprovalHandle) {
        let (request_tx, request_rx) = mpsc::channel();
        let (decision_tx, decision_rx) = mpsc::channel();
        (
            Self {
                requests: request_tx,
                decisions: Mutex::new(decision_rx),
            },
            ApprovalHandle {
                requests: request_rx,
                decisions: decision_tx,
            },
        )
    }
}

impl Approver for ChannelApprover {
    fn decide(
        &self,
        request: &ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        // A dropped handle only matters if nobody ever answers.
        if self.requests.send(request.clone()).is_err() {
            debug!(action = %request.target, "approval handle dropped, waiting anyway");
        }
        let decisions = self
            .decisions
            .lock()
            .map_err(|_| anyhow!("approval channel lock poisoned"))?;
        Ok(wait_for(&*decisions, request, cancel)?.unwrap_or(ApprovalDecision::Deny))
    }
}

/// Interactive approver: prompts on stderr, reads `y`/`n` lines from stdin.
#[derive(Debug)]
pub struct TerminalApprover {
    lines: Mutex<Receiver<String>>,
}

impl TerminalApprover {
    /// Start the stdin reader thread.
    pub fn spawn() -> Self {
        let (tx, rx) = mpsc::channel();
        thread::spawn(move || {
            let stdin = io::stdin();
            for line in stdin.lock().lines() {
                let Ok(line) = line else { break };
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        Self {
            lines: Mutex::new(rx),
        }
    }
}

impl Approver for TerminalApprover {
    fn decide(
        &self,
        request: &ApprovalRequest,
        cancel: &CancellationToken,
    ) -> Result<ApprovalDecision> {
        let lines = self
            .lines
            .lock()
            .map_err(|_| anyhow!("terminal approver lock poisoned"))?;
        loop {
            let mut stderr = io::stderr();
            write!(
                stderr,
                "Allow '{}' with input {}? [y/n] ",
                request.target, request.input
            )?;
            stderr.flush()?;
            let Some(line) = wait_for(&*lines, request, cancel)? else {
                return Ok(ApprovalDecision::Deny);
            };
            match parse_answer(&line) {
                Some(decision) => return Ok(decision),
                None => writeln!(stderr, "please answer y or n")?,
            }
        }
    }
}

fn parse_answer(line: &str) -> Option<ApprovalDecision> {
    match line.trim().to_ascii_lowercase().as_str() {
        "y" | "yes" => Some(ApprovalDecision::Grant),
        "n" | "no" => Some(ApprovalDecision::Deny),
        _ => None,
    }
}

/// Block on `rx` until a value arrives, the request deadline passes, or the
/// token fires. `Ok(None)` means cancelled.
fn wait_for<T>(
    rx: &Receiver<T>,
    request: &ApprovalRequest,
    cancel: &CancellationToken,
) -> Result<Option<T>> {
    let deadline = request.timeout.map(|timeout| Instant::now() + timeout);
    loop {
        if cancel.is_cancelled() {
            debug!(action = %request.target, "approval wait cancelled");
            return Ok(None);
        }
        let slice = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    warn!(action = %request.target, "approval timed out");
                    return Err(ApprovalTimedOut {
                        target: request.target.clone(),
                        timeout: request.timeout.unwrap_or_default(),
                    }
                    .into());
                }
                POLL_INTERVAL.min(deadline - now)
            }
            None => POLL_INTERVAL,
        };
        match rx.recv_timeout(slice) {
            Ok(value) => return Ok(Some(value)),
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => bail!("approval source disconnected"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(timeout: Option<Duration>) -> ApprovalRequest {
        ApprovalRequest {
            target: ActionRef::new("send_email"),
            input: Value::String("to: boss".to_string()),
            timeout,
        }
    }

    #[test]
    fn static_approver_uses_per_target_override() {
        let approver = StaticApprover::grant_all().with("send_email", ApprovalDecision::Deny);
        let decision = approver
            .decide(&request(None), &CancellationToken::new())
            .expect("decide");
        assert_eq!(decision, ApprovalDecision::Deny);
    }

    #[test]
    fn channel_approver_receives_verdict_from_other_thread() {
        let (approver, handle) = ChannelApprover::pair();
        let worker = thread::spawn(move || {
            let seen = handle.requests.recv().expect("request");
            handle
                .decisions
                .send(ApprovalDecision::Grant)
                .expect("send");
            seen
        });
        let decision = approver
            .decide(&request(Some(Duration::from_secs(5))), &CancellationToken::new())
            .expect("decide");
        assert_eq!(decision, ApprovalDecision::Grant);
        assert_eq!(worker.join().expect("join").target, ActionRef::new("send_email"));
    }

    #[test]
    fn channel_approver_times_out() {
        let (approver, _handle) = ChannelApprover::pair();
        let err = approver
            .decide(
                &request(Some(Duration::from_millis(80))),
                &CancellationToken::new(),
            )
            .unwrap_err();
        let timed_out = err.downcast_ref::<ApprovalTimedOut>().expect("typed");
        assert_eq!(timed_out.target, ActionRef::new("send_email"));
    }

    #[test]
    fn cancellation_yields_deny() {
        let (approver, _handle) = ChannelApprover::pair();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let decision = approver.decide(&request(None), &cancel).expect("decide");
        assert_eq!(decision, ApprovalDecision::Deny);
    }

    #[test]
    fn answers_parse_loosely() {
        assert_eq!(parse_answer(" Yes\n"), Some(ApprovalDecision::Grant));
        assert_eq!(parse_answer("n"), Some(ApprovalDecision::Deny));
        assert_eq!(parse_answer("maybe"), None);
    }
}
