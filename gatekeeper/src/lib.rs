//! Requirement-gated action scheduling for tool-using agents.
//!
//! An external proposer picks each next action; this crate decides which
//! actions it may pick. Requirements inspect the run so far and emit rules, the
//! reconciler merges them into one decision per turn, and the loop enforces it:
//!
//! - **[`core`]**: Pure, deterministic logic (trajectory, rules, reconciliation).
//!   No I/O.
//! - **[`requirements`]**: Built-in policies and the [`requirements::Requirement`] trait.
//! - **[`io`]**: Side-effecting collaborators (tools, proposers, approvers,
//!   policy files, trajectory records).
//!
//! Orchestration modules ([`looping`], [`agent`], [`handoff`], [`inspect`])
//! tie them together.

pub mod agent;
pub mod cancel;
pub mod core;
pub mod error;
pub mod exit_codes;
pub mod handoff;
pub mod inspect;
pub mod io;
pub mod logging;
pub mod looping;
pub mod requirements;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
