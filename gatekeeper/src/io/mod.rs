//! Side-effecting collaborators: processes, approvals, policy files, trajectory records.

pub mod approval;
pub mod config;
pub mod process;
pub mod proposer;
pub mod tools;
pub mod trajectory_log;
