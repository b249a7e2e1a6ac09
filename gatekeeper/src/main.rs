//! Command-line host for requirement-gated agent runs.
//!
//! Policies are TOML files naming tools, nested agents and requirements.
//! `validate` checks one, `decide` replays a recorded trajectory to show what
//! the next turn allows, `inspect` prints a recorded trajectory, and `run`
//! drives a full run with an external proposer command.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gatekeeper::agent::Agent;
use gatekeeper::cancel::CancellationToken;
use gatekeeper::core::action::ActionRef;
use gatekeeper::core::trajectory::Trajectory;
use gatekeeper::core::types::RunStatus;
use gatekeeper::error::{RunFailure, SchedulerError};
use gatekeeper::exit_codes;
use gatekeeper::inspect::{StepFilter, filter_steps, render_steps};
use gatekeeper::io::approval::{Approver, StaticApprover, TerminalApprover};
use gatekeeper::io::trajectory_log::{load_trajectory, write_trajectory};
use tracing::warn;

#[derive(Parser)]
#[command(
    name = "gatekeeper",
    version,
    about = "Requirement-gated action scheduler for tool-using agents"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load a policy, build its requirements and nested agents, and report problems.
    Validate { policy: PathBuf },
    /// Print the decision for the next turn of a recorded trajectory as JSON.
    Decide {
        policy: PathBuf,
        /// Recorded trajectory; an empty one when omitted.
        #[arg(short, long)]
        trajectory: Option<PathBuf>,
    },
    /// Print the steps of a recorded trajectory.
    Inspect {
        trajectory: PathBuf,
        #[arg(long, value_enum, default_value_t = StepFilter::All)]
        include: StepFilter,
        /// Only steps of this action.
        #[arg(long)]
        action: Option<String>,
    },
    /// Drive a full run and print the final answer.
    Run {
        policy: PathBuf,
        #[arg(short, long)]
        prompt: String,
        /// Write the trajectory here when the run ends.
        #[arg(short, long)]
        out: Option<PathBuf>,
        /// Grant every approval request instead of asking on the terminal.
        #[arg(long)]
        auto_approve: bool,
    },
}

fn main() {
    gatekeeper::logging::init();
    let code = match run() {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            if let Some(failure) = err.downcast_ref::<RunFailure>() {
                eprintln!("trajectory: {}", failure.trajectory_prefix());
            }
            exit_code_for(&err)
        }
    };
    std::process::exit(code);
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Validate { policy } => cmd_validate(&policy),
        Command::Decide { policy, trajectory } => cmd_decide(&policy, trajectory.as_deref()),
        Command::Inspect {
            trajectory,
            include,
            action,
        } => cmd_inspect(&trajectory, include, action.map(ActionRef::new)),
        Command::Run {
            policy,
            prompt,
            out,
            auto_approve,
        } => cmd_run(&policy, &prompt, out.as_deref(), auto_approve),
    }
}

fn cmd_validate(policy: &Path) -> Result<i32> {
    let agent = Agent::from_policy(policy, Arc::new(StaticApprover::deny_all()))?;
    let scheduler = agent.scheduler();
    println!(
        "ok: {} tools, {} requirements",
        scheduler.tools().len(),
        scheduler.requirements().len()
    );
    Ok(exit_codes::OK)
}

fn cmd_decide(policy: &Path, trajectory: Option<&Path>) -> Result<i32> {
    let agent = Agent::from_policy(policy, Arc::new(StaticApprover::deny_all()))?;
    let mut trajectory = match trajectory {
        Some(path) => load_trajectory(path)?,
        None => Trajectory::new(),
    };
    let decision = agent.scheduler().decide(&mut trajectory)?;
    println!(
        "{}",
        serde_json::to_string_pretty(&decision).context("serialize decision")?
    );
    Ok(exit_codes::OK)
}

fn cmd_inspect(path: &Path, include: StepFilter, action: Option<ActionRef>) -> Result<i32> {
    let trajectory = load_trajectory(path)?;
    let steps = filter_steps(trajectory.steps(), include, action.as_ref());
    print!("{}", render_steps(&steps));
    Ok(exit_codes::OK)
}

fn cmd_run(policy: &Path, prompt: &str, out: Option<&Path>, auto_approve: bool) -> Result<i32> {
    let approver: Arc<dyn Approver> = if auto_approve {
        Arc::new(StaticApprover::grant_all())
    } else {
        Arc::new(TerminalApprover::spawn())
    };
    let agent = Agent::from_policy(policy, approver)?;
    let cancel = CancellationToken::new();
    cancel_on_ctrl_c(&cancel)?;
    let outcome = agent.run_with(prompt, &cancel, |step| {
        eprintln!("[{}] {}{}", step.index, step.action, if step.failed { " (failed)" } else { "" });
    })?;
    if let Some(out) = out {
        write_trajectory(out, &outcome.trajectory)?;
    }
    Ok(match outcome.status {
        RunStatus::Completed => {
            println!("{}", outcome.answer.unwrap_or_default());
            exit_codes::OK
        }
        RunStatus::Incomplete => {
            eprintln!("run ended without a final answer after {} steps", outcome.trajectory.len());
            exit_codes::INCOMPLETE
        }
        RunStatus::Cancelled => {
            eprintln!("run cancelled after {} steps", outcome.trajectory.len());
            exit_codes::CANCELLED
        }
    })
}

/// First Ctrl-C cancels the run so it can wind down and still write `--out`;
/// a second one exits immediately.
fn cancel_on_ctrl_c(cancel: &CancellationToken) -> Result<()> {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("build signal runtime")?;
    let cancel = cancel.clone();
    thread::Builder::new()
        .name("ctrl-c".to_string())
        .spawn(move || {
            runtime.block_on(async {
                if tokio::signal::ctrl_c().await.is_err() {
                    return;
                }
                warn!("interrupt received, cancelling run");
                cancel.cancel();
                if tokio::signal::ctrl_c().await.is_ok() {
                    std::process::exit(exit_codes::CANCELLED);
                }
            });
        })
        .context("spawn signal thread")?;
    Ok(())
}

fn exit_code_for(err: &anyhow::Error) -> i32 {
    let scheduler_error = err
        .downcast_ref::<RunFailure>()
        .map(|failure| &failure.error)
        .or_else(|| err.downcast_ref::<SchedulerError>());
    match scheduler_error {
        Some(SchedulerError::Conflict(_)) => exit_codes::CONFLICT,
        _ => exit_codes::INVALID,
    }
}
