//! Loop-level scenarios for common requirement policies.
//!
//! Each test wires real requirements into a scheduler, drives a full run with
//! scripted collaborators, and checks the recorded trajectory: which actions
//! ran, in what order, and what the proposer was allowed to pick each turn.

use std::sync::Arc;

use serde_json::json;

use gatekeeper::agent::Agent;
use gatekeeper::cancel::CancellationToken;
use gatekeeper::core::action::{ActionMatcher, ActionRef};
use gatekeeper::core::trajectory::Trajectory;
use gatekeeper::core::types::{ApprovalDecision, Interrupt, RequirementId, RunStatus, Step};
use gatekeeper::error::{ConflictKind, RunFailure, SchedulerError};
use gatekeeper::io::approval::StaticApprover;
use gatekeeper::io::proposer::Proposal;
use gatekeeper::io::tools::{FnTool, ToolRegistry};
use gatekeeper::io::trajectory_log::{load_trajectory, write_trajectory};
use gatekeeper::looping::{RunOutcome, Scheduler, SchedulerConfig};
use gatekeeper::requirements::{
    AskPermissionRequirement, ConditionalRequirement, PatternStopRequirement, RequirementSet,
    RetryOnEmptyRequirement, StopMode,
};
use gatekeeper::test_support::{
    PreferenceProposer, ScriptedApprover, ScriptedProposer, echo_tool, registry, sequence_tool,
    static_tool,
};

const CARD: &str = r"\b\d{4}[\s-]?\d{4}[\s-]?\d{4}[\s-]?\d{4}\b";

fn scheduler(tools: Vec<FnTool>, requirements: RequirementSet) -> Scheduler {
    scheduler_with(tools, requirements, SchedulerConfig::default())
}

fn scheduler_with(
    tools: Vec<FnTool>,
    requirements: RequirementSet,
    config: SchedulerConfig,
) -> Scheduler {
    Scheduler::new(registry(tools), requirements, config).expect("scheduler")
}

fn actions(outcome: &RunOutcome) -> Vec<&str> {
    outcome
        .trajectory
        .steps()
        .iter()
        .map(|step| step.action.name())
        .collect()
}

fn failure(err: &anyhow::Error) -> &RunFailure {
    err.downcast_ref::<RunFailure>().expect("run failure")
}

/// A weather lookup may only run once the user's location is known.
#[test]
fn prerequisite_runs_before_dependent_tool() {
    let scheduler = scheduler(
        vec![
            static_tool("fetch_user_location", "User location: San Francisco, CA"),
            echo_tool("weather_tool"),
        ],
        RequirementSet::new().with(
            ConditionalRequirement::builder("weather_tool")
                .only_after(["fetch_user_location"])
                .build()
                .expect("requirement"),
        ),
    );
    let proposer = PreferenceProposer::new(["weather_tool", "fetch_user_location"]);

    let outcome = scheduler
        .run(
            Trajectory::with_prompt(None, "What's the weather like?"),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(
        actions(&outcome),
        vec!["fetch_user_location", "weather_tool", "final_answer"]
    );
    let calls = proposer.calls();
    assert!(!calls[0].permitted.contains(&ActionRef::new("weather_tool")));
    assert!(calls[1].permitted.contains(&ActionRef::new("weather_tool")));
}

/// Every prerequisite must have run, in whatever order the proposer likes.
#[test]
fn prerequisites_are_satisfied_in_any_order() {
    let scheduler = scheduler(
        vec![
            static_tool("a", "a done"),
            static_tool("b", "b done"),
            static_tool("c", "c done"),
        ],
        RequirementSet::new().with(
            ConditionalRequirement::builder("c")
                .only_after(["a", "b"])
                .build()
                .expect("requirement"),
        ),
    );
    let proposer = PreferenceProposer::new(["c", "b", "a"]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(actions(&outcome), vec!["b", "a", "c", "final_answer"]);
}

/// min = max = 1: the estimator runs exactly once and an early answer is refused.
#[test]
fn exactly_once_blocks_early_answer_and_repeats() {
    let scheduler = scheduler(
        vec![static_tool("price_estimator", "Estimated price: $49.99")],
        RequirementSet::new().with(
            ConditionalRequirement::builder("price_estimator")
                .min_invocations(1)
                .max_invocations(1)
                .build()
                .expect("requirement"),
        ),
    );
    let proposer = ScriptedProposer::new(vec![
        Proposal::final_answer("probably cheap"),
        Proposal::tool("price_estimator", json!("laptop")),
        Proposal::tool("price_estimator", json!("laptop again")),
        Proposal::final_answer("$49.99"),
    ]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(outcome.answer.as_deref(), Some("$49.99"));
    assert_eq!(actions(&outcome), vec!["price_estimator", "final_answer"]);

    let calls = proposer.calls();
    assert_eq!(calls.len(), 4);
    assert!(!calls[0].permitted.contains(&ActionRef::final_answer()));
    assert!(calls[1].correction.is_some());
    assert!(!calls[2].permitted.contains(&ActionRef::new("price_estimator")));
    assert!(calls[3].correction.is_some());
}

/// Analysis is forced at the first step and never offered again.
#[test]
fn analysis_is_forced_first_and_only_once() {
    let scheduler = scheduler(
        vec![echo_tool("analyze_task"), echo_tool("search")],
        RequirementSet::new().with(
            ConditionalRequirement::builder("analyze_task")
                .force_at_step(1)
                .max_invocations(1)
                .build()
                .expect("requirement"),
        ),
    );
    let proposer = PreferenceProposer::new(["search"]);

    let outcome = scheduler
        .run(
            Trajectory::with_prompt(None, "Plan a marketing campaign"),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(actions(&outcome), vec!["analyze_task", "search", "final_answer"]);
    let calls = proposer.calls();
    assert_eq!(calls[0].forced, Some(ActionRef::new("analyze_task")));
    assert!(!calls[1].permitted.contains(&ActionRef::new("analyze_task")));
}

/// Reason, act, reason: thinking opens the run, follows every other tool and
/// never repeats back to back.
#[test]
fn react_loop_alternates_thinking_and_tools() {
    let scheduler = scheduler(
        vec![
            echo_tool("think"),
            static_tool("wikipedia", "Paris has about 2.16 million people."),
            static_tool("weather", "Paris: 22°C, partly cloudy."),
        ],
        RequirementSet::new().with(
            ConditionalRequirement::builder("think")
                .force_at_step(1)
                .force_after([ActionMatcher::AnyTool])
                .consecutive_allowed(false)
                .build()
                .expect("requirement"),
        ),
    );
    let proposer = PreferenceProposer::new(["wikipedia", "weather"]);

    let outcome = scheduler
        .run(
            Trajectory::with_prompt(None, "Weather and population of Paris?"),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec!["think", "wikipedia", "think", "weather", "think", "final_answer"]
    );
    let think = ActionRef::new("think");
    for (turn, call) in proposer.calls().iter().enumerate() {
        if turn % 2 == 0 {
            assert_eq!(call.forced.as_ref(), Some(&think), "turn {turn}");
        } else {
            assert!(!call.permitted.contains(&think), "turn {turn}");
        }
    }
}

/// Sending the summary is mandatory, and the answer is forced right after it.
#[test]
fn answer_is_forced_after_the_summary_is_sent() {
    let scheduler = scheduler(
        vec![
            static_tool("get_sales_data", "Q1: $2.1M | Q2: $2.4M"),
            echo_tool("send_email_summary"),
        ],
        RequirementSet::new()
            .with(
                ConditionalRequirement::builder("send_email_summary")
                    .min_invocations(1)
                    .max_invocations(1)
                    .build()
                    .expect("requirement"),
            )
            .with(
                ConditionalRequirement::builder(ActionRef::final_answer())
                    .force_after(["send_email_summary"])
                    .build()
                    .expect("requirement"),
            ),
    );
    let proposer = PreferenceProposer::new(["get_sales_data", "send_email_summary"])
        .with_answer("Report sent.");

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec!["get_sales_data", "send_email_summary", "final_answer"]
    );
    assert_eq!(outcome.answer.as_deref(), Some("Report sent."));
    let calls = proposer.calls();
    assert!(!calls[0].permitted.contains(&ActionRef::final_answer()));
    assert_eq!(calls[2].forced, Some(ActionRef::final_answer()));

    let mut prefix = Trajectory::new();
    for step in &outcome.trajectory.steps()[..2] {
        prefix.append(step.clone()).expect("append");
    }
    let decision = scheduler.decide(&mut prefix).expect("decide");
    assert_eq!(decision.interrupt, Some(Interrupt::HaltWithAnswer));
}

/// A card number in tool output forces a refusal as the final answer.
#[test]
fn forbidden_output_forces_refusal() {
    let stop = PatternStopRequirement::new(CARD, "the output contains a card number")
        .expect("pattern")
        .with_directive("Refuse: {{ reason }} (step {{ step_index }}, {{ action }})")
        .expect("directive");
    let scheduler = scheduler(
        vec![
            static_tool("lookup", "card on file: 4111 1111 1111 1111"),
            static_tool("other", "fine"),
        ],
        RequirementSet::new().with(stop),
    );
    let proposer = PreferenceProposer::new(["lookup", "other"]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    assert_eq!(actions(&outcome), vec!["lookup", "final_answer"]);
    assert_eq!(
        outcome.answer.as_deref(),
        Some("Refuse: the output contains a card number (step 0, lookup)")
    );
    assert_eq!(proposer.calls()[1].forced, Some(ActionRef::final_answer()));
}

#[test]
fn forbidden_output_aborts_in_abort_mode() {
    let stop = PatternStopRequirement::new(CARD, "card number")
        .expect("pattern")
        .with_mode(StopMode::Abort);
    let scheduler = scheduler(
        vec![static_tool("lookup", "4111-1111-1111-1111")],
        RequirementSet::new().with(stop),
    );
    let proposer = PreferenceProposer::new(["lookup"]);

    let err = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .unwrap_err();

    let failure = failure(&err);
    match &failure.error {
        SchedulerError::SafetyStop(stop) => {
            assert_eq!(stop.reason, "card number");
            assert_eq!(stop.step_index, 0);
        }
        other => panic!("expected safety stop, got {other:?}"),
    }
    assert_eq!(failure.trajectory_prefix(), "0:lookup");
}

/// An empty search result forces a rephrase before searching again.
#[test]
fn empty_search_forces_rephrase() {
    let scheduler = scheduler(
        vec![
            sequence_tool("search", &[""], "New York City: 8.3 million people"),
            echo_tool("rephrase"),
        ],
        RequirementSet::new()
            .with(RetryOnEmptyRequirement::new("rephrase").watching("search"))
            .with(
                ConditionalRequirement::builder("search")
                    .max_invocations(3)
                    .build()
                    .expect("requirement"),
            ),
    );
    let proposer = ScriptedProposer::new(vec![
        Proposal::tool("search", json!("NYC")),
        Proposal::tool("rephrase", json!("New York City")),
        Proposal::tool("search", json!("New York City")),
        Proposal::final_answer("About 8.3 million."),
    ]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec!["search", "rephrase", "search", "final_answer"]
    );
    let steps = outcome.trajectory.steps();
    assert_eq!(steps[0].output, "");
    assert_eq!(steps[1].output, "rephrase: New York City");
    assert_eq!(steps[2].output, "New York City: 8.3 million people");

    let calls = proposer.calls();
    assert_eq!(calls[1].forced, Some(ActionRef::new("rephrase")));
    assert_eq!(calls[2].forced, None);
}

fn expert(name: &str, tool: FnTool, script: Vec<Proposal>) -> Agent {
    let scheduler = scheduler(vec![tool], RequirementSet::new());
    Agent::new(
        name,
        scheduler,
        Arc::new(ScriptedProposer::new(script)),
        Arc::new(StaticApprover::deny_all()),
    )
    .with_instructions("Keep responses brief and focused.")
}

/// The weather expert may only be consulted after the destination expert.
#[test]
fn handoffs_follow_their_ordering_rule() {
    let destination = expert(
        "transfer_to_destination_expert",
        static_tool("get_destination_info", "Top beach destinations: Maldives, Bali"),
        vec![
            Proposal::tool("get_destination_info", json!("beach")),
            Proposal::final_answer("Maldives"),
        ],
    );
    let weather = expert(
        "transfer_to_weather_expert",
        static_tool("get_weather_info", "32°C, sunny"),
        vec![
            Proposal::tool("get_weather_info", json!("Maldives")),
            Proposal::final_answer("Maldives: 32°C, sunny"),
        ],
    );
    let tools = ToolRegistry::new()
        .with(destination.into_handoff("Travel recommendations"))
        .expect("register")
        .with(weather.into_handoff("Climate information"))
        .expect("register");
    let requirements = RequirementSet::new().with(
        ConditionalRequirement::builder("transfer_to_weather_expert")
            .only_after(["transfer_to_destination_expert"])
            .build()
            .expect("requirement"),
    );
    let scheduler =
        Scheduler::new(tools, requirements, SchedulerConfig::default()).expect("scheduler");
    let proposer =
        PreferenceProposer::new(["transfer_to_weather_expert", "transfer_to_destination_expert"]);

    let outcome = scheduler
        .run(
            Trajectory::with_prompt(None, "Plan a beach vacation"),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec![
            "transfer_to_destination_expert",
            "transfer_to_weather_expert",
            "final_answer"
        ]
    );
    let steps = outcome.trajectory.steps();
    assert_eq!(steps[0].output, "Maldives");
    assert_eq!(steps[1].output, "Maldives: 32°C, sunny");
    assert!(steps.iter().all(|step| !step.failed));
}

/// A nested run that ends without an answer fails the handoff step, not the parent.
#[test]
fn incomplete_handoff_becomes_tool_error() {
    let nested = Agent::new(
        "researcher",
        scheduler_with(
            vec![static_tool("search", "hit")],
            RequirementSet::new(),
            SchedulerConfig {
                max_steps: 1,
                ..SchedulerConfig::default()
            },
        ),
        Arc::new(ScriptedProposer::new(vec![Proposal::tool(
            "search",
            json!("anything"),
        )])),
        Arc::new(StaticApprover::deny_all()),
    );
    let tools = ToolRegistry::new()
        .with(nested.into_handoff("Research"))
        .expect("register");
    let scheduler =
        Scheduler::new(tools, RequirementSet::new(), SchedulerConfig::default()).expect("scheduler");
    let proposer = ScriptedProposer::new(vec![
        Proposal::tool("researcher", json!({"task": "find it"})),
        Proposal::final_answer("gave up"),
    ]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(outcome.status, RunStatus::Completed);
    let step = &outcome.trajectory.steps()[0];
    assert!(step.failed);
    assert!(
        step.output.contains("ran out of steps"),
        "output: {}",
        step.output
    );
}

fn email_scheduler(remember_choices: bool) -> Scheduler {
    scheduler(
        vec![
            static_tool("draft_report", "Q4 Sales Report: Revenue $3.2M"),
            echo_tool("send_email_to_manager"),
        ],
        RequirementSet::new().with(AskPermissionRequirement::new(
            "send_email_to_manager",
            remember_choices,
        )),
    )
}

fn email_script() -> Vec<Proposal> {
    vec![
        Proposal::tool("draft_report", json!("Q4")),
        Proposal::tool("send_email_to_manager", json!("first")),
        Proposal::tool("send_email_to_manager", json!("second")),
        Proposal::final_answer("sent"),
    ]
}

#[test]
fn permission_without_memory_asks_every_time() {
    let scheduler = email_scheduler(false);
    let proposer = ScriptedProposer::new(email_script());
    let approver = ScriptedApprover::new(vec![ApprovalDecision::Grant, ApprovalDecision::Grant]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &approver,
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec![
            "draft_report",
            "send_email_to_manager",
            "send_email_to_manager",
            "final_answer"
        ]
    );
    let requests = approver.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[0].input, json!("first"));
    assert_eq!(requests[1].input, json!("second"));
}

#[test]
fn permission_with_memory_asks_once() {
    let scheduler = email_scheduler(true);
    let proposer = ScriptedProposer::new(email_script());
    let approver = ScriptedApprover::new(vec![ApprovalDecision::Grant]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &approver,
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(outcome.trajectory.len(), 4);
    assert_eq!(approver.requests().len(), 1);
}

/// A deny on the second request removes the tool; the proposer moves on.
#[test]
fn later_denial_disallows_the_tool() {
    let scheduler = email_scheduler(false);
    let proposer = ScriptedProposer::new(email_script());
    let approver = ScriptedApprover::new(vec![ApprovalDecision::Grant]);

    let outcome = scheduler
        .run(
            Trajectory::new(),
            &proposer,
            &approver,
            &CancellationToken::new(),
        )
        .expect("run");

    assert_eq!(
        actions(&outcome),
        vec!["draft_report", "send_email_to_manager", "final_answer"]
    );
    assert_eq!(approver.requests().len(), 2);
    let last_call = proposer.calls().pop().expect("calls");
    assert!(
        !last_call
            .permitted
            .contains(&ActionRef::new("send_email_to_manager"))
    );
}

/// Deciding twice at the same length changes nothing.
#[test]
fn decide_is_idempotent() {
    let scheduler = scheduler(
        vec![
            static_tool("lookup", "4111 1111 1111 1111"),
            static_tool("think", "hmm"),
        ],
        RequirementSet::new()
            .with(PatternStopRequirement::new(CARD, "card number").expect("pattern"))
            .with(
                ConditionalRequirement::builder("think")
                    .max_invocations(2)
                    .build()
                    .expect("requirement"),
            ),
    );
    let mut trajectory = Trajectory::with_prompt(None, "look it up");
    trajectory
        .append(Step::new(
            0,
            ActionRef::new("lookup"),
            json!("id 7"),
            "4111 1111 1111 1111",
        ))
        .expect("append");

    let first = scheduler.decide(&mut trajectory).expect("decide");
    let snapshot = trajectory.clone();
    let second = scheduler.decide(&mut trajectory).expect("decide");

    assert_eq!(first, second);
    assert_eq!(trajectory, snapshot);
    assert_eq!(trajectory.memory().directives().count(), 1);
    assert_eq!(first.forced, Some(ActionRef::final_answer()));
}

/// Conflicts name every requirement involved and are never resolved silently.
#[test]
fn conflicting_forces_report_their_sources() {
    let scheduler = scheduler(
        vec![static_tool("a", "a"), static_tool("b", "b")],
        RequirementSet::new()
            .with(
                ConditionalRequirement::builder("a")
                    .force_at_step(1)
                    .build()
                    .expect("requirement"),
            )
            .with(
                ConditionalRequirement::builder("b")
                    .force_at_step(1)
                    .build()
                    .expect("requirement"),
            ),
    );

    let conflict = scheduler
        .decide(&mut Trajectory::new())
        .expect_err("conflict");
    let SchedulerError::Conflict(conflict) = conflict else {
        panic!("expected conflict, got {conflict:?}");
    };
    assert_eq!(
        conflict.kind,
        ConflictKind::MultipleForced {
            targets: vec![ActionRef::new("a"), ActionRef::new("b")]
        }
    );
    assert_eq!(
        conflict.requirements,
        vec![
            RequirementId::new("conditional:a#0"),
            RequirementId::new("conditional:b#1")
        ]
    );

    let err = scheduler
        .run(
            Trajectory::new(),
            &PreferenceProposer::new(["a"]),
            &StaticApprover::deny_all(),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(failure(&err).error, SchedulerError::Conflict(_)));
    assert!(failure(&err).steps.is_empty());
}

fn booking_scheduler(max_steps: usize) -> Scheduler {
    scheduler_with(
        vec![
            static_tool("search_flights", "AA123 at 9:00 AM - $299"),
            echo_tool("book_flight"),
        ],
        RequirementSet::new()
            .with(
                ConditionalRequirement::builder("search_flights")
                    .max_invocations(1)
                    .build()
                    .expect("requirement"),
            )
            .with(
                ConditionalRequirement::builder("book_flight")
                    .only_after(["search_flights"])
                    .max_invocations(2)
                    .build()
                    .expect("requirement"),
            )
            .with(AskPermissionRequirement::new("book_flight", true)),
        SchedulerConfig {
            max_steps,
            ..SchedulerConfig::default()
        },
    )
}

/// A run persisted mid-way resumes with its steps and approval memory intact.
#[test]
fn resumed_run_keeps_counts_and_grants() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("trajectory.json");

    let approver = ScriptedApprover::new(vec![ApprovalDecision::Grant]);
    let first = booking_scheduler(2)
        .run(
            Trajectory::with_prompt(None, "Book NYC to LA"),
            &PreferenceProposer::new(["book_flight", "search_flights"]).with_repeats(),
            &approver,
            &CancellationToken::new(),
        )
        .expect("first run");
    assert_eq!(first.status, RunStatus::Incomplete);
    assert_eq!(actions(&first), vec!["search_flights", "book_flight"]);
    assert_eq!(approver.requests().len(), 1);
    write_trajectory(&path, &first.trajectory).expect("write");

    let loaded = load_trajectory(&path).expect("load");
    assert_eq!(loaded, first.trajectory);

    let never = ScriptedApprover::new(vec![]);
    let proposer = PreferenceProposer::new(["book_flight", "search_flights"])
        .with_repeats()
        .with_answer("Booked AA123.");
    let resumed = booking_scheduler(10)
        .run(loaded, &proposer, &never, &CancellationToken::new())
        .expect("resumed run");

    assert_eq!(resumed.status, RunStatus::Completed);
    assert_eq!(
        actions(&resumed),
        vec!["search_flights", "book_flight", "book_flight", "final_answer"]
    );
    assert_eq!(resumed.trajectory.steps()[2].index, 2);
    assert!(never.requests().is_empty());
    let calls = proposer.calls();
    assert_eq!(calls[0].step_count, 2);
    assert!(!calls[0].permitted.contains(&ActionRef::new("search_flights")));
    assert!(!calls[1].permitted.contains(&ActionRef::new("book_flight")));
}
