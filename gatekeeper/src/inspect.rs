//! Filtered, human-readable views of a trajectory.

use std::fmt::Write as _;

use clap::ValueEnum;

use crate::core::action::ActionRef;
use crate::core::types::Step;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, ValueEnum)]
pub enum StepFilter {
    #[default]
    All,
    /// Tool steps only.
    Tools,
    /// The `final_answer` step only.
    Final,
}

impl StepFilter {
    pub fn admits(self, step: &Step) -> bool {
        match self {
            Self::All => true,
            Self::Tools => !step.action.is_final_answer(),
            Self::Final => step.action.is_final_answer(),
        }
    }
}

/// Steps admitted by `filter`, optionally narrowed to one action.
pub fn filter_steps<'a>(
    steps: &'a [Step],
    filter: StepFilter,
    action: Option<&ActionRef>,
) -> Vec<&'a Step> {
    steps
        .iter()
        .filter(|step| filter.admits(step))
        .filter(|step| action.is_none_or(|action| &step.action == action))
        .collect()
}

/// One block per step: header line, then indented input and output.
pub fn render_steps(steps: &[&Step]) -> String {
    let mut out = String::new();
    for step in steps {
        let marker = if step.failed { " [failed]" } else { "" };
        let _ = writeln!(
            out,
            "#{} {}{} ({})",
            step.index,
            step.action,
            marker,
            step.timestamp.format("%H:%M:%S")
        );
        if !step.input.is_null() {
            let _ = writeln!(out, "  input:  {}", step.input);
        }
        for (i, line) in step.output.lines().enumerate() {
            let label = if i == 0 { "  output: " } else { "          " };
            let _ = writeln!(out, "{label}{line}");
        }
    }
    out
}
