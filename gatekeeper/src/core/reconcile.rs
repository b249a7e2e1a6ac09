//! Merge per-requirement rules into one decision for the upcoming turn.

use std::collections::{BTreeMap, BTreeSet};

use crate::core::action::ActionRef;
use crate::core::types::{Decision, Disposition, Evaluation, Interrupt, RequirementId};
use crate::error::{ConflictKind, SpecificationConflict};

/// Reconcile evaluations from enabled requirements against the known tool set.
///
/// `known` holds every registered tool; `final_answer` is always added. Any
/// contradiction fails with a [`SpecificationConflict`] naming the requirements
/// involved, instead of picking a winner.
pub fn reconcile(
    known: &BTreeSet<ActionRef>,
    evaluations: &[(RequirementId, Evaluation)],
) -> Result<Decision, SpecificationConflict> {
    let mut disallowed: BTreeMap<&ActionRef, BTreeSet<&RequirementId>> = BTreeMap::new();
    let mut forced: BTreeMap<&ActionRef, BTreeSet<&RequirementId>> = BTreeMap::new();
    let mut approvals: Vec<&ActionRef> = Vec::new();

    for (id, evaluation) in evaluations {
        for rule in &evaluation.rules {
            let source = rule.source.as_ref().unwrap_or(id);
            let bucket = match rule.disposition {
                Disposition::Forced => &mut forced,
                Disposition::Disallowed => &mut disallowed,
            };
            bucket.entry(&rule.target).or_default().insert(source);
        }
        if let Some(target) = &evaluation.approval {
            approvals.push(target);
        }
    }

    let permitted: BTreeSet<ActionRef> = known
        .iter()
        .cloned()
        .chain(std::iter::once(ActionRef::final_answer()))
        .filter(|action| !disallowed.contains_key(action))
        .collect();

    if permitted.is_empty() {
        return Err(conflict(
            ConflictKind::NothingPermitted,
            disallowed.values().flatten().copied(),
        ));
    }

    if forced.len() > 1 {
        return Err(conflict(
            ConflictKind::MultipleForced {
                targets: forced.keys().map(|target| (*target).clone()).collect(),
            },
            forced.values().flatten().copied(),
        ));
    }

    let forced_target = match forced.iter().next() {
        None => None,
        Some((target, sources)) => {
            if let Some(blockers) = disallowed.get(target) {
                return Err(conflict(
                    ConflictKind::ForcedAndDisallowed {
                        target: (*target).clone(),
                    },
                    sources.iter().chain(blockers.iter()).copied(),
                ));
            }
            if !permitted.contains(*target) {
                return Err(conflict(
                    ConflictKind::UnknownForcedTarget {
                        target: (*target).clone(),
                    },
                    sources.iter().copied(),
                ));
            }
            Some((*target).clone())
        }
    };

    // A gate only matters for a target that could actually run this turn.
    let requires_approval: BTreeSet<ActionRef> = approvals
        .into_iter()
        .filter(|target| permitted.contains(*target))
        .filter(|target| forced_target.as_ref().is_none_or(|f| f == *target))
        .cloned()
        .collect();

    let interrupt = match (requires_approval.iter().next(), &forced_target) {
        (Some(target), _) => Some(Interrupt::AwaitApproval(target.clone())),
        (None, Some(target)) if target.is_final_answer() => Some(Interrupt::HaltWithAnswer),
        _ => None,
    };

    Ok(Decision {
        permitted,
        forced: forced_target,
        interrupt,
        requires_approval,
    })
}

fn conflict<'a>(
    kind: ConflictKind,
    sources: impl Iterator<Item = &'a RequirementId>,
) -> SpecificationConflict {
    let requirements: BTreeSet<RequirementId> = sources.cloned().collect();
    SpecificationConflict {
        kind,
        requirements: requirements.into_iter().collect(),
    }
}
