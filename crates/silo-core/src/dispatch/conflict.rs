//! Declarative conflict detection over resource-operation declarations.
//! Pure functions: the verdict depends only on what the candidate and the
//! active calls declared, never on execution state.

use serde::{Deserialize, Serialize};

use crate::models::call::{CallId, CallState};
use crate::models::resource::{ConflictReason, ResourceOperation, ResourceSet};

/// One call the candidate is compared against: its identity, current
/// state, and declared resources.
#[derive(Clone, Debug)]
pub struct ActiveCall {
    pub call_id: CallId,
    pub state: CallState,
    pub resources: ResourceSet,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictVerdict {
    Compatible,
    Postpone,
    Reject,
}

#[derive(Clone, Debug)]
pub struct ConflictAnalysis {
    pub verdict: ConflictVerdict,
    /// Calls the candidate must queue behind, in the order they were seen.
    pub blocking: Vec<CallId>,
    pub reasons: Vec<ConflictReason>,
}

impl ConflictAnalysis {
    fn compatible() -> Self {
        Self {
            verdict: ConflictVerdict::Compatible,
            blocking: Vec::new(),
            reasons: Vec::new(),
        }
    }
}

/// Two declared operations on the same resource id are compatible only
/// when both are reads.
pub fn operations_compatible(first: ResourceOperation, second: ResourceOperation) -> bool {
    first == ResourceOperation::Read && second == ResourceOperation::Read
}

/// True iff the candidate's declarations overlap incompatibly with any
/// active declaration.
pub fn conflicts<'a>(
    candidate: &ResourceSet,
    active: impl IntoIterator<Item = &'a ResourceSet>,
) -> bool {
    active.into_iter().any(|held| {
        candidate.iter().any(|(resource_type, resource_id, requested)| {
            held.operation_for(resource_type, resource_id)
                .is_some_and(|held_op| !operations_compatible(held_op, requested))
        })
    })
}

/// Full analysis for the coordinator: which calls block the candidate and
/// why. A blocking call that is already terminal cannot be waited on, so
/// its presence upgrades the verdict from Postpone to Reject.
pub fn analyze(candidate: &ResourceSet, active: &[ActiveCall]) -> ConflictAnalysis {
    let mut analysis = ConflictAnalysis::compatible();

    for call in active {
        let mut blocked_by_call = false;
        for (resource_type, resource_id, requested) in candidate.iter() {
            let Some(held) = call.resources.operation_for(resource_type, resource_id) else {
                continue;
            };
            if operations_compatible(held, requested) {
                continue;
            }
            blocked_by_call = true;
            analysis.reasons.push(ConflictReason {
                call_id: call.call_id,
                resource_type,
                resource_id: resource_id.to_string(),
                held,
                requested,
            });
        }
        if blocked_by_call {
            analysis.blocking.push(call.call_id);
            if call.state.is_terminal() {
                analysis.verdict = ConflictVerdict::Reject;
            } else if analysis.verdict != ConflictVerdict::Reject {
                analysis.verdict = ConflictVerdict::Postpone;
            }
        }
    }

    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::resource::ResourceType;

    const OPERATIONS: [ResourceOperation; 4] = [
        ResourceOperation::Create,
        ResourceOperation::Read,
        ResourceOperation::Update,
        ResourceOperation::Delete,
    ];

    fn declaring(operation: ResourceOperation) -> ResourceSet {
        let mut resources = ResourceSet::new();
        resources.declare(ResourceType::Repository, "demo", operation);
        resources
    }

    #[test]
    fn only_read_read_is_compatible() {
        for first in OPERATIONS {
            for second in OPERATIONS {
                let expected =
                    first == ResourceOperation::Read && second == ResourceOperation::Read;
                assert_eq!(
                    operations_compatible(first, second),
                    expected,
                    "{first} vs {second}"
                );
                assert_eq!(
                    conflicts(&declaring(first), [&declaring(second)]),
                    !expected,
                    "{first} vs {second}"
                );
            }
        }
    }

    #[test]
    fn compatibility_is_symmetric() {
        for first in OPERATIONS {
            for second in OPERATIONS {
                assert_eq!(
                    operations_compatible(first, second),
                    operations_compatible(second, first)
                );
            }
        }
    }

    #[test]
    fn disjoint_resources_never_conflict() {
        let mut candidate = ResourceSet::new();
        candidate.deletes(ResourceType::Repository, "alpha");
        let mut held = ResourceSet::new();
        held.deletes(ResourceType::Repository, "beta");
        held.updates(ResourceType::Importer, "alpha");
        assert!(!conflicts(&candidate, [&held]));
    }

    #[test]
    fn same_id_different_type_does_not_conflict() {
        let mut candidate = ResourceSet::new();
        candidate.updates(ResourceType::Repository, "demo");
        let mut held = ResourceSet::new();
        held.updates(ResourceType::Distributor, "demo");
        assert!(!conflicts(&candidate, [&held]));
    }

    #[test]
    fn analysis_collects_every_blocking_call_with_reasons() {
        let mut candidate = ResourceSet::new();
        candidate.updates(ResourceType::Repository, "demo");
        candidate.reads(ResourceType::Importer, "demo");

        let active = vec![
            ActiveCall {
                call_id: CallId(1),
                state: CallState::Running,
                resources: declaring(ResourceOperation::Update),
            },
            ActiveCall {
                call_id: CallId(2),
                state: CallState::Waiting,
                resources: {
                    let mut held = ResourceSet::new();
                    held.updates(ResourceType::Importer, "demo");
                    held
                },
            },
            ActiveCall {
                call_id: CallId(3),
                state: CallState::Running,
                resources: {
                    let mut held = ResourceSet::new();
                    held.reads(ResourceType::Importer, "demo");
                    held
                },
            },
        ];

        let analysis = analyze(&candidate, &active);
        assert_eq!(analysis.verdict, ConflictVerdict::Postpone);
        assert_eq!(analysis.blocking, vec![CallId(1), CallId(2)]);
        assert_eq!(analysis.reasons.len(), 2);
        assert_eq!(analysis.reasons[0].resource_id, "demo");
        assert_eq!(analysis.reasons[0].held, ResourceOperation::Update);
    }

    #[test]
    fn terminal_blocker_upgrades_to_reject() {
        let candidate = declaring(ResourceOperation::Update);
        let active = vec![ActiveCall {
            call_id: CallId(5),
            state: CallState::Canceled,
            resources: declaring(ResourceOperation::Update),
        }];
        let analysis = analyze(&candidate, &active);
        assert_eq!(analysis.verdict, ConflictVerdict::Reject);
        assert_eq!(analysis.blocking, vec![CallId(5)]);
    }

    #[test]
    fn empty_candidate_is_always_compatible() {
        let active = vec![ActiveCall {
            call_id: CallId(1),
            state: CallState::Running,
            resources: declaring(ResourceOperation::Delete),
        }];
        let analysis = analyze(&ResourceSet::new(), &active);
        assert_eq!(analysis.verdict, ConflictVerdict::Compatible);
        assert!(analysis.blocking.is_empty());
    }
}
