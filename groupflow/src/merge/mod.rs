//! Merge-retry workflow
//!
//! Integration is serialized: one group at a time, immediately after
//! approval. A failed merge never retries the merge directly. Conflicts and
//! post-merge test failures send the group back through verification and
//! review; a blocked or unreadable merge asks the reviewer whether the
//! integration target itself is broken. Each failure climbs the merge ladder
//! and the fourth consecutive one goes to the planning authority.

use chrono::Utc;
use tracing::{info, warn};

use crate::escalation::{escalate, EscalationDecision, FailureContext, Tier};
use crate::invoker::{DispatchIntent, MergeStatus, Role, StatusCode};
use crate::state::{Dispatch, GroupStatus, MergeAttempt, MergeOutcome, TaskGroup};

/// Next step after a merge report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeAction {
    /// The change set is integrated
    Merged,
    /// Re-dispatch the implementer with the failure context, then full
    /// re-verification and review
    ReturnToImplementer { tier: Tier },
    /// Ask the reviewer to assess the integration target
    AssessIntegration { tier: Tier },
    /// The merge ladder is exhausted
    EscalateToPlanning,
}

/// Outcome of recording one merge attempt
#[derive(Debug, Clone, PartialEq)]
pub struct MergeDecision {
    pub attempt: MergeAttempt,
    pub action: MergeAction,
    /// Ladder evaluation, for failures
    pub escalation: Option<EscalationDecision>,
}

/// Sequences integration attempts and their retries
#[derive(Debug, Clone, Copy, Default)]
pub struct MergeRetryWorkflow;

impl MergeRetryWorkflow {
    pub fn new() -> Self {
        Self
    }

    /// Map a merge-step status code onto an attempt outcome
    pub fn outcome_of(code: &StatusCode) -> MergeOutcome {
        match code {
            StatusCode::Merge(MergeStatus::MergeSuccess) => MergeOutcome::Success,
            StatusCode::Merge(MergeStatus::MergeConflict) => MergeOutcome::Conflict,
            StatusCode::Merge(MergeStatus::MergeTestFailure) => MergeOutcome::TestFailure,
            StatusCode::Merge(MergeStatus::MergeBlocked) => MergeOutcome::Blocked,
            _ => MergeOutcome::Unknown,
        }
    }

    /// Failed attempts since the last success
    pub fn consecutive_failures(history: &[MergeAttempt]) -> u32 {
        history
            .iter()
            .rev()
            .take_while(|a| a.outcome.is_failure())
            .count() as u32
    }

    /// Pick the group that gets the merge slot: the earliest approved group
    /// waiting in MERGE_PENDING. `None` while any merge is outstanding.
    pub fn next_in_lane<'a>(groups: &'a [TaskGroup]) -> Option<&'a TaskGroup> {
        let busy = groups.iter().any(|g| {
            g.status == GroupStatus::MergePending
                && g.outstanding.as_ref().is_some_and(|d| d.role == Role::Merger)
        });
        if busy {
            return None;
        }
        groups
            .iter()
            .filter(|g| g.status == GroupStatus::MergePending && g.outstanding.is_none())
            .min_by(|a, b| a.approved_at.cmp(&b.approved_at).then_with(|| a.id.cmp(&b.id)))
    }

    /// Plan the merge dispatch for a group holding the merge slot
    pub fn begin(&self, group: &mut TaskGroup) -> Option<Dispatch> {
        if group.status != GroupStatus::MergePending || group.outstanding.is_some() {
            return None;
        }
        let handle = group.integration_handle.clone();
        Some(group.plan_dispatch(Role::Merger, DispatchIntent::Merge, handle))
    }

    /// Record the attempt a merge report describes and decide what follows.
    ///
    /// `history` is the group's prior attempts; the new attempt is numbered
    /// after them.
    pub fn record_attempt(
        &self,
        group: &TaskGroup,
        history: &[MergeAttempt],
        code: &StatusCode,
        detail: Option<String>,
    ) -> MergeDecision {
        let outcome = Self::outcome_of(code);
        let attempt = MergeAttempt {
            session_id: group.session_id.clone(),
            group_id: group.id.clone(),
            attempt: history.len() as u32 + 1,
            outcome,
            tier: group.tier,
            detail,
            recorded_at: Utc::now(),
        };

        if outcome == MergeOutcome::Success {
            info!(group = %group.id, attempt = attempt.attempt, "Merge succeeded");
            return MergeDecision {
                attempt,
                action: MergeAction::Merged,
                escalation: None,
            };
        }

        let failures = Self::consecutive_failures(history) + 1;
        let decision = escalate(&FailureContext::merge(group.tier, failures));
        warn!(
            group = %group.id,
            attempt = attempt.attempt,
            outcome = %outcome,
            failures,
            target = %decision.target,
            "Merge failed"
        );

        let action = if decision.to_planning_authority() {
            MergeAction::EscalateToPlanning
        } else {
            match outcome {
                MergeOutcome::Conflict | MergeOutcome::TestFailure => {
                    MergeAction::ReturnToImplementer {
                        tier: decision.target,
                    }
                }
                _ => MergeAction::AssessIntegration {
                    tier: decision.target,
                },
            }
        };

        MergeDecision {
            attempt,
            action,
            escalation: Some(decision),
        }
    }
}
