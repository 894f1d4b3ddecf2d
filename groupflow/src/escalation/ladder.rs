//! Escalation ladder decision function
//!
//! Consumes a snapshot of a group's failure history and produces the tier the
//! next dispatch should run at. All decisions are deterministic.

use serde::{Deserialize, Serialize};

use super::tier::Tier;

/// Which failure path triggered the evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Verification or review rejected the work
    Review,
    /// The integration step failed (conflict, test failure, blocked, unknown)
    Merge,
    /// The worker itself asked for a stronger tier
    Requested,
}

/// Inputs to the ladder. Counts are taken *at the moment of failure*:
/// `revisions` before the increment the re-dispatch will apply, and
/// `merge_failures` including the failure being handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureContext {
    /// Tier the failed dispatch ran at
    pub tier: Tier,
    /// Review revisions recorded before this failure
    pub revisions: u32,
    /// Whether the group is flagged security-sensitive
    pub security_sensitive: bool,
    /// Failed merge attempts, including the current one
    pub merge_failures: u32,
    /// Which failure path is being evaluated
    pub kind: FailureKind,
}

impl FailureContext {
    /// Context for a review-path failure
    pub fn review(tier: Tier, revisions: u32, security_sensitive: bool) -> Self {
        Self {
            tier,
            revisions,
            security_sensitive,
            merge_failures: 0,
            kind: FailureKind::Review,
        }
    }

    /// Context for a merge-path failure
    pub fn merge(tier: Tier, merge_failures: u32) -> Self {
        Self {
            tier,
            revisions: 0,
            security_sensitive: false,
            merge_failures,
            kind: FailureKind::Merge,
        }
    }

    /// Context for an explicit worker escalation request
    pub fn requested(tier: Tier) -> Self {
        Self {
            tier,
            revisions: 0,
            security_sensitive: false,
            merge_failures: 0,
            kind: FailureKind::Requested,
        }
    }
}

/// Decision produced by the ladder
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationDecision {
    /// Tier for the next dispatch, or the planning authority
    pub target: Tier,
    /// Whether the target is above the failed dispatch's tier
    pub escalated: bool,
    /// Human-readable reason, used in logs and planning records
    pub reason: String,
}

impl EscalationDecision {
    /// Whether the group leaves the automated loop
    pub fn to_planning_authority(&self) -> bool {
        self.target == Tier::PlanningAuthority
    }
}

/// Evaluate the ladder for one failure.
pub fn escalate(ctx: &FailureContext) -> EscalationDecision {
    let (proposed, reason) = match ctx.kind {
        FailureKind::Review => review_step(ctx),
        FailureKind::Merge => merge_step(ctx),
        FailureKind::Requested => (
            ctx.tier.next(),
            format!("worker requested escalation from {}", ctx.tier),
        ),
    };

    // Never downgrade.
    let target = proposed.max(ctx.tier);

    EscalationDecision {
        target,
        escalated: target > ctx.tier,
        reason,
    }
}

fn review_step(ctx: &FailureContext) -> (Tier, String) {
    if ctx.security_sensitive {
        return match ctx.revisions {
            0 => (
                Tier::Senior,
                "security-sensitive group failed once: senior tier".to_string(),
            ),
            1 | 2 => (
                Tier::Lead,
                format!(
                    "security-sensitive group failed {} times: lead tier",
                    ctx.revisions + 1
                ),
            ),
            n => (
                Tier::PlanningAuthority,
                format!("{} revisions exhausted the ladder", n),
            ),
        };
    }

    match ctx.revisions {
        0 => (ctx.tier, "first failure: retry at the same tier".to_string()),
        1 => (Tier::Senior, "second failure: senior tier".to_string()),
        2 if ctx.tier >= Tier::Senior => (
            Tier::Lead,
            "third failure after senior attempt: lead guidance".to_string(),
        ),
        2 => (
            Tier::Senior,
            "third failure without a senior attempt: senior tier".to_string(),
        ),
        n => (
            Tier::PlanningAuthority,
            format!("{} revisions exhausted the ladder", n),
        ),
    }
}

fn merge_step(ctx: &FailureContext) -> (Tier, String) {
    match ctx.merge_failures {
        0 | 1 => (
            ctx.tier,
            "first merge failure: retry at the same tier".to_string(),
        ),
        2 => (Tier::Senior, "second merge failure: senior tier".to_string()),
        3 => (Tier::Lead, "third merge failure: lead tier".to_string()),
        n => (
            Tier::PlanningAuthority,
            format!("{} merge failures exhausted the ladder", n),
        ),
    }
}
