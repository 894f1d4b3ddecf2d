//! Legal transition table for task-group review status
//!
//! Every status change goes through [`advance`], which rejects edges outside
//! the table and appends a [`TransitionRecord`] to the group's history.

use std::fmt;

use chrono::Utc;
use tracing::debug;

use crate::state::{GroupStatus, TaskGroup, TransitionRecord};

/// Legal transitions between review states.
///
/// ```text
/// PENDING               → DISPATCHED
/// DISPATCHED            → AWAITING_VERIFICATION | INVESTIGATING | DISPATCHED | AWAITING_REVIEW
/// AWAITING_VERIFICATION → VERIFIED | DISPATCHED | INVESTIGATING | AWAITING_REVIEW
///                         | AWAITING_VERIFICATION
/// VERIFIED              → AWAITING_REVIEW
/// AWAITING_REVIEW       → APPROVED | DISPATCHED | AWAITING_VERIFICATION | INVESTIGATING
/// APPROVED              → MERGE_PENDING
/// MERGE_PENDING         → MERGED | AWAITING_VERIFICATION | AWAITING_REVIEW
/// INVESTIGATING         → INVESTIGATING | DISPATCHED | AWAITING_REVIEW
/// any non-terminal      → BLOCKED_ESCALATED
/// ```
pub fn is_legal_transition(from: GroupStatus, to: GroupStatus) -> bool {
    use GroupStatus::*;

    if to == BlockedEscalated && !from.is_terminal() {
        return true;
    }

    matches!(
        (from, to),
        (Pending, Dispatched)
            | (Dispatched, AwaitingVerification)
            | (Dispatched, Investigating)
            | (Dispatched, Dispatched)
            | (Dispatched, AwaitingReview)
            | (AwaitingVerification, Verified)
            | (AwaitingVerification, Dispatched)
            | (AwaitingVerification, Investigating)
            | (AwaitingVerification, AwaitingReview)
            // Implementer finished merge recovery; the verifier goes next
            | (AwaitingVerification, AwaitingVerification)
            | (Verified, AwaitingReview)
            | (AwaitingReview, Approved)
            | (AwaitingReview, Dispatched)
            | (AwaitingReview, AwaitingVerification)
            | (AwaitingReview, Investigating)
            | (Approved, MergePending)
            | (MergePending, Merged)
            | (MergePending, AwaitingVerification)
            | (MergePending, AwaitingReview)
            | (Investigating, Investigating)
            | (Investigating, Dispatched)
            | (Investigating, AwaitingReview)
    )
}

/// Error returned when an illegal transition is attempted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IllegalTransition {
    pub group_id: String,
    pub from: GroupStatus,
    pub to: GroupStatus,
}

impl fmt::Display for IllegalTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Illegal transition for group {}: {} -> {}",
            self.group_id, self.from, self.to
        )
    }
}

impl std::error::Error for IllegalTransition {}

/// Move `group` to `to`, recording the edge. Leaves the group untouched on
/// an illegal edge.
pub fn advance(
    group: &mut TaskGroup,
    to: GroupStatus,
    iteration: u32,
    reason: Option<&str>,
) -> Result<(), IllegalTransition> {
    let from = group.status;
    if !is_legal_transition(from, to) {
        return Err(IllegalTransition {
            group_id: group.id.clone(),
            from,
            to,
        });
    }

    let now = Utc::now();
    group.history.push(TransitionRecord {
        from,
        to,
        iteration,
        reason: reason.map(String::from),
        at: now,
    });
    group.status = to;
    group.updated_at = now;
    if to.is_terminal() {
        group.archived_at = Some(now);
    }

    debug!(
        group = %group.id,
        from = %from,
        to = %to,
        iteration,
        reason = reason.unwrap_or(""),
        "Group transition"
    );
    Ok(())
}
