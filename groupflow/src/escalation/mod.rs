//! Escalation ladder: deterministic tier routing for failed task groups
//!
//! The ladder is a pure function of a group's failure history. It never reads
//! the store and never dispatches; the review state machine evaluates it every
//! time a group is about to be re-dispatched after a failure.
//!
//! # Escalation Ladder
//!
//! ```text
//! Review failures (verifier FAIL, reviewer CHANGES_REQUESTED, implementer PARTIAL)
//!
//!   revisions at failure   normal group        security-sensitive group
//!   ────────────────────   ────────────        ────────────────────────
//!   0                      same tier           senior
//!   1                      senior              lead
//!   2                      lead (if senior)    lead
//!   3+                     planning authority  planning authority
//!
//! Merge failures (conflict, test failure, blocked, unknown)
//!
//!   1st → same tier   2nd → senior   3rd → lead   4th+ → planning authority
//! ```
//!
//! The target tier is always `max(current, proposed)`: a group never drops
//! back down the ladder once escalated.

pub mod ladder;
pub mod tier;

pub use ladder::{escalate, EscalationDecision, FailureContext, FailureKind};
pub use tier::Tier;
