//! Review state machine for task groups
//!
//! Transitions are driven only by worker status reports:
//!
//! ```text
//! PENDING → DISPATCHED → AWAITING_VERIFICATION → VERIFIED → AWAITING_REVIEW
//!         → APPROVED → MERGE_PENDING → MERGED
//!
//! verifier FAIL / reviewer CHANGES_REQUESTED → ladder, revision + 1, re-dispatch
//! verifier BLOCKED / reviewer INVESTIGATE    → INVESTIGATING
//! ladder exhausted                           → BLOCKED_ESCALATED
//! ```
//!
//! This is the only place the escalation ladder is evaluated for review
//! failures.

pub mod machine;
pub mod routing;
pub mod transitions;

pub use machine::{Applied, GroupContext, ReviewError, ReviewMachine};
pub use routing::{ChangeRouter, ChangeRouting};
pub use transitions::{advance, is_legal_transition, IllegalTransition};
