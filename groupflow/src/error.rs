//! Coordination error types
//!
//! One umbrella error for the orchestrator, wrapping the per-layer errors.
//! Infrastructure failures are retryable on a later tick; everything else
//! points at a programming or planning error.

use thiserror::Error;

use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::invoker::InvokeError;
use crate::review::{IllegalTransition, ReviewError};
use crate::state::{GroupId, GroupStatus, SessionId, StoreError};

/// Result type alias for coordination operations
pub type CoordinationResult<T> = Result<T, CoordinationError>;

/// Errors that can occur while coordinating a session
#[derive(Error, Debug)]
pub enum CoordinationError {
    #[error("State store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker invocation error: {0}")]
    Invoke(#[from] InvokeError),

    #[error("Review error: {0}")]
    Review(#[from] ReviewError),

    #[error("{0}")]
    Transition(#[from] IllegalTransition),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dependency graph error: {0}")]
    Graph(#[from] GraphError),

    #[error("Session not found: {session_id}")]
    SessionNotFound { session_id: SessionId },

    #[error("Group not found: {group_id}")]
    GroupNotFound { group_id: GroupId },

    #[error("Group {group_id} is {status}, expected {expected}")]
    UnexpectedGroupState {
        group_id: GroupId,
        status: GroupStatus,
        expected: &'static str,
    },

    #[error("Infrastructure unavailable for {failures} consecutive ticks: {last}")]
    InfrastructureExhausted { failures: u32, last: String },
}

impl CoordinationError {
    /// Create a session not found error
    pub fn session_not_found(session_id: impl Into<SessionId>) -> Self {
        Self::SessionNotFound {
            session_id: session_id.into(),
        }
    }

    /// Create a group not found error
    pub fn group_not_found(group_id: impl Into<GroupId>) -> Self {
        Self::GroupNotFound {
            group_id: group_id.into(),
        }
    }

    /// Create an unexpected group state error
    pub fn unexpected_state(
        group_id: impl Into<GroupId>,
        status: GroupStatus,
        expected: &'static str,
    ) -> Self {
        Self::UnexpectedGroupState {
            group_id: group_id.into(),
            status,
            expected,
        }
    }

    /// Check if this error is retryable (transient failure)
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            // A worker that failed to answer is re-dispatched next tick
            Self::Invoke(_) => true,
            _ => false,
        }
    }

    /// Get recovery suggestion for this error
    pub fn recovery_suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Store(StoreError::Conflict { .. }) => {
                Some("Another tick updated the record first. It is retried on the next tick.")
            }
            Self::Store(StoreError::Unavailable(_)) => {
                Some("Admission fails closed until the store is reachable again.")
            }
            Self::Graph(_) => Some("Fix the group dependencies before opening the session."),
            Self::UnexpectedGroupState { .. } => {
                Some("Only groups in BLOCKED_ESCALATED can be split or re-scoped.")
            }
            Self::InfrastructureExhausted { .. } => {
                Some("Restore the store or worker pool, then resume the session.")
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let conflict = CoordinationError::from(StoreError::Conflict {
            key: "group:s:g".into(),
            expected: 1,
            actual: 2,
        });
        assert!(conflict.is_retryable());
        assert!(conflict.recovery_suggestion().is_some());

        let missing = CoordinationError::from(StoreError::NotFound("group:s:g".into()));
        assert!(!missing.is_retryable());

        let invoke = CoordinationError::from(InvokeError::Unavailable("pool drained".into()));
        assert!(invoke.is_retryable());

        assert!(!CoordinationError::session_not_found("s1").is_retryable());
    }

    #[test]
    fn test_unexpected_state_message() {
        let err =
            CoordinationError::unexpected_state("g1", GroupStatus::Merged, "BLOCKED_ESCALATED");
        assert_eq!(err.to_string(), "Group g1 is MERGED, expected BLOCKED_ESCALATED");
    }
}
