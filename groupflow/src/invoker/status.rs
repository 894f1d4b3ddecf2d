//! Closed status-code sets returned by workers
//!
//! Each role has its own fixed vocabulary. Anything outside it parses to
//! [`StatusCode::Unknown`] and is routed to the next-higher authority by the
//! review state machine; it is never dropped.

use serde::{Deserialize, Serialize};

use super::Role;

/// Implementer outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImplementerStatus {
    ReadyForVerification,
    Blocked,
    Partial,
    Escalate,
}

/// Verifier outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerifierStatus {
    Pass,
    Fail,
    Blocked,
}

/// Reviewer outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewerStatus {
    Approved,
    ChangesRequested,
    Investigate,
}

/// Investigator outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InvestigatorStatus {
    RootCauseFound,
    HypothesisEliminated,
    NeedMoreDiagnostic,
    Blocked,
}

/// Merge step outcomes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeStatus {
    MergeSuccess,
    MergeConflict,
    MergeTestFailure,
    MergeBlocked,
}

/// A status code tagged with the role vocabulary it belongs to
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "code", rename_all = "snake_case")]
pub enum StatusCode {
    Implementer(ImplementerStatus),
    Verifier(VerifierStatus),
    Reviewer(ReviewerStatus),
    Investigator(InvestigatorStatus),
    Merge(MergeStatus),
    /// Raw code outside the role's closed set
    Unknown(String),
}

impl StatusCode {
    /// Parse a wire code in the vocabulary of `role`.
    ///
    /// Matching is case-insensitive and tolerates `-` or spaces in place of
    /// `_`. Codes belonging to a different role's vocabulary are `Unknown`.
    pub fn parse(role: Role, raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                c => c.to_ascii_uppercase(),
            })
            .collect();

        let parsed = match role {
            Role::Implementer => match normalized.as_str() {
                "READY_FOR_VERIFICATION" => {
                    Some(Self::Implementer(ImplementerStatus::ReadyForVerification))
                }
                "BLOCKED" => Some(Self::Implementer(ImplementerStatus::Blocked)),
                "PARTIAL" => Some(Self::Implementer(ImplementerStatus::Partial)),
                "ESCALATE" => Some(Self::Implementer(ImplementerStatus::Escalate)),
                _ => None,
            },
            Role::Verifier => match normalized.as_str() {
                "PASS" => Some(Self::Verifier(VerifierStatus::Pass)),
                "FAIL" => Some(Self::Verifier(VerifierStatus::Fail)),
                "BLOCKED" => Some(Self::Verifier(VerifierStatus::Blocked)),
                _ => None,
            },
            Role::Reviewer => match normalized.as_str() {
                "APPROVED" => Some(Self::Reviewer(ReviewerStatus::Approved)),
                "CHANGES_REQUESTED" => Some(Self::Reviewer(ReviewerStatus::ChangesRequested)),
                "INVESTIGATE" => Some(Self::Reviewer(ReviewerStatus::Investigate)),
                _ => None,
            },
            Role::Investigator => match normalized.as_str() {
                "ROOT_CAUSE_FOUND" => Some(Self::Investigator(InvestigatorStatus::RootCauseFound)),
                "HYPOTHESIS_ELIMINATED" => {
                    Some(Self::Investigator(InvestigatorStatus::HypothesisEliminated))
                }
                "NEED_MORE_DIAGNOSTIC" => {
                    Some(Self::Investigator(InvestigatorStatus::NeedMoreDiagnostic))
                }
                "BLOCKED" => Some(Self::Investigator(InvestigatorStatus::Blocked)),
                _ => None,
            },
            Role::Merger => match normalized.as_str() {
                "MERGE_SUCCESS" => Some(Self::Merge(MergeStatus::MergeSuccess)),
                "MERGE_CONFLICT" => Some(Self::Merge(MergeStatus::MergeConflict)),
                "MERGE_TEST_FAILURE" => Some(Self::Merge(MergeStatus::MergeTestFailure)),
                "MERGE_BLOCKED" => Some(Self::Merge(MergeStatus::MergeBlocked)),
                _ => None,
            },
        };

        parsed.unwrap_or_else(|| Self::Unknown(raw.trim().to_string()))
    }

    /// The role vocabulary this code belongs to (`None` for unknown codes)
    pub fn role(&self) -> Option<Role> {
        match self {
            Self::Implementer(_) => Some(Role::Implementer),
            Self::Verifier(_) => Some(Role::Verifier),
            Self::Reviewer(_) => Some(Role::Reviewer),
            Self::Investigator(_) => Some(Role::Investigator),
            Self::Merge(_) => Some(Role::Merger),
            Self::Unknown(_) => None,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, Self::Unknown(_))
    }
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let code = match self {
            Self::Implementer(s) => match s {
                ImplementerStatus::ReadyForVerification => "READY_FOR_VERIFICATION",
                ImplementerStatus::Blocked => "BLOCKED",
                ImplementerStatus::Partial => "PARTIAL",
                ImplementerStatus::Escalate => "ESCALATE",
            },
            Self::Verifier(s) => match s {
                VerifierStatus::Pass => "PASS",
                VerifierStatus::Fail => "FAIL",
                VerifierStatus::Blocked => "BLOCKED",
            },
            Self::Reviewer(s) => match s {
                ReviewerStatus::Approved => "APPROVED",
                ReviewerStatus::ChangesRequested => "CHANGES_REQUESTED",
                ReviewerStatus::Investigate => "INVESTIGATE",
            },
            Self::Investigator(s) => match s {
                InvestigatorStatus::RootCauseFound => "ROOT_CAUSE_FOUND",
                InvestigatorStatus::HypothesisEliminated => "HYPOTHESIS_ELIMINATED",
                InvestigatorStatus::NeedMoreDiagnostic => "NEED_MORE_DIAGNOSTIC",
                InvestigatorStatus::Blocked => "BLOCKED",
            },
            Self::Merge(s) => match s {
                MergeStatus::MergeSuccess => "MERGE_SUCCESS",
                MergeStatus::MergeConflict => "MERGE_CONFLICT",
                MergeStatus::MergeTestFailure => "MERGE_TEST_FAILURE",
                MergeStatus::MergeBlocked => "MERGE_BLOCKED",
            },
            Self::Unknown(raw) => return write!(f, "UNKNOWN({})", raw),
        };
        f.write_str(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_codes() {
        assert_eq!(
            StatusCode::parse(Role::Implementer, "READY_FOR_VERIFICATION"),
            StatusCode::Implementer(ImplementerStatus::ReadyForVerification)
        );
        assert_eq!(
            StatusCode::parse(Role::Verifier, "pass"),
            StatusCode::Verifier(VerifierStatus::Pass)
        );
        assert_eq!(
            StatusCode::parse(Role::Reviewer, "changes-requested"),
            StatusCode::Reviewer(ReviewerStatus::ChangesRequested)
        );
        assert_eq!(
            StatusCode::parse(Role::Merger, " MERGE_CONFLICT \n"),
            StatusCode::Merge(MergeStatus::MergeConflict)
        );
    }

    #[test]
    fn test_blocked_is_role_scoped() {
        assert_eq!(
            StatusCode::parse(Role::Investigator, "BLOCKED"),
            StatusCode::Investigator(InvestigatorStatus::Blocked)
        );
        // Reviewers have no BLOCKED code.
        assert_eq!(
            StatusCode::parse(Role::Reviewer, "BLOCKED"),
            StatusCode::Unknown("BLOCKED".to_string())
        );
    }

    #[test]
    fn test_cross_role_code_is_unknown() {
        let code = StatusCode::parse(Role::Verifier, "APPROVED");
        assert!(code.is_unknown());
        assert_eq!(code.role(), None);
    }

    #[test]
    fn test_display_matches_wire_code() {
        let code = StatusCode::parse(Role::Investigator, "need more diagnostic");
        assert_eq!(code.to_string(), "NEED_MORE_DIAGNOSTIC");
        assert_eq!(
            StatusCode::Unknown("LGTM".into()).to_string(),
            "UNKNOWN(LGTM)"
        );
    }
}
