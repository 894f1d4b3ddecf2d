//! Advisory side-channel findings (security, lint, coverage)
//!
//! Findings are informational. They are attached to verifier and reviewer
//! work orders and never change the state machine's contract; a failing
//! advisory source is logged and the dispatch proceeds without findings.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::TaskGroup;

/// Which side-channel skill produced a finding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisorySkill {
    Security,
    Lint,
    Coverage,
}

impl std::fmt::Display for AdvisorySkill {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Security => write!(f, "security"),
            Self::Lint => write!(f, "lint"),
            Self::Coverage => write!(f, "coverage"),
        }
    }
}

/// One pass/fail result from an advisory skill
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvisoryFinding {
    pub skill: AdvisorySkill,
    pub passed: bool,
    pub summary: String,
}

impl AdvisoryFinding {
    pub fn pass(skill: AdvisorySkill, summary: impl Into<String>) -> Self {
        Self {
            skill,
            passed: true,
            summary: summary.into(),
        }
    }

    pub fn fail(skill: AdvisorySkill, summary: impl Into<String>) -> Self {
        Self {
            skill,
            passed: false,
            summary: summary.into(),
        }
    }
}

#[derive(Debug, Error)]
#[error("advisory skill {skill} failed: {message}")]
pub struct AdvisoryError {
    pub skill: AdvisorySkill,
    pub message: String,
}

/// Source of advisory findings for a group
#[async_trait]
pub trait AdvisorySource: Send + Sync {
    async fn findings(&self, group: &TaskGroup) -> Result<Vec<AdvisoryFinding>, AdvisoryError>;
}

/// Number of failing findings in a set
pub fn failing(findings: &[AdvisoryFinding]) -> usize {
    findings.iter().filter(|f| !f.passed).count()
}
