//! Worker invoker: the seam between the control logic and the workers
//!
//! The core never knows what a worker does. It hands a [`WorkOrder`] to a
//! [`WorkerInvoker`] and waits for exactly one [`StatusReport`] back.

pub mod command;
pub mod status;

pub use command::{parse_report, CommandInvoker};
pub use status::{
    ImplementerStatus, InvestigatorStatus, MergeStatus, ReviewerStatus, StatusCode,
    VerifierStatus,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::advisory::AdvisoryFinding;
use crate::escalation::Tier;
use crate::state::{GroupId, SessionId, WorkCategory};

/// Worker roles the core can dispatch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Implementer,
    Verifier,
    Reviewer,
    Investigator,
    /// The integration (merge) step
    Merger,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Implementer => write!(f, "implementer"),
            Self::Verifier => write!(f, "verifier"),
            Self::Reviewer => write!(f, "reviewer"),
            Self::Investigator => write!(f, "investigator"),
            Self::Merger => write!(f, "merger"),
        }
    }
}

/// Why a dispatch was issued. Workers use it to shape their output; the
/// review state machine uses it to interpret the reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchIntent {
    /// First implementation attempt
    Implement,
    /// Re-implementation after a rejected verification or review
    Revise,
    /// Lead-tier architectural guidance instead of re-implementation
    Guidance,
    /// Add instrumentation only, on behalf of an investigation
    Instrument,
    /// Fix a root cause an investigation confirmed
    ValidatedFix,
    /// Rework after a merge conflict or post-merge test failure
    MergeRecovery,
    /// Verify the current change set
    Verify,
    /// Standard review
    Review,
    /// Decide on an exhausted investigation's partial findings
    AssessPartialFindings,
    /// Assess whether the integration target itself is broken
    AssessIntegration,
    /// Classify a status code outside a worker's closed set
    ClassifyStatus,
    /// One investigation iteration
    Investigate,
    /// Integrate the approved change set
    Merge,
}

/// Kind of defect a reviewer reports with CHANGES_REQUESTED
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DefectKind {
    /// The change itself is wrong
    Implementation,
    /// The design needs rework
    Design,
    /// The change is fine but verification was insufficient
    Verification,
}

/// Context handed to a worker with its order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DispatchContext {
    /// Failure context from the previous attempt, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_context: Option<String>,
    /// Review revisions so far
    pub revisions: u32,
    /// Open hypotheses (investigations only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<String>,
    /// Evidence gathered so far (investigations only)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub evidence: Vec<String>,
    /// Advisory findings from side-channel skills
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub advisories: Vec<AdvisoryFinding>,
    /// Branch or other integration handle
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integration_handle: Option<String>,
}

/// A unit of work handed to a worker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkOrder {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub title: String,
    pub category: WorkCategory,
    pub role: Role,
    pub tier: Tier,
    /// Per-group dispatch index; echoes the SpawnRecord iteration
    pub iteration: u32,
    pub intent: DispatchIntent,
    pub context: DispatchContext,
}

/// Optional payload a worker returns alongside its status code
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ReportPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files_touched: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub findings: Vec<String>,
    /// Reviewer's classification of the requested change
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub defect_kind: Option<DefectKind>,
    /// New hypotheses proposed by the worker
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hypotheses: Vec<String>,
    /// Hypotheses the investigator struck this iteration
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub eliminated: Vec<String>,
    /// Root cause statement (with ROOT_CAUSE_FOUND)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_cause: Option<String>,
}

/// A worker's reply to one dispatch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub role: Role,
    pub code: StatusCode,
    #[serde(default)]
    pub payload: ReportPayload,
}

impl StatusReport {
    /// Build a report from a raw wire code
    pub fn parse(role: Role, raw: &str) -> Self {
        Self {
            role,
            code: StatusCode::parse(role, raw),
            payload: ReportPayload::default(),
        }
    }

    pub fn new(role: Role, code: StatusCode) -> Self {
        Self {
            role,
            code,
            payload: ReportPayload::default(),
        }
    }

    pub fn with_payload(mut self, payload: ReportPayload) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.payload.summary = Some(summary.into());
        self
    }
}

/// Errors from the invoker collaborator
#[derive(Debug, Error)]
pub enum InvokeError {
    #[error("worker pool unavailable: {0}")]
    Unavailable(String),

    #[error("failed to start worker process: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("worker exited with status {code:?}: {stderr}")]
    WorkerFailed { code: Option<i32>, stderr: String },

    #[error("malformed status report: {0}")]
    MalformedReport(String),

    #[error("worker panicked while handling group {0}")]
    Panicked(GroupId),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Dispatch a unit of work and await its status report.
///
/// Implementations must return exactly one report per order. A hung
/// invocation is the implementation's fault; the core applies no timeout.
#[async_trait]
pub trait WorkerInvoker: Send + Sync {
    async fn dispatch(&self, order: WorkOrder) -> Result<StatusReport, InvokeError>;
}
