//! Core records persisted by the state store
//!
//! Session and TaskGroup carry a `version` used for optimistic concurrency:
//! every write states the version it read and the store rejects it if the
//! record moved on in between. SpawnRecord, MergeAttempt and
//! PlanningEscalation are append-only.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::escalation::Tier;
use crate::invoker::{DispatchIntent, Role, StatusCode};

/// Unique identifier for orchestration sessions
pub type SessionId = String;

/// Unique identifier for task groups within a session
pub type GroupId = String;

/// Global status of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Groups are being scheduled
    Running,
    /// Pending groups can never become ready without external input
    AwaitingClarification,
    /// No non-terminal groups remain
    Complete,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::AwaitingClarification => write!(f, "awaiting_clarification"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// One orchestration run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    /// Wave currently admitted for scheduling
    pub current_wave: u32,
    pub status: SessionStatus,
    /// Total worker dispatches issued in this session
    pub total_dispatches: u64,
    /// Why the session paused, if awaiting clarification
    pub clarification: Option<String>,
    /// Optimistic concurrency version
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// Create a new running session starting at `first_wave`
    pub fn new(first_wave: u32) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            current_wave: first_wave,
            status: SessionStatus::Running,
            total_dispatches: 0,
            clarification: None,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_id(mut self, id: impl Into<SessionId>) -> Self {
        self.id = id.into();
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn is_finished(&self) -> bool {
        self.status == SessionStatus::Complete
    }
}

/// Work category; each has its own admission pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkCategory {
    Implementation,
    Research,
}

impl std::fmt::Display for WorkCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Implementation => write!(f, "implementation"),
            Self::Research => write!(f, "research"),
        }
    }
}

/// Review state of a task group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    /// Not yet admitted by the scheduler
    Pending,
    /// Implementer dispatched
    Dispatched,
    /// Verifier dispatched (or implementer reworking a failed merge)
    AwaitingVerification,
    /// Verifier passed
    Verified,
    /// Reviewer dispatched
    AwaitingReview,
    /// Reviewer approved
    Approved,
    /// Queued for, or undergoing, integration
    MergePending,
    /// Integrated (terminal success)
    Merged,
    /// Surfaced to the planning authority (terminal failure)
    BlockedEscalated,
    /// Bounded investigation loop running
    Investigating,
}

impl GroupStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Merged | Self::BlockedEscalated)
    }

    /// Admitted and not yet terminal; occupies an admission slot
    pub fn is_active(self) -> bool {
        !self.is_terminal() && self != Self::Pending
    }
}

impl std::fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "PENDING"),
            Self::Dispatched => write!(f, "DISPATCHED"),
            Self::AwaitingVerification => write!(f, "AWAITING_VERIFICATION"),
            Self::Verified => write!(f, "VERIFIED"),
            Self::AwaitingReview => write!(f, "AWAITING_REVIEW"),
            Self::Approved => write!(f, "APPROVED"),
            Self::MergePending => write!(f, "MERGE_PENDING"),
            Self::Merged => write!(f, "MERGED"),
            Self::BlockedEscalated => write!(f, "BLOCKED_ESCALATED"),
            Self::Investigating => write!(f, "INVESTIGATING"),
        }
    }
}

/// The single dispatch a group may have outstanding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dispatch {
    /// Per-group dispatch index (1-based)
    pub iteration: u32,
    pub role: Role,
    pub tier: Tier,
    pub intent: DispatchIntent,
    /// Failure context carried to the worker
    pub note: Option<String>,
    pub planned_at: DateTime<Utc>,
}

/// A recorded state transition of one group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: GroupStatus,
    pub to: GroupStatus,
    /// Dispatch iteration whose report caused the transition (0 for admission)
    pub iteration: u32,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// The unit of schedulable work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskGroup {
    pub id: GroupId,
    pub session_id: SessionId,
    pub title: String,
    pub category: WorkCategory,
    /// Groups that must be terminal before this one is admitted
    pub dependencies: BTreeSet<GroupId>,
    /// Current capability tier; never decreases
    pub tier: Tier,
    /// Review revisions; never decreases
    pub revisions: u32,
    pub security_sensitive: bool,
    pub status: GroupStatus,
    /// Branch or other integration handle
    pub integration_handle: Option<String>,
    pub wave: u32,
    /// Dispatch awaiting a report, if any
    pub outstanding: Option<Dispatch>,
    /// Index the next dispatch will carry
    pub next_iteration: u32,
    /// Investigations opened over the group's lifetime
    pub investigations: u32,
    pub history: Vec<TransitionRecord>,
    /// Set when the reviewer approved; orders the merge lane
    pub approved_at: Option<DateTime<Utc>>,
    /// Set on entry to a terminal state
    pub archived_at: Option<DateTime<Utc>>,
    /// Why the group was surfaced to the planning authority
    pub blocked_reason: Option<String>,
    /// Groups created to replace this one after a split
    pub superseded_by: Vec<GroupId>,
    /// Optimistic concurrency version
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskGroup {
    /// Create a pending implementation group in wave 0
    pub fn new(id: impl Into<GroupId>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            session_id: String::new(),
            title: title.into(),
            category: WorkCategory::Implementation,
            dependencies: BTreeSet::new(),
            tier: Tier::Base,
            revisions: 0,
            security_sensitive: false,
            status: GroupStatus::Pending,
            integration_handle: None,
            wave: 0,
            outstanding: None,
            next_iteration: 1,
            investigations: 0,
            history: Vec::new(),
            approved_at: None,
            archived_at: None,
            blocked_reason: None,
            superseded_by: Vec::new(),
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_category(mut self, category: WorkCategory) -> Self {
        self.category = category;
        self
    }

    pub fn research(self) -> Self {
        self.with_category(WorkCategory::Research)
    }

    pub fn with_wave(mut self, wave: u32) -> Self {
        self.wave = wave;
        self
    }

    pub fn depends_on(mut self, dependency: impl Into<GroupId>) -> Self {
        self.dependencies.insert(dependency.into());
        self
    }

    pub fn security_sensitive(mut self) -> Self {
        self.security_sensitive = true;
        self
    }

    pub fn with_integration_handle(mut self, handle: impl Into<String>) -> Self {
        self.integration_handle = Some(handle.into());
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = tier;
        self
    }

    pub fn in_session(mut self, session_id: impl Into<SessionId>) -> Self {
        self.session_id = session_id.into();
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Plan the next dispatch for this group at its current tier.
    ///
    /// Replaces nothing: callers must only plan when no dispatch is
    /// outstanding, which the review state machine guarantees by taking the
    /// outstanding dispatch before applying a report.
    pub fn plan_dispatch(
        &mut self,
        role: Role,
        intent: DispatchIntent,
        note: Option<String>,
    ) -> Dispatch {
        debug_assert!(self.outstanding.is_none(), "group {} already has a dispatch", self.id);
        let dispatch = Dispatch {
            iteration: self.next_iteration,
            role,
            tier: self.tier,
            intent,
            note,
            planned_at: Utc::now(),
        };
        self.next_iteration += 1;
        self.outstanding = Some(dispatch.clone());
        dispatch
    }

    /// Raise the tier to at least `tier`. Returns the change, if any.
    pub fn raise_tier(&mut self, tier: Tier) -> Option<(Tier, Tier)> {
        if tier > self.tier {
            let from = self.tier;
            self.tier = tier;
            Some((from, tier))
        } else {
            None
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// One worker invocation and the status it returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpawnRecord {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub role: Role,
    pub tier: Tier,
    pub intent: DispatchIntent,
    pub iteration: u32,
    pub status: StatusCode,
    pub recorded_at: DateTime<Utc>,
}

impl SpawnRecord {
    pub fn new(group: &TaskGroup, dispatch: &Dispatch, status: StatusCode) -> Self {
        Self {
            session_id: group.session_id.clone(),
            group_id: group.id.clone(),
            role: dispatch.role,
            tier: dispatch.tier,
            intent: dispatch.intent,
            iteration: dispatch.iteration,
            status,
            recorded_at: Utc::now(),
        }
    }
}

/// Where an investigation was triggered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOrigin {
    Implementer,
    Verifier,
    Reviewer,
}

/// State of one hypothesis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypothesisStatus {
    Open,
    Eliminated,
    Confirmed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hypothesis {
    pub statement: String,
    pub status: HypothesisStatus,
    /// Iteration that resolved it
    pub resolved_at_iteration: Option<u32>,
}

impl Hypothesis {
    pub fn open(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            status: HypothesisStatus::Open,
            resolved_at_iteration: None,
        }
    }
}

/// Terminal outcome of an investigation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestigationOutcome {
    RootCauseFound,
    Blocked,
    Exhausted,
}

impl std::fmt::Display for InvestigationOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RootCauseFound => write!(f, "root_cause_found"),
            Self::Blocked => write!(f, "blocked"),
            Self::Exhausted => write!(f, "exhausted"),
        }
    }
}

/// Investigation attached to a group while a blocking defect is diagnosed
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationState {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub problem_summary: String,
    pub origin: InvestigationOrigin,
    pub hypotheses: Vec<Hypothesis>,
    pub evidence: Vec<String>,
    /// Investigator iterations consumed since the last (re)start
    pub iteration: u32,
    /// Times the iteration count was reset with a new strategy
    pub restarts: u32,
    pub outcome: Option<InvestigationOutcome>,
    pub root_cause: Option<String>,
    pub opened_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl InvestigationState {
    pub fn is_open(&self) -> bool {
        self.outcome.is_none()
    }

    pub fn open_hypotheses(&self) -> Vec<String> {
        self.hypotheses
            .iter()
            .filter(|h| h.status == HypothesisStatus::Open)
            .map(|h| h.statement.clone())
            .collect()
    }
}

/// Outcome of one merge attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeOutcome {
    Success,
    Conflict,
    TestFailure,
    Blocked,
    Unknown,
}

impl MergeOutcome {
    pub fn is_failure(self) -> bool {
        self != Self::Success
    }
}

impl std::fmt::Display for MergeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success => write!(f, "success"),
            Self::Conflict => write!(f, "conflict"),
            Self::TestFailure => write!(f, "test_failure"),
            Self::Blocked => write!(f, "blocked"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeAttempt {
    pub session_id: SessionId,
    pub group_id: GroupId,
    /// 1-based attempt number
    pub attempt: u32,
    pub outcome: MergeOutcome,
    pub tier: Tier,
    pub detail: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

/// What pushed a group to the planning authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanningTrigger {
    RevisionsExhausted,
    MergeRetriesExhausted,
    InvestigationBlocked,
    InvestigationUnresolved,
    InvestigationLimit,
    UnclassifiedReviewerStatus,
    WorkerEscalation,
}

impl std::fmt::Display for PlanningTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RevisionsExhausted => write!(f, "revisions_exhausted"),
            Self::MergeRetriesExhausted => write!(f, "merge_retries_exhausted"),
            Self::InvestigationBlocked => write!(f, "investigation_blocked"),
            Self::InvestigationUnresolved => write!(f, "investigation_unresolved"),
            Self::InvestigationLimit => write!(f, "investigation_limit"),
            Self::UnclassifiedReviewerStatus => write!(f, "unclassified_reviewer_status"),
            Self::WorkerEscalation => write!(f, "worker_escalation"),
        }
    }
}

/// A group surfaced to the planning authority
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningEscalation {
    pub session_id: SessionId,
    pub group_id: GroupId,
    pub trigger: PlanningTrigger,
    pub reason: String,
    /// Tier the group had reached before leaving the loop
    pub last_tier: Tier,
    pub revisions: u32,
    pub raised_at: DateTime<Utc>,
}
