//! Per-group review state machine
//!
//! [`ReviewMachine::apply`] consumes one status report for a group's
//! outstanding dispatch and produces the group's next state, at most one new
//! dispatch, and the side records to persist with it. It performs no I/O.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use super::routing::{ChangeRouter, ChangeRouting};
use super::transitions::{advance, IllegalTransition};
use crate::config::OrchestratorConfig;
use crate::escalation::{escalate, FailureContext, Tier};
use crate::investigation::{InvestigationController, InvestigationStep};
use crate::invoker::{
    DispatchIntent, ImplementerStatus, ReviewerStatus, Role, StatusCode, StatusReport,
    VerifierStatus,
};
use crate::merge::{MergeAction, MergeRetryWorkflow};
use crate::state::{
    Dispatch, GroupCommit, GroupId, GroupStatus, InvestigationOrigin, InvestigationOutcome,
    InvestigationState, MergeAttempt, PlanningEscalation, PlanningTrigger, SpawnRecord, TaskGroup,
};

/// Errors from applying a report
#[derive(Debug, Error)]
pub enum ReviewError {
    #[error(transparent)]
    Transition(#[from] IllegalTransition),

    #[error("group {0} has no outstanding dispatch")]
    NoOutstandingDispatch(GroupId),

    #[error("group {group_id}: {actual} report does not answer the {expected} dispatch")]
    RoleMismatch {
        group_id: GroupId,
        expected: Role,
        actual: Role,
    },

    #[error("group {0} has no investigation state")]
    MissingInvestigation(GroupId),
}

/// Everything the machine reads about one group
#[derive(Debug, Clone, PartialEq)]
pub struct GroupContext {
    pub group: TaskGroup,
    pub investigation: Option<InvestigationState>,
    /// Prior merge attempts in attempt order
    pub merge_history: Vec<MergeAttempt>,
}

impl GroupContext {
    pub fn new(group: TaskGroup) -> Self {
        Self {
            group,
            investigation: None,
            merge_history: Vec::new(),
        }
    }
}

/// Result of applying one report
#[derive(Debug, Clone, PartialEq)]
pub struct Applied {
    pub spawn_record: SpawnRecord,
    /// The dispatch the group now has outstanding, if any
    pub next_dispatch: Option<Dispatch>,
    /// Tier before and after, if the tier rose
    pub tier_change: Option<(Tier, Tier)>,
    pub merge_attempt: Option<MergeAttempt>,
    pub escalation: Option<PlanningEscalation>,
    pub investigation_closed: Option<InvestigationOutcome>,
    investigation_changed: bool,
}

impl Applied {
    fn new(spawn_record: SpawnRecord) -> Self {
        Self {
            spawn_record,
            next_dispatch: None,
            tier_change: None,
            merge_attempt: None,
            escalation: None,
            investigation_closed: None,
            investigation_changed: false,
        }
    }

    /// The atomic write persisting this result
    pub fn commit(&self, ctx: &GroupContext) -> GroupCommit {
        let investigation = if self.investigation_changed {
            ctx.investigation.clone()
        } else {
            None
        };
        GroupCommit::new(ctx.group.clone())
            .with_spawn_record(self.spawn_record.clone())
            .with_investigation(investigation)
            .with_merge_attempt(self.merge_attempt.clone())
            .with_escalation(self.escalation.clone())
    }
}

/// Typed transition logic for task groups
pub struct ReviewMachine {
    investigation: InvestigationController,
    merge: MergeRetryWorkflow,
    router: Arc<dyn ChangeRouter>,
}

impl ReviewMachine {
    pub fn new(config: &OrchestratorConfig) -> Self {
        Self {
            investigation: InvestigationController::new(config.investigation),
            merge: MergeRetryWorkflow::new(),
            router: Arc::new(config.change_routing),
        }
    }

    /// Replace the change-request classification
    pub fn with_router(mut self, router: Arc<dyn ChangeRouter>) -> Self {
        self.router = router;
        self
    }

    pub fn merge_workflow(&self) -> &MergeRetryWorkflow {
        &self.merge
    }

    /// Move an admitted group to DISPATCHED with its first implementer order
    pub fn admit(&self, group: &mut TaskGroup) -> Result<Dispatch, IllegalTransition> {
        advance(group, GroupStatus::Dispatched, 0, Some("admitted"))?;
        Ok(group.plan_dispatch(Role::Implementer, DispatchIntent::Implement, None))
    }

    /// Apply `report` to the group's outstanding dispatch.
    ///
    /// On error `ctx` may be partially modified and must be discarded.
    pub fn apply(
        &self,
        ctx: &mut GroupContext,
        report: &StatusReport,
    ) -> Result<Applied, ReviewError> {
        let dispatch = ctx
            .group
            .outstanding
            .take()
            .ok_or_else(|| ReviewError::NoOutstandingDispatch(ctx.group.id.clone()))?;
        if report.role != dispatch.role {
            return Err(ReviewError::RoleMismatch {
                group_id: ctx.group.id.clone(),
                expected: dispatch.role,
                actual: report.role,
            });
        }

        let record = SpawnRecord::new(&ctx.group, &dispatch, report.code.clone());
        let mut applied = Applied::new(record);
        match dispatch.role {
            Role::Implementer => self.on_implementer(ctx, &dispatch, report, &mut applied)?,
            Role::Verifier => self.on_verifier(ctx, &dispatch, report, &mut applied)?,
            Role::Reviewer => self.on_reviewer(ctx, &dispatch, report, &mut applied)?,
            Role::Investigator => self.on_investigator(ctx, &dispatch, report, &mut applied)?,
            Role::Merger => self.on_merger(ctx, &dispatch, report, &mut applied)?,
        }
        ctx.group.touch();
        Ok(applied)
    }

    // =========================================================================
    // Per-role handlers
    // =========================================================================

    fn on_implementer(
        &self,
        ctx: &mut GroupContext,
        dispatch: &Dispatch,
        report: &StatusReport,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let iteration = dispatch.iteration;
        if dispatch.intent == DispatchIntent::Instrument {
            let step = {
                let inv = investigation_mut(ctx)?;
                self.investigation.on_instrumentation(inv, report)
            };
            applied.investigation_changed = true;
            return self.after_investigation_step(ctx, step, iteration, applied);
        }

        match &report.code {
            StatusCode::Implementer(ImplementerStatus::ReadyForVerification) => {
                advance(
                    &mut ctx.group,
                    GroupStatus::AwaitingVerification,
                    iteration,
                    Some("ready for verification"),
                )?;
                plan(ctx, Role::Verifier, DispatchIntent::Verify, None, applied);
            }
            StatusCode::Implementer(ImplementerStatus::Blocked) => {
                self.open_investigation(
                    ctx,
                    InvestigationOrigin::Implementer,
                    report,
                    iteration,
                    applied,
                )?;
            }
            StatusCode::Implementer(ImplementerStatus::Partial) => {
                let reason = with_summary("implementer delivered a partial change", report);
                self.review_failure(ctx, Role::Implementer, reason, iteration, applied)?;
            }
            StatusCode::Implementer(ImplementerStatus::Escalate) => {
                let decision = escalate(&FailureContext::requested(ctx.group.tier));
                if decision.to_planning_authority() {
                    return self.block(
                        ctx,
                        PlanningTrigger::WorkerEscalation,
                        with_summary(&decision.reason, report),
                        iteration,
                        applied,
                    );
                }
                raise(ctx, decision.target, applied);
                advance(
                    &mut ctx.group,
                    GroupStatus::Dispatched,
                    iteration,
                    Some(decision.reason.as_str()),
                )?;
                plan(
                    ctx,
                    Role::Implementer,
                    DispatchIntent::Revise,
                    Some(decision.reason),
                    applied,
                );
            }
            other => self.classify(ctx, Role::Implementer, other, iteration, applied)?,
        }
        Ok(())
    }

    fn on_verifier(
        &self,
        ctx: &mut GroupContext,
        dispatch: &Dispatch,
        report: &StatusReport,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let iteration = dispatch.iteration;
        match &report.code {
            StatusCode::Verifier(VerifierStatus::Pass) => {
                advance(
                    &mut ctx.group,
                    GroupStatus::Verified,
                    iteration,
                    Some("verification passed"),
                )?;
                advance(&mut ctx.group, GroupStatus::AwaitingReview, iteration, None)?;
                plan(ctx, Role::Reviewer, DispatchIntent::Review, None, applied);
            }
            StatusCode::Verifier(VerifierStatus::Fail) => {
                let reason = with_summary("verification failed", report);
                self.review_failure(ctx, Role::Implementer, reason, iteration, applied)?;
            }
            StatusCode::Verifier(VerifierStatus::Blocked) => {
                self.open_investigation(
                    ctx,
                    InvestigationOrigin::Verifier,
                    report,
                    iteration,
                    applied,
                )?;
            }
            other => self.classify(ctx, Role::Verifier, other, iteration, applied)?,
        }
        Ok(())
    }

    fn on_reviewer(
        &self,
        ctx: &mut GroupContext,
        dispatch: &Dispatch,
        report: &StatusReport,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let iteration = dispatch.iteration;
        if dispatch.intent == DispatchIntent::AssessPartialFindings {
            return self.on_partial_findings(ctx, report, iteration, applied);
        }

        match &report.code {
            StatusCode::Reviewer(ReviewerStatus::Approved) => {
                advance(
                    &mut ctx.group,
                    GroupStatus::Approved,
                    iteration,
                    Some("approved"),
                )?;
                ctx.group.approved_at = Some(Utc::now());
                // Waits in MERGE_PENDING for the integration lane.
                advance(&mut ctx.group, GroupStatus::MergePending, iteration, None)?;
            }
            StatusCode::Reviewer(ReviewerStatus::ChangesRequested) => {
                let route = self.router.route(&ctx.group, &report.payload);
                let reason = with_summary("changes requested", report);
                self.review_failure(ctx, route, reason, iteration, applied)?;
            }
            StatusCode::Reviewer(ReviewerStatus::Investigate) => {
                self.open_investigation(
                    ctx,
                    InvestigationOrigin::Reviewer,
                    report,
                    iteration,
                    applied,
                )?;
            }
            other => {
                // Nobody below the planning authority can classify a reviewer.
                let reason = format!("reviewer returned unrecognised status {}", other);
                self.block(
                    ctx,
                    PlanningTrigger::UnclassifiedReviewerStatus,
                    reason,
                    iteration,
                    applied,
                )?;
            }
        }
        Ok(())
    }

    fn on_partial_findings(
        &self,
        ctx: &mut GroupContext,
        report: &StatusReport,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        match &report.code {
            StatusCode::Reviewer(ReviewerStatus::Approved) => {
                let findings = investigation_mut(ctx)?.evidence.join("; ");
                advance(
                    &mut ctx.group,
                    GroupStatus::Dispatched,
                    iteration,
                    Some("partial findings accepted"),
                )?;
                let note = format!("apply the accepted partial fix: {}", findings);
                plan(
                    ctx,
                    Role::Implementer,
                    DispatchIntent::ValidatedFix,
                    Some(note),
                    applied,
                );
            }
            StatusCode::Reviewer(ReviewerStatus::Investigate) => {
                let restarted = {
                    let inv = investigation_mut(ctx)?;
                    self.investigation.restart(inv, &report.payload.hypotheses)
                };
                if !restarted {
                    return self.block(
                        ctx,
                        PlanningTrigger::InvestigationUnresolved,
                        "investigation exhausted after its restart".to_string(),
                        iteration,
                        applied,
                    );
                }
                applied.investigation_changed = true;
                advance(
                    &mut ctx.group,
                    GroupStatus::Investigating,
                    iteration,
                    Some("investigation restarted"),
                )?;
                plan(
                    ctx,
                    Role::Investigator,
                    DispatchIntent::Investigate,
                    None,
                    applied,
                );
            }
            other => {
                let reason = format!("reviewer declined partial findings ({})", other);
                self.block(
                    ctx,
                    PlanningTrigger::InvestigationUnresolved,
                    reason,
                    iteration,
                    applied,
                )?;
            }
        }
        Ok(())
    }

    fn on_investigator(
        &self,
        ctx: &mut GroupContext,
        dispatch: &Dispatch,
        report: &StatusReport,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let step = {
            let inv = investigation_mut(ctx)?;
            self.investigation.on_report(inv, report)
        };
        applied.investigation_changed = true;
        self.after_investigation_step(ctx, step, dispatch.iteration, applied)
    }

    fn on_merger(
        &self,
        ctx: &mut GroupContext,
        dispatch: &Dispatch,
        report: &StatusReport,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let iteration = dispatch.iteration;
        let decision = self.merge.record_attempt(
            &ctx.group,
            &ctx.merge_history,
            &report.code,
            report.payload.summary.clone(),
        );
        let attempt = decision.attempt.clone();
        ctx.merge_history.push(attempt.clone());
        applied.merge_attempt = Some(attempt.clone());

        let note = match &attempt.detail {
            Some(detail) => format!(
                "merge attempt {} failed ({}): {}",
                attempt.attempt, attempt.outcome, detail
            ),
            None => format!("merge attempt {} failed ({})", attempt.attempt, attempt.outcome),
        };

        match decision.action {
            MergeAction::Merged => {
                advance(
                    &mut ctx.group,
                    GroupStatus::Merged,
                    iteration,
                    Some("merged"),
                )?;
            }
            MergeAction::ReturnToImplementer { tier } => {
                raise(ctx, tier, applied);
                advance(
                    &mut ctx.group,
                    GroupStatus::AwaitingVerification,
                    iteration,
                    Some(note.as_str()),
                )?;
                plan(
                    ctx,
                    Role::Implementer,
                    DispatchIntent::MergeRecovery,
                    Some(note),
                    applied,
                );
            }
            MergeAction::AssessIntegration { tier } => {
                raise(ctx, tier, applied);
                advance(
                    &mut ctx.group,
                    GroupStatus::AwaitingReview,
                    iteration,
                    Some(note.as_str()),
                )?;
                plan(
                    ctx,
                    Role::Reviewer,
                    DispatchIntent::AssessIntegration,
                    Some(note),
                    applied,
                );
            }
            MergeAction::EscalateToPlanning => {
                let reason = decision
                    .escalation
                    .map(|d| d.reason)
                    .unwrap_or_else(|| note.clone());
                self.block(
                    ctx,
                    PlanningTrigger::MergeRetriesExhausted,
                    reason,
                    iteration,
                    applied,
                )?;
            }
        }
        Ok(())
    }

    // =========================================================================
    // Shared paths
    // =========================================================================

    /// A verification or review failure: evaluate the ladder, count the
    /// revision, and re-dispatch `route` or surface to planning.
    fn review_failure(
        &self,
        ctx: &mut GroupContext,
        route: Role,
        reason: String,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let decision = escalate(&FailureContext::review(
            ctx.group.tier,
            ctx.group.revisions,
            ctx.group.security_sensitive,
        ));
        ctx.group.revisions += 1;

        if decision.to_planning_authority() {
            let reason = format!("{}; {}", reason, decision.reason);
            return self.block(
                ctx,
                PlanningTrigger::RevisionsExhausted,
                reason,
                iteration,
                applied,
            );
        }

        raise(ctx, decision.target, applied);
        let note = format!("{}; {}", reason, decision.reason);
        match route {
            Role::Verifier => {
                advance(
                    &mut ctx.group,
                    GroupStatus::AwaitingVerification,
                    iteration,
                    Some(reason.as_str()),
                )?;
                plan(
                    ctx,
                    Role::Verifier,
                    DispatchIntent::Verify,
                    Some(note),
                    applied,
                );
            }
            _ => {
                advance(
                    &mut ctx.group,
                    GroupStatus::Dispatched,
                    iteration,
                    Some(reason.as_str()),
                )?;
                let intent = if ctx.group.tier == Tier::Lead {
                    DispatchIntent::Guidance
                } else {
                    DispatchIntent::Revise
                };
                plan(ctx, Role::Implementer, intent, Some(note), applied);
            }
        }
        Ok(())
    }

    fn open_investigation(
        &self,
        ctx: &mut GroupContext,
        origin: InvestigationOrigin,
        report: &StatusReport,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        if !self.investigation.can_open(&ctx.group) {
            let reason = format!(
                "blocking defect after {} investigations",
                ctx.group.investigations
            );
            return self.block(
                ctx,
                PlanningTrigger::InvestigationLimit,
                reason,
                iteration,
                applied,
            );
        }

        let summary = report
            .payload
            .summary
            .clone()
            .unwrap_or_else(|| format!("{} reported {}", report.role, report.code));
        advance(
            &mut ctx.group,
            GroupStatus::Investigating,
            iteration,
            Some(summary.as_str()),
        )?;
        ctx.group.investigations += 1;
        ctx.investigation = Some(self.investigation.open(
            &ctx.group,
            origin,
            summary.clone(),
            &report.payload.hypotheses,
        ));
        applied.investigation_changed = true;
        plan(
            ctx,
            Role::Investigator,
            DispatchIntent::Investigate,
            Some(summary),
            applied,
        );
        Ok(())
    }

    fn after_investigation_step(
        &self,
        ctx: &mut GroupContext,
        step: InvestigationStep,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        match step {
            InvestigationStep::Continue => {
                advance(&mut ctx.group, GroupStatus::Investigating, iteration, None)?;
                plan(
                    ctx,
                    Role::Investigator,
                    DispatchIntent::Investigate,
                    None,
                    applied,
                );
            }
            InvestigationStep::Instrument { request } => {
                advance(
                    &mut ctx.group,
                    GroupStatus::Investigating,
                    iteration,
                    Some("instrumentation requested"),
                )?;
                plan(
                    ctx,
                    Role::Implementer,
                    DispatchIntent::Instrument,
                    Some(request),
                    applied,
                );
            }
            InvestigationStep::RootCause { statement } => {
                applied.investigation_closed = Some(InvestigationOutcome::RootCauseFound);
                advance(
                    &mut ctx.group,
                    GroupStatus::Dispatched,
                    iteration,
                    Some("root cause found"),
                )?;
                plan(
                    ctx,
                    Role::Implementer,
                    DispatchIntent::ValidatedFix,
                    Some(statement),
                    applied,
                );
            }
            InvestigationStep::Blocked { reason } => {
                applied.investigation_closed = Some(InvestigationOutcome::Blocked);
                self.block(
                    ctx,
                    PlanningTrigger::InvestigationBlocked,
                    reason,
                    iteration,
                    applied,
                )?;
            }
            InvestigationStep::Exhausted => {
                applied.investigation_closed = Some(InvestigationOutcome::Exhausted);
                let findings = investigation_mut(ctx)?.evidence.join("; ");
                advance(
                    &mut ctx.group,
                    GroupStatus::AwaitingReview,
                    iteration,
                    Some("investigation exhausted"),
                )?;
                plan(
                    ctx,
                    Role::Reviewer,
                    DispatchIntent::AssessPartialFindings,
                    Some(findings),
                    applied,
                );
            }
        }
        Ok(())
    }

    /// Send a status outside a worker's vocabulary to the reviewer
    fn classify(
        &self,
        ctx: &mut GroupContext,
        role: Role,
        code: &StatusCode,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let note = format!("{} returned unrecognised status {}", role, code);
        warn!(
            group = %ctx.group.id,
            role = %role,
            code = %code,
            "Routing unrecognised status to reviewer"
        );
        advance(
            &mut ctx.group,
            GroupStatus::AwaitingReview,
            iteration,
            Some(note.as_str()),
        )?;
        plan(
            ctx,
            Role::Reviewer,
            DispatchIntent::ClassifyStatus,
            Some(note),
            applied,
        );
        Ok(())
    }

    /// Surface the group to the planning authority
    fn block(
        &self,
        ctx: &mut GroupContext,
        trigger: PlanningTrigger,
        reason: String,
        iteration: u32,
        applied: &mut Applied,
    ) -> Result<(), ReviewError> {
        let last_tier = ctx.group.tier;
        advance(
            &mut ctx.group,
            GroupStatus::BlockedEscalated,
            iteration,
            Some(reason.as_str()),
        )?;
        raise(ctx, Tier::PlanningAuthority, applied);
        ctx.group.blocked_reason = Some(reason.clone());

        if let Some(inv) = ctx.investigation.as_mut().filter(|i| i.is_open()) {
            self.investigation.close(inv, InvestigationOutcome::Blocked);
            applied.investigation_changed = true;
            applied.investigation_closed = Some(InvestigationOutcome::Blocked);
        }

        info!(
            group = %ctx.group.id,
            trigger = %trigger,
            last_tier = %last_tier,
            revisions = ctx.group.revisions,
            reason = %reason,
            "Group escalated to planning authority"
        );
        applied.escalation = Some(PlanningEscalation {
            session_id: ctx.group.session_id.clone(),
            group_id: ctx.group.id.clone(),
            trigger,
            reason,
            last_tier,
            revisions: ctx.group.revisions,
            raised_at: Utc::now(),
        });
        Ok(())
    }
}

fn investigation_mut(ctx: &mut GroupContext) -> Result<&mut InvestigationState, ReviewError> {
    let id = &ctx.group.id;
    ctx.investigation
        .as_mut()
        .ok_or_else(|| ReviewError::MissingInvestigation(id.clone()))
}

fn plan(
    ctx: &mut GroupContext,
    role: Role,
    intent: DispatchIntent,
    note: Option<String>,
    applied: &mut Applied,
) {
    applied.next_dispatch = Some(ctx.group.plan_dispatch(role, intent, note));
}

fn raise(ctx: &mut GroupContext, tier: Tier, applied: &mut Applied) {
    if let Some((from, to)) = ctx.group.raise_tier(tier) {
        info!(group = %ctx.group.id, from = %from, to = %to, "Tier escalated");
        applied.tier_change = Some(match applied.tier_change {
            Some((original, _)) => (original, to),
            None => (from, to),
        });
    }
}

fn with_summary(reason: &str, report: &StatusReport) -> String {
    match &report.payload.summary {
        Some(summary) => format!("{}: {}", reason, summary),
        None => reason.to_string(),
    }
}

impl Default for ReviewMachine {
    fn default() -> Self {
        Self {
            investigation: InvestigationController::new(Default::default()),
            merge: MergeRetryWorkflow::new(),
            router: Arc::new(ChangeRouting::default()),
        }
    }
}
