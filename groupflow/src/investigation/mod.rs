//! Bounded investigation loop
//!
//! Entered when a worker reports a blocking defect with no obvious fix. Each
//! iteration is one investigator dispatch; the controller, not the worker,
//! enforces the iteration ceiling.
//!
//! ```text
//! ROOT_CAUSE_FOUND       → exit, validated-fix dispatch
//! HYPOTHESIS_ELIMINATED  → strike hypothesis, continue
//! NEED_MORE_DIAGNOSTIC   → implementer adds instrumentation, continue
//! BLOCKED                → exit, planning authority
//! ceiling reached        → exit as exhausted, reviewer weighs partial findings
//! ```

use chrono::Utc;
use tracing::{debug, info};

use crate::config::InvestigationPolicy;
use crate::invoker::{
    ImplementerStatus, InvestigatorStatus, StatusCode, StatusReport,
};
use crate::state::{
    Hypothesis, HypothesisStatus, InvestigationOrigin, InvestigationOutcome, InvestigationState,
    TaskGroup,
};

/// What the loop does after one report
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvestigationStep {
    /// Dispatch the investigator again
    Continue,
    /// Dispatch the implementer for instrumentation only
    Instrument { request: String },
    /// Root cause confirmed; dispatch a validated fix
    RootCause { statement: String },
    /// Early exit to the planning authority
    Blocked { reason: String },
    /// Ceiling reached; the reviewer decides on the partial findings
    Exhausted,
}

impl InvestigationStep {
    pub fn is_exit(&self) -> bool {
        matches!(
            self,
            Self::RootCause { .. } | Self::Blocked { .. } | Self::Exhausted
        )
    }
}

/// Drives [`InvestigationState`] from investigator reports
#[derive(Debug, Clone, Copy)]
pub struct InvestigationController {
    policy: InvestigationPolicy,
}

impl InvestigationController {
    pub fn new(policy: InvestigationPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &InvestigationPolicy {
        &self.policy
    }

    /// Whether `group` may open another investigation
    pub fn can_open(&self, group: &TaskGroup) -> bool {
        group.investigations < self.policy.max_per_group
    }

    /// Open a fresh investigation for `group`
    pub fn open(
        &self,
        group: &TaskGroup,
        origin: InvestigationOrigin,
        problem_summary: impl Into<String>,
        hypotheses: &[String],
    ) -> InvestigationState {
        let state = InvestigationState {
            session_id: group.session_id.clone(),
            group_id: group.id.clone(),
            problem_summary: problem_summary.into(),
            origin,
            hypotheses: hypotheses.iter().map(Hypothesis::open).collect(),
            evidence: Vec::new(),
            iteration: 0,
            restarts: 0,
            outcome: None,
            root_cause: None,
            opened_at: Utc::now(),
            closed_at: None,
        };
        info!(
            group = %group.id,
            origin = ?origin,
            hypotheses = state.hypotheses.len(),
            "Investigation opened"
        );
        state
    }

    /// Apply one investigator report. Consumes one iteration.
    pub fn on_report(
        &self,
        state: &mut InvestigationState,
        report: &StatusReport,
    ) -> InvestigationStep {
        state.iteration += 1;
        let iteration = state.iteration;
        record_evidence(state, report);

        let step = match &report.code {
            StatusCode::Investigator(InvestigatorStatus::RootCauseFound) => {
                let statement = report
                    .payload
                    .root_cause
                    .clone()
                    .or_else(|| report.payload.summary.clone())
                    .unwrap_or_else(|| "root cause reported without a statement".to_string());
                for h in state.hypotheses.iter_mut() {
                    if h.status == HypothesisStatus::Open && h.statement == statement {
                        h.status = HypothesisStatus::Confirmed;
                        h.resolved_at_iteration = Some(iteration);
                    }
                }
                state.root_cause = Some(statement.clone());
                InvestigationStep::RootCause { statement }
            }
            StatusCode::Investigator(InvestigatorStatus::HypothesisEliminated) => {
                strike(state, &report.payload.eliminated, iteration);
                self.continue_or_exhaust(state, InvestigationStep::Continue)
            }
            StatusCode::Investigator(InvestigatorStatus::NeedMoreDiagnostic) => {
                let request = report
                    .payload
                    .summary
                    .clone()
                    .unwrap_or_else(|| "add diagnostic instrumentation".to_string());
                self.continue_or_exhaust(state, InvestigationStep::Instrument { request })
            }
            StatusCode::Investigator(InvestigatorStatus::Blocked) => InvestigationStep::Blocked {
                reason: report
                    .payload
                    .summary
                    .clone()
                    .unwrap_or_else(|| "investigator blocked".to_string()),
            },
            other => {
                // Not in the investigator vocabulary: stop and let the
                // reviewer classify alongside the partial findings.
                state
                    .evidence
                    .push(format!("unclassified investigator status {}", other));
                InvestigationStep::Exhausted
            }
        };

        self.close_if_exit(state, &step);
        debug!(
            group = %state.group_id,
            iteration,
            step = ?step,
            "Investigation iteration applied"
        );
        step
    }

    /// Apply the implementer's reply to an instrumentation request. Does not
    /// consume an iteration.
    pub fn on_instrumentation(
        &self,
        state: &mut InvestigationState,
        report: &StatusReport,
    ) -> InvestigationStep {
        record_evidence(state, report);
        let step = match &report.code {
            StatusCode::Implementer(ImplementerStatus::Blocked) => InvestigationStep::Blocked {
                reason: report
                    .payload
                    .summary
                    .clone()
                    .unwrap_or_else(|| "instrumentation blocked".to_string()),
            },
            StatusCode::Unknown(raw) => {
                state
                    .evidence
                    .push(format!("unclassified implementer status {}", raw));
                InvestigationStep::Exhausted
            }
            _ => InvestigationStep::Continue,
        };
        self.close_if_exit(state, &step);
        step
    }

    /// Reset the iteration count for a new strategy. Allowed
    /// `max_restarts` times per investigation.
    pub fn restart(&self, state: &mut InvestigationState, strategy: &[String]) -> bool {
        if state.restarts >= self.policy.max_restarts {
            return false;
        }
        state.restarts += 1;
        state.iteration = 0;
        state.outcome = None;
        state.closed_at = None;
        state
            .hypotheses
            .extend(strategy.iter().map(Hypothesis::open));
        info!(
            group = %state.group_id,
            restarts = state.restarts,
            "Investigation restarted with a new strategy"
        );
        true
    }

    /// Close an open investigation with `outcome`
    pub fn close(&self, state: &mut InvestigationState, outcome: InvestigationOutcome) {
        if state.outcome.is_none() {
            state.outcome = Some(outcome);
            state.closed_at = Some(Utc::now());
            info!(
                group = %state.group_id,
                outcome = %outcome,
                iterations = state.iteration,
                "Investigation closed"
            );
        }
    }

    fn continue_or_exhaust(
        &self,
        state: &InvestigationState,
        step: InvestigationStep,
    ) -> InvestigationStep {
        if state.iteration >= self.policy.max_iterations {
            InvestigationStep::Exhausted
        } else {
            step
        }
    }

    fn close_if_exit(&self, state: &mut InvestigationState, step: &InvestigationStep) {
        let outcome = match step {
            InvestigationStep::RootCause { .. } => InvestigationOutcome::RootCauseFound,
            InvestigationStep::Blocked { .. } => InvestigationOutcome::Blocked,
            InvestigationStep::Exhausted => InvestigationOutcome::Exhausted,
            _ => return,
        };
        self.close(state, outcome);
    }
}

fn record_evidence(state: &mut InvestigationState, report: &StatusReport) {
    if let Some(summary) = &report.payload.summary {
        state.evidence.push(summary.clone());
    }
    state.evidence.extend(report.payload.findings.iter().cloned());
    for statement in &report.payload.hypotheses {
        if !state.hypotheses.iter().any(|h| &h.statement == statement) {
            state.hypotheses.push(Hypothesis::open(statement));
        }
    }
}

/// Strike the named hypotheses, or the first open one if none are named
fn strike(state: &mut InvestigationState, named: &[String], iteration: u32) {
    let mut struck = false;
    for h in state.hypotheses.iter_mut() {
        if h.status == HypothesisStatus::Open && named.contains(&h.statement) {
            h.status = HypothesisStatus::Eliminated;
            h.resolved_at_iteration = Some(iteration);
            struck = true;
        }
    }
    if !struck {
        if let Some(h) = state
            .hypotheses
            .iter_mut()
            .find(|h| h.status == HypothesisStatus::Open)
        {
            h.status = HypothesisStatus::Eliminated;
            h.resolved_at_iteration = Some(iteration);
        }
    }
}
