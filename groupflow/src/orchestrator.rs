//! Tick driver: phase → admission → merge lane → dispatch → apply one report.
//!
//! Bookkeeping for a session is single-threaded: one `Orchestrator` owns the
//! session and mutates it only from [`Orchestrator::tick`]. Workers run
//! concurrently, up to the admission caps. Every dispatch a tick plans is
//! issued together, and the tick then resumes on the first report to come
//! back rather than waiting for all of them.
//!
//! Outstanding dispatches live on the groups in the store, not in memory. An
//! orchestrator attached to an existing session re-issues them, and a late or
//! replayed report for an iteration that already has a spawn record is
//! ignored, so re-entry is idempotent.

use std::collections::{HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tracing::{debug, info, warn};

use crate::advisory::AdvisorySource;
use crate::config::OrchestratorConfig;
use crate::error::{CoordinationError, CoordinationResult};
use crate::events::{EventBus, OrchestratorEvent, SharedEventBus};
use crate::graph::DependencyGraph;
use crate::invoker::{
    DispatchContext, DispatchIntent, InvokeError, Role, StatusReport, WorkOrder, WorkerInvoker,
};
use crate::merge::MergeRetryWorkflow;
use crate::phase::{PhaseController, PhaseDecision};
use crate::review::{Applied, ChangeRouter, GroupContext, ReviewError, ReviewMachine};
use crate::scheduler::ConcurrencyScheduler;
use crate::state::{
    Dispatch, GroupCommit, GroupId, GroupStatus, Session, SessionId, SessionStatus,
    SharedStateStore, StateStore, StoreError, TaskGroup,
};

/// Attempts at a session write before the conflict is surfaced
const SESSION_WRITE_ATTEMPTS: usize = 5;

/// What happened to one status report
#[derive(Debug, Clone, PartialEq)]
pub enum ApplyOutcome {
    /// The report moved the group; `status` is where it landed
    Applied { group_id: GroupId, status: GroupStatus },
    /// Stale, replayed or misaddressed; nothing changed
    Ignored { group_id: GroupId, reason: String },
    /// The write lost a race; the report is re-applied next tick
    Deferred { group_id: GroupId },
}

/// Summary of one tick
#[derive(Debug, Clone, PartialEq)]
pub struct TickReport {
    pub session_status: SessionStatus,
    pub current_wave: u32,
    pub admitted: Vec<GroupId>,
    pub issued: usize,
    pub applied: Option<ApplyOutcome>,
    /// Dispatches still awaiting a report after the tick
    pub in_flight: usize,
}

impl TickReport {
    fn new(session: &Session) -> Self {
        Self {
            session_status: session.status,
            current_wave: session.current_wave,
            admitted: Vec::new(),
            issued: 0,
            applied: None,
            in_flight: 0,
        }
    }
}

struct Completion {
    group_id: GroupId,
    iteration: u32,
    result: Result<StatusReport, InvokeError>,
}

/// Drives one session to completion
pub struct Orchestrator {
    session_id: SessionId,
    store: SharedStateStore,
    invoker: Arc<dyn WorkerInvoker>,
    advisories: Option<Arc<dyn AdvisorySource>>,
    config: OrchestratorConfig,
    machine: ReviewMachine,
    scheduler: ConcurrencyScheduler,
    phase: PhaseController,
    events: SharedEventBus,
    in_flight: FuturesUnordered<BoxFuture<'static, Completion>>,
    /// (group, iteration) issued and not yet applied, including deferred ones
    issued: HashSet<(GroupId, u32)>,
    deferred: VecDeque<(GroupId, u32, StatusReport)>,
}

impl Orchestrator {
    /// Validate `groups`, store a new session with them and bind to it.
    ///
    /// The session starts at the lowest wave present.
    pub fn open_session(
        store: SharedStateStore,
        invoker: Arc<dyn WorkerInvoker>,
        config: OrchestratorConfig,
        groups: Vec<TaskGroup>,
    ) -> CoordinationResult<Self> {
        config.validate()?;
        let graph = DependencyGraph::build(&groups)?;
        if !graph.external_dependencies().is_empty() {
            warn!(
                external = ?graph.external_dependencies(),
                "Groups depend on ids outside the session"
            );
        }

        let first_wave = groups.iter().map(|g| g.wave).min().unwrap_or(0);
        let session = Session::new(first_wave);
        store.create_session(&session)?;
        for mut group in groups {
            group.session_id = session.id.clone();
            store.insert_group(&group)?;
        }

        info!(
            session = %session.id,
            groups = graph.len(),
            first_wave,
            "Session opened"
        );
        Ok(Self::bind(session.id, store, invoker, config))
    }

    /// Bind to a session already in the store, e.g. after a restart
    pub fn attach(
        store: SharedStateStore,
        invoker: Arc<dyn WorkerInvoker>,
        config: OrchestratorConfig,
        session_id: &str,
    ) -> CoordinationResult<Self> {
        config.validate()?;
        if store.get_session(session_id)?.is_none() {
            return Err(CoordinationError::session_not_found(session_id));
        }
        info!(session = %session_id, "Attached to existing session");
        Ok(Self::bind(session_id.to_string(), store, invoker, config))
    }

    fn bind(
        session_id: SessionId,
        store: SharedStateStore,
        invoker: Arc<dyn WorkerInvoker>,
        config: OrchestratorConfig,
    ) -> Self {
        Self {
            session_id,
            store,
            invoker,
            advisories: None,
            machine: ReviewMachine::new(&config),
            scheduler: ConcurrencyScheduler::new(config.concurrency),
            phase: PhaseController::new(),
            events: EventBus::new().shared(),
            in_flight: FuturesUnordered::new(),
            issued: HashSet::new(),
            deferred: VecDeque::new(),
            config,
        }
    }

    /// Attach advisory findings to verifier and reviewer work orders
    pub fn with_advisories(mut self, source: Arc<dyn AdvisorySource>) -> Self {
        self.advisories = Some(source);
        self
    }

    pub fn with_events(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    /// Replace the change-request routing
    pub fn with_router(mut self, router: Arc<dyn ChangeRouter>) -> Self {
        self.machine = ReviewMachine::new(&self.config).with_router(router);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn events(&self) -> SharedEventBus {
        Arc::clone(&self.events)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Dispatches issued and not yet answered
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn session(&self) -> CoordinationResult<Session> {
        self.load_session()
    }

    // =========================================================================
    // Tick
    // =========================================================================

    /// Run one tick.
    ///
    /// Does nothing once the session is complete or paused. Store conflicts on
    /// group writes are absorbed and retried next tick; infrastructure
    /// failures are returned as retryable errors with no state half-written.
    pub async fn tick(&mut self) -> CoordinationResult<TickReport> {
        let mut session = self.load_session()?;
        let mut report = TickReport::new(&session);
        if session.status != SessionStatus::Running {
            return Ok(report);
        }

        // Reports that lost a write race go first, in the order received.
        let mut retries = std::mem::take(&mut self.deferred);
        while let Some((group_id, iteration, status)) = retries.pop_front() {
            if let Err(e) = self.apply_report(&group_id, iteration, status) {
                // Whatever was not reached stays queued behind the reports
                // deferred again this tick.
                self.deferred.extend(retries);
                return Err(e);
            }
        }

        let mut groups = self.store.list_groups(&self.session_id)?;
        if !self.continue_phase(&mut session, &groups)? {
            report.session_status = session.status;
            report.current_wave = session.current_wave;
            return Ok(report);
        }

        let admitted = self.admit(&session, &groups)?;
        let lane_moved = self.advance_merge_lane(&groups)?;
        if !admitted.is_empty() || lane_moved {
            groups = self.store.list_groups(&self.session_id)?;
        }
        report.admitted = admitted;

        let to_issue: Vec<TaskGroup> = groups
            .into_iter()
            .filter(|g| {
                g.outstanding
                    .as_ref()
                    .is_some_and(|d| !self.issued.contains(&(g.id.clone(), d.iteration)))
            })
            .collect();
        for group in to_issue {
            self.issue(group).await?;
            report.issued += 1;
        }
        if report.issued > 0 {
            self.record_dispatches(&mut session, report.issued as u64)?;
        }

        if let Some(completion) = self.in_flight.next().await {
            report.applied = Some(self.complete(completion)?);
        }

        report.session_status = session.status;
        report.current_wave = session.current_wave;
        report.in_flight = self.in_flight.len();
        Ok(report)
    }

    /// Tick until the session completes or pauses.
    ///
    /// Retryable failures are retried after the configured delay; after
    /// `max_consecutive_failures` of them in a row the run gives up.
    pub async fn run(&mut self) -> CoordinationResult<Session> {
        let mut failures = 0u32;
        loop {
            match self.tick().await {
                Ok(report) => {
                    failures = 0;
                    if report.session_status != SessionStatus::Running {
                        return self.load_session();
                    }
                }
                Err(e) if e.is_retryable() => {
                    failures += 1;
                    warn!(
                        session = %self.session_id,
                        failures,
                        error = %e,
                        "Tick failed, retrying"
                    );
                    if failures >= self.config.infra.max_consecutive_failures {
                        return Err(CoordinationError::InfrastructureExhausted {
                            failures,
                            last: e.to_string(),
                        });
                    }
                    tokio::time::sleep(self.config.infra.retry_delay()).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Phase loop. Returns `false` once the session stopped running.
    fn continue_phase(
        &mut self,
        session: &mut Session,
        groups: &[TaskGroup],
    ) -> CoordinationResult<bool> {
        loop {
            match self.phase.evaluate(session, groups, self.issued.len()) {
                PhaseDecision::Wait => return Ok(true),
                PhaseDecision::AdvanceWave { from, to } => {
                    session.current_wave = to;
                    self.save_session(session)?;
                    info!(session = %self.session_id, from, to, "Wave advanced");
                    self.publish(OrchestratorEvent::WaveAdvanced { from, to });
                }
                PhaseDecision::Complete => {
                    session.status = SessionStatus::Complete;
                    self.save_session(session)?;
                    let merged = groups.iter().filter(|g| g.status == GroupStatus::Merged).count();
                    let blocked = groups
                        .iter()
                        .filter(|g| g.status == GroupStatus::BlockedEscalated)
                        .count();
                    info!(
                        session = %self.session_id,
                        merged,
                        blocked,
                        dispatches = session.total_dispatches,
                        "Session complete"
                    );
                    self.publish(OrchestratorEvent::SessionCompleted { merged, blocked });
                    return Ok(false);
                }
                PhaseDecision::AwaitingClarification { stalled } => {
                    session.status = SessionStatus::AwaitingClarification;
                    session.clarification = Some(format!(
                        "dependencies of {} can never be met",
                        stalled.join(", ")
                    ));
                    self.save_session(session)?;
                    info!(session = %self.session_id, stalled = ?stalled, "Awaiting clarification");
                    self.publish(OrchestratorEvent::AwaitingClarification { stalled });
                    return Ok(false);
                }
            }
        }
    }

    fn admit(
        &mut self,
        session: &Session,
        groups: &[TaskGroup],
    ) -> CoordinationResult<Vec<GroupId>> {
        let candidates: Vec<TaskGroup> = ConcurrencyScheduler::ready(groups, session.current_wave)
            .into_iter()
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let batch = self.scheduler.admit(
            self.store.as_ref(),
            &self.session_id,
            session.current_wave,
            &candidates,
        );
        if batch.failed_closed {
            let reason = "admission could not read active groups".to_string();
            return Err(StoreError::Unavailable(reason).into());
        }

        let started = match self.scheduler.commit(self.store.as_ref(), &self.machine, &batch) {
            Ok(started) => started,
            Err(CoordinationError::Store(StoreError::Conflict { key, .. })) => {
                debug!(
                    session = %self.session_id,
                    key = %key,
                    "Admission batch lost a race, retrying next tick"
                );
                return Ok(Vec::new());
            }
            Err(e) => return Err(e),
        };

        let ids: Vec<GroupId> = started.iter().map(|(g, _)| g.id.clone()).collect();
        if !ids.is_empty() {
            for (group, _) in &started {
                self.publish(OrchestratorEvent::Transitioned {
                    group_id: group.id.clone(),
                    from: GroupStatus::Pending,
                    to: group.status,
                });
            }
            self.publish(OrchestratorEvent::GroupsAdmitted { groups: ids.clone() });
        }
        Ok(ids)
    }

    /// Give the merge slot to the next approved group, if it is free
    fn advance_merge_lane(&mut self, groups: &[TaskGroup]) -> CoordinationResult<bool> {
        let Some(next) = MergeRetryWorkflow::next_in_lane(groups) else {
            return Ok(false);
        };
        let mut group = next.clone();
        if self.machine.merge_workflow().begin(&mut group).is_none() {
            return Ok(false);
        }
        group.touch();

        match self.store.commit(&GroupCommit::new(group)) {
            Ok(_) => {
                debug!(session = %self.session_id, group = %next.id, "Merge slot assigned");
                Ok(true)
            }
            Err(StoreError::Conflict { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    // =========================================================================
    // Dispatch
    // =========================================================================

    async fn issue(&mut self, group: TaskGroup) -> CoordinationResult<()> {
        let Some(dispatch) = group.outstanding.clone() else {
            return Ok(());
        };
        let order = self.work_order(&group, &dispatch).await?;

        info!(
            group = %group.id,
            role = %dispatch.role,
            tier = %dispatch.tier,
            iteration = dispatch.iteration,
            intent = ?dispatch.intent,
            "Dispatching"
        );
        self.publish(OrchestratorEvent::DispatchIssued {
            group_id: group.id.clone(),
            role: dispatch.role,
            tier: dispatch.tier,
            iteration: dispatch.iteration,
            intent: dispatch.intent,
        });

        let group_id = group.id;
        let iteration = dispatch.iteration;
        self.issued.insert((group_id.clone(), iteration));

        let invoker = Arc::clone(&self.invoker);
        self.in_flight.push(
            async move {
                let result = match AssertUnwindSafe(invoker.dispatch(order)).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(InvokeError::Panicked(group_id.clone())),
                };
                Completion {
                    group_id,
                    iteration,
                    result,
                }
            }
            .boxed(),
        );
        Ok(())
    }

    async fn work_order(
        &self,
        group: &TaskGroup,
        dispatch: &Dispatch,
    ) -> CoordinationResult<WorkOrder> {
        let mut context = DispatchContext {
            failure_context: dispatch.note.clone(),
            revisions: group.revisions,
            integration_handle: group.integration_handle.clone(),
            ..Default::default()
        };

        let investigative = dispatch.role == Role::Investigator
            || matches!(
                dispatch.intent,
                DispatchIntent::Instrument | DispatchIntent::AssessPartialFindings
            );
        if investigative {
            if let Some(inv) = self.store.get_investigation(&group.session_id, &group.id)? {
                context.hypotheses = inv.open_hypotheses();
                context.evidence = inv.evidence.clone();
            }
        }

        if matches!(dispatch.role, Role::Verifier | Role::Reviewer) {
            if let Some(source) = &self.advisories {
                match source.findings(group).await {
                    Ok(findings) => context.advisories = findings,
                    Err(e) => warn!(group = %group.id, error = %e, "Advisory findings unavailable"),
                }
            }
        }

        Ok(WorkOrder {
            session_id: group.session_id.clone(),
            group_id: group.id.clone(),
            title: group.title.clone(),
            category: group.category,
            role: dispatch.role,
            tier: dispatch.tier,
            iteration: dispatch.iteration,
            intent: dispatch.intent,
            context,
        })
    }

    fn complete(&mut self, completion: Completion) -> CoordinationResult<ApplyOutcome> {
        let Completion {
            group_id,
            iteration,
            result,
        } = completion;
        match result {
            Ok(report) => self.apply_report(&group_id, iteration, report),
            Err(e) => {
                // The dispatch stays outstanding in the store and is issued
                // again next tick.
                self.issued.remove(&(group_id.clone(), iteration));
                warn!(group = %group_id, iteration, error = %e, "Worker invocation failed");
                Err(e.into())
            }
        }
    }

    // =========================================================================
    // Applying reports
    // =========================================================================

    /// Apply a report for `group_id`'s dispatch `iteration`.
    ///
    /// A report for an iteration that already has a spawn record, or that is
    /// not the group's outstanding dispatch, is ignored. A report that cannot
    /// be read against or written to the store right now is kept and
    /// re-applied next tick.
    pub fn apply_report(
        &mut self,
        group_id: &str,
        iteration: u32,
        report: StatusReport,
    ) -> CoordinationResult<ApplyOutcome> {
        let outcome = match self.try_apply(group_id, iteration, &report) {
            Err(e) if e.is_retryable() => {
                debug!(group = %group_id, iteration, error = %e, "Report deferred to next tick");
                Ok(ApplyOutcome::Deferred {
                    group_id: group_id.to_string(),
                })
            }
            other => other,
        };
        match &outcome {
            Ok(ApplyOutcome::Deferred { .. }) => {
                self.deferred
                    .push_back((group_id.to_string(), iteration, report));
            }
            _ => {
                self.issued.remove(&(group_id.to_string(), iteration));
            }
        }
        outcome
    }

    fn try_apply(
        &mut self,
        group_id: &str,
        iteration: u32,
        report: &StatusReport,
    ) -> CoordinationResult<ApplyOutcome> {
        if self.store.has_spawn_record(&self.session_id, group_id, iteration)? {
            return Ok(self.ignore(group_id, iteration, "report already applied".to_string()));
        }
        let group = self
            .store
            .get_group(&self.session_id, group_id)?
            .ok_or_else(|| CoordinationError::group_not_found(group_id))?;
        if group.outstanding.as_ref().map(|d| d.iteration) != Some(iteration) {
            return Ok(self.ignore(group_id, iteration, "not the outstanding dispatch".to_string()));
        }

        let mut ctx = GroupContext::new(group);
        ctx.investigation = self.store.get_investigation(&self.session_id, group_id)?;
        if report.role == Role::Merger {
            ctx.merge_history = self.store.list_merge_attempts(&self.session_id, group_id)?;
        }
        let seen = ctx.group.history.len();

        let applied = match self.machine.apply(&mut ctx, report) {
            Ok(applied) => applied,
            Err(ReviewError::RoleMismatch { expected, actual, .. }) => {
                let reason = format!("{} report for a {} dispatch", actual, expected);
                return Ok(self.ignore(group_id, iteration, reason));
            }
            Err(e) => return Err(e.into()),
        };

        match self.store.commit(&applied.commit(&ctx)) {
            Ok(_) => {}
            Err(StoreError::DuplicateSpawn { .. }) => {
                return Ok(self.ignore(group_id, iteration, "report already applied".to_string()));
            }
            Err(e) => return Err(e.into()),
        }

        self.announce(&ctx, &applied, seen);
        Ok(ApplyOutcome::Applied {
            group_id: group_id.to_string(),
            status: ctx.group.status,
        })
    }

    fn announce(&self, ctx: &GroupContext, applied: &Applied, seen: usize) {
        let group_id = &ctx.group.id;
        for record in ctx.group.history.iter().skip(seen) {
            self.publish(OrchestratorEvent::Transitioned {
                group_id: group_id.clone(),
                from: record.from,
                to: record.to,
            });
        }
        if let Some((from, to)) = applied.tier_change {
            self.publish(OrchestratorEvent::TierEscalated {
                group_id: group_id.clone(),
                from,
                to,
            });
        }
        if let Some(attempt) = &applied.merge_attempt {
            self.publish(OrchestratorEvent::MergeAttempted {
                group_id: group_id.clone(),
                attempt: attempt.attempt,
                outcome: attempt.outcome,
            });
        }
        if let Some(outcome) = applied.investigation_closed {
            self.publish(OrchestratorEvent::InvestigationClosed {
                group_id: group_id.clone(),
                outcome,
            });
        }
        if let Some(escalation) = &applied.escalation {
            self.publish(OrchestratorEvent::EscalatedToPlanning {
                group_id: group_id.clone(),
                trigger: escalation.trigger,
                reason: escalation.reason.clone(),
            });
        }
    }

    fn ignore(&self, group_id: &str, iteration: u32, reason: String) -> ApplyOutcome {
        debug!(group = %group_id, iteration, reason = %reason, "Report ignored");
        self.publish(OrchestratorEvent::ReportIgnored {
            group_id: group_id.to_string(),
            iteration,
            reason: reason.clone(),
        });
        ApplyOutcome::Ignored {
            group_id: group_id.to_string(),
            reason,
        }
    }

    // =========================================================================
    // Planning authority
    // =========================================================================

    /// Replace a BLOCKED_ESCALATED group with `replacements`.
    ///
    /// Pending dependents of the blocked group are rewired to depend on every
    /// replacement. Replacements join no earlier than the blocked group's
    /// wave. The replacements, the rewired dependents and the superseded
    /// group are written in one batch. Repeating a split that already landed
    /// only reopens the session. A paused or completed session is reopened.
    pub fn split_group(
        &mut self,
        group_id: &str,
        replacements: Vec<TaskGroup>,
    ) -> CoordinationResult<Vec<GroupId>> {
        let groups = self.store.list_groups(&self.session_id)?;
        let original = groups
            .iter()
            .find(|g| g.id == group_id)
            .cloned()
            .ok_or_else(|| CoordinationError::group_not_found(group_id))?;
        if original.status != GroupStatus::BlockedEscalated {
            return Err(CoordinationError::unexpected_state(
                group_id,
                original.status,
                "BLOCKED_ESCALATED",
            ));
        }

        let replacements: Vec<TaskGroup> = replacements
            .into_iter()
            .map(|mut g| {
                g.session_id = self.session_id.clone();
                g.wave = g.wave.max(original.wave);
                g
            })
            .collect();
        let ids: Vec<GroupId> = replacements.iter().map(|g| g.id.clone()).collect();

        if !original.superseded_by.is_empty() {
            if original.superseded_by != ids {
                return Err(CoordinationError::unexpected_state(
                    group_id,
                    original.status,
                    "BLOCKED_ESCALATED without replacements",
                ));
            }
            debug!(session = %self.session_id, group = %group_id, "Split already applied");
        } else {
            let mut commits = Vec::new();
            for group in groups
                .iter()
                .filter(|g| g.status == GroupStatus::Pending && g.dependencies.contains(group_id))
            {
                let mut rewired = group.clone();
                rewired.dependencies.remove(group_id);
                rewired.dependencies.extend(ids.iter().cloned());
                rewired.touch();
                commits.push(GroupCommit::new(rewired));
            }
            let mut superseded = original;
            superseded.superseded_by.extend(ids.iter().cloned());
            superseded.touch();
            commits.push(GroupCommit::new(superseded));

            let mut proposed: Vec<TaskGroup> = groups
                .into_iter()
                .filter(|g| !commits.iter().any(|c| c.group.id == g.id))
                .collect();
            proposed.extend(commits.iter().map(|c| c.group.clone()));
            proposed.extend(replacements.iter().cloned());
            DependencyGraph::build(&proposed)?;

            self.store.insert_and_commit(&replacements, &commits)?;
        }

        let mut session = self.load_session()?;
        if session.status != SessionStatus::Running {
            session.status = SessionStatus::Running;
            session.clarification = None;
            self.save_session(&mut session)?;
        }

        info!(
            session = %self.session_id,
            group = %group_id,
            replacements = ?ids,
            "Blocked group split"
        );
        self.publish(OrchestratorEvent::GroupSplit {
            group_id: group_id.to_string(),
            replacements: ids.clone(),
        });
        Ok(ids)
    }

    /// Drop `dependency` from every pending group waiting on it. Returns the
    /// number of groups released.
    pub fn satisfy_external_dependency(&mut self, dependency: &str) -> CoordinationResult<usize> {
        let commits: Vec<GroupCommit> = self
            .store
            .list_groups(&self.session_id)?
            .into_iter()
            .filter(|g| g.status == GroupStatus::Pending && g.dependencies.contains(dependency))
            .map(|mut g| {
                g.dependencies.remove(dependency);
                g.touch();
                GroupCommit::new(g)
            })
            .collect();
        self.store.commit_all(&commits)?;
        info!(
            session = %self.session_id,
            dependency = %dependency,
            released = commits.len(),
            "External dependency satisfied"
        );
        Ok(commits.len())
    }

    /// Leave the awaiting-clarification pause. Returns `false` if the session
    /// was not paused.
    pub fn resume(&mut self) -> CoordinationResult<bool> {
        let mut session = self.load_session()?;
        if session.status != SessionStatus::AwaitingClarification {
            return Ok(false);
        }
        session.status = SessionStatus::Running;
        session.clarification = None;
        self.save_session(&mut session)?;
        info!(session = %self.session_id, "Session resumed");
        Ok(true)
    }

    // =========================================================================
    // Session record
    // =========================================================================

    fn load_session(&self) -> CoordinationResult<Session> {
        self.store
            .get_session(&self.session_id)?
            .ok_or_else(|| CoordinationError::session_not_found(self.session_id.as_str()))
    }

    fn save_session(&self, session: &mut Session) -> CoordinationResult<()> {
        session.touch();
        session.version = self.store.update_session(session)?;
        Ok(())
    }

    fn record_dispatches(&self, session: &mut Session, count: u64) -> CoordinationResult<()> {
        let mut attempts = 0;
        loop {
            session.total_dispatches += count;
            match self.save_session(session) {
                Ok(()) => return Ok(()),
                Err(CoordinationError::Store(StoreError::Conflict { .. }))
                    if attempts + 1 < SESSION_WRITE_ATTEMPTS =>
                {
                    attempts += 1;
                    *session = self.load_session()?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn publish(&self, event: OrchestratorEvent) {
        self.events.publish(&self.session_id, event);
    }
}
