//! Shared fixtures for integration tests

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use groupflow::invoker::{InvokeError, ReportPayload, Role, StatusReport, WorkOrder, WorkerInvoker};
use groupflow::state::{
    GroupCommit, GroupStatus, InMemoryStore, InvestigationState, MergeAttempt, PlanningEscalation,
    Session, SpawnRecord, StateStore, StoreError, StoreResult, TaskGroup, WorkCategory,
};

/// Invoker that answers from per-(group, role) scripts and falls back to the
/// happy-path code for the role once a script runs dry.
pub struct ScriptedInvoker {
    scripts: Mutex<HashMap<(String, Role), VecDeque<StatusReport>>>,
    orders: Mutex<Vec<WorkOrder>>,
}

impl ScriptedInvoker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            orders: Mutex::new(Vec::new()),
        })
    }

    /// Queue raw status codes for `group`'s `role` dispatches
    pub fn script(&self, group: &str, role: Role, codes: &[&str]) {
        let mut scripts = self.scripts.lock().unwrap();
        let queue = scripts.entry((group.to_string(), role)).or_default();
        queue.extend(codes.iter().map(|c| StatusReport::parse(role, c)));
    }

    /// Queue one full report
    pub fn script_report(&self, group: &str, report: StatusReport) {
        let mut scripts = self.scripts.lock().unwrap();
        scripts
            .entry((group.to_string(), report.role))
            .or_default()
            .push_back(report);
    }

    pub fn orders(&self) -> Vec<WorkOrder> {
        self.orders.lock().unwrap().clone()
    }

    pub fn orders_for(&self, group: &str) -> Vec<WorkOrder> {
        self.orders()
            .into_iter()
            .filter(|o| o.group_id == group)
            .collect()
    }

    fn happy_path(role: Role) -> StatusReport {
        let code = match role {
            Role::Implementer => "READY_FOR_VERIFICATION",
            Role::Verifier => "PASS",
            Role::Reviewer => "APPROVED",
            Role::Investigator => "ROOT_CAUSE_FOUND",
            Role::Merger => "MERGE_SUCCESS",
        };
        StatusReport::parse(role, code).with_payload(ReportPayload {
            root_cause: (role == Role::Investigator).then(|| "scripted root cause".to_string()),
            ..Default::default()
        })
    }
}

#[async_trait]
impl WorkerInvoker for ScriptedInvoker {
    async fn dispatch(&self, order: WorkOrder) -> Result<StatusReport, InvokeError> {
        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&(order.group_id.clone(), order.role))
            .and_then(|q| q.pop_front());
        let role = order.role;
        self.orders.lock().unwrap().push(order);
        Ok(scripted.unwrap_or_else(|| Self::happy_path(role)))
    }
}

/// Active groups per category right now
pub fn active_counts(store: &dyn StateStore, session_id: &str) -> (usize, usize) {
    let groups = store.list_groups(session_id).unwrap();
    let active = |category: WorkCategory| {
        groups
            .iter()
            .filter(|g| g.category == category && g.status.is_active())
            .count()
    };
    (active(WorkCategory::Implementation), active(WorkCategory::Research))
}

pub fn status_of(store: &dyn StateStore, session_id: &str, group_id: &str) -> GroupStatus {
    group(store, session_id, group_id).status
}

pub fn group(store: &dyn StateStore, session_id: &str, group_id: &str) -> TaskGroup {
    store.get_group(session_id, group_id).unwrap().unwrap()
}

/// In-memory store whose group reads can be made to fail on demand
pub struct FlakyStore {
    pub inner: Arc<InMemoryStore>,
    get_group_failures: AtomicU32,
}

impl FlakyStore {
    pub fn new(inner: Arc<InMemoryStore>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            get_group_failures: AtomicU32::new(0),
        })
    }

    /// Make the next `n` `get_group` calls fail as unavailable
    pub fn fail_next_group_reads(&self, n: u32) {
        self.get_group_failures.store(n, Ordering::SeqCst);
    }
}

impl StateStore for FlakyStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.inner.create_session(session)
    }

    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.inner.get_session(session_id)
    }

    fn update_session(&self, session: &Session) -> StoreResult<u64> {
        self.inner.update_session(session)
    }

    fn insert_group(&self, group: &TaskGroup) -> StoreResult<()> {
        self.inner.insert_group(group)
    }

    fn get_group(&self, session_id: &str, group_id: &str) -> StoreResult<Option<TaskGroup>> {
        let failing = self
            .get_group_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(StoreError::Unavailable("group read failed".to_string()));
        }
        self.inner.get_group(session_id, group_id)
    }

    fn list_groups(&self, session_id: &str) -> StoreResult<Vec<TaskGroup>> {
        self.inner.list_groups(session_id)
    }

    fn insert_and_commit(&self, inserts: &[TaskGroup], commits: &[GroupCommit]) -> StoreResult<()> {
        self.inner.insert_and_commit(inserts, commits)
    }

    fn get_investigation(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Option<InvestigationState>> {
        self.inner.get_investigation(session_id, group_id)
    }

    fn list_spawn_records(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<SpawnRecord>> {
        self.inner.list_spawn_records(session_id, group_id)
    }

    fn has_spawn_record(
        &self,
        session_id: &str,
        group_id: &str,
        iteration: u32,
    ) -> StoreResult<bool> {
        self.inner.has_spawn_record(session_id, group_id, iteration)
    }

    fn list_merge_attempts(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<MergeAttempt>> {
        self.inner.list_merge_attempts(session_id, group_id)
    }

    fn list_escalations(&self, session_id: &str) -> StoreResult<Vec<PlanningEscalation>> {
        self.inner.list_escalations(session_id)
    }
}
