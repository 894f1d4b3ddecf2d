//! Concurrency admission control
//!
//! Each tick the scheduler decides which ready groups may start. Two
//! independent pools are enforced: `implementation` and `research` groups
//! never share slots. Ready groups beyond a pool's free slots stay PENDING
//! and are reconsidered next tick.
//!
//! The admitted set is written as one all-or-nothing batch. A tick either
//! admits every group it selected or none of them; it never stops partway.

use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::config::ConcurrencyPolicy;
use crate::error::CoordinationResult;
use crate::review::ReviewMachine;
use crate::state::{
    Dispatch, GroupCommit, GroupId, GroupStatus, StateStore, TaskGroup, WorkCategory,
};

/// Active (admitted, non-terminal) groups per pool
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActiveCounts {
    pub implementation: usize,
    pub research: usize,
}

impl ActiveCounts {
    pub fn from_groups(groups: &[TaskGroup]) -> Self {
        let mut counts = Self::default();
        for group in groups.iter().filter(|g| g.status.is_active()) {
            match group.category {
                WorkCategory::Implementation => counts.implementation += 1,
                WorkCategory::Research => counts.research += 1,
            }
        }
        counts
    }

    pub fn get(&self, category: WorkCategory) -> usize {
        match category {
            WorkCategory::Implementation => self.implementation,
            WorkCategory::Research => self.research,
        }
    }
}

/// One tick's admission decision
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AdmissionBatch {
    /// Groups to start, in admission order
    pub admitted: Vec<TaskGroup>,
    /// Ready groups left PENDING for lack of slots
    pub deferred: Vec<GroupId>,
    /// The store could not be read; nothing was admitted
    pub failed_closed: bool,
}

impl AdmissionBatch {
    fn closed() -> Self {
        Self {
            failed_closed: true,
            ..Self::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.admitted.is_empty()
    }
}

/// Admission control over review state machine instances
#[derive(Debug, Clone, Copy)]
pub struct ConcurrencyScheduler {
    policy: ConcurrencyPolicy,
}

impl ConcurrencyScheduler {
    pub fn new(policy: ConcurrencyPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &ConcurrencyPolicy {
        &self.policy
    }

    fn cap(&self, category: WorkCategory) -> usize {
        match category {
            WorkCategory::Implementation => self.policy.max_implementation,
            WorkCategory::Research => self.policy.max_research,
        }
    }

    /// Every dependency of `group` is present in `all` and MERGED. A blocked
    /// dependency never satisfies its dependents.
    pub fn dependencies_met(group: &TaskGroup, all: &HashMap<&str, &TaskGroup>) -> bool {
        group
            .dependencies
            .iter()
            .all(|dep| all.get(dep.as_str()).is_some_and(|d| d.status == GroupStatus::Merged))
    }

    /// Whether `group` could start now: PENDING, in an open wave, with its
    /// dependencies met.
    pub fn is_ready(group: &TaskGroup, all: &HashMap<&str, &TaskGroup>, current_wave: u32) -> bool {
        group.status == GroupStatus::Pending
            && group.wave <= current_wave
            && Self::dependencies_met(group, all)
    }

    /// Ready groups among `groups`, in admission order (wave, then id)
    pub fn ready<'a>(groups: &'a [TaskGroup], current_wave: u32) -> Vec<&'a TaskGroup> {
        let by_id: HashMap<&str, &TaskGroup> = groups.iter().map(|g| (g.id.as_str(), g)).collect();
        let mut ready: Vec<&TaskGroup> = groups
            .iter()
            .filter(|g| Self::is_ready(g, &by_id, current_wave))
            .collect();
        ready.sort_by(|a, b| (a.wave, &a.id).cmp(&(b.wave, &b.id)));
        ready
    }

    /// Pure admission decision: fill each pool's free slots from `candidates`
    /// in (wave, id) order.
    pub fn plan(&self, candidates: &[TaskGroup], active: ActiveCounts) -> AdmissionBatch {
        let mut ordered: Vec<&TaskGroup> = candidates.iter().collect();
        ordered.sort_by(|a, b| (a.wave, &a.id).cmp(&(b.wave, &b.id)));

        let categories = [WorkCategory::Implementation, WorkCategory::Research];
        let mut free: HashMap<WorkCategory, usize> = categories
            .into_iter()
            .map(|c| (c, self.cap(c).saturating_sub(active.get(c))))
            .collect();

        let mut batch = AdmissionBatch::default();
        for group in ordered {
            let slots = free.entry(group.category).or_insert(0);
            if *slots > 0 {
                *slots -= 1;
                batch.admitted.push(group.clone());
            } else {
                batch.deferred.push(group.id.clone());
            }
        }
        batch
    }

    /// Admit from `candidates` against the active counts in the store.
    ///
    /// Candidates are re-checked for readiness against stored state. If the
    /// store cannot be read, admission fails closed.
    pub fn admit(
        &self,
        store: &dyn StateStore,
        session_id: &str,
        current_wave: u32,
        candidates: &[TaskGroup],
    ) -> AdmissionBatch {
        let groups = match store.list_groups(session_id) {
            Ok(groups) => groups,
            Err(e) => {
                warn!(session = %session_id, error = %e, "Admission failed closed");
                return AdmissionBatch::closed();
            }
        };

        let by_id: HashMap<&str, &TaskGroup> = groups.iter().map(|g| (g.id.as_str(), g)).collect();
        let ready: Vec<TaskGroup> = candidates
            .iter()
            .filter_map(|c| by_id.get(c.id.as_str()).copied())
            .filter(|g| Self::is_ready(g, &by_id, current_wave))
            .cloned()
            .collect();

        let batch = self.plan(&ready, ActiveCounts::from_groups(&groups));
        if !batch.deferred.is_empty() {
            debug!(
                session = %session_id,
                deferred = batch.deferred.len(),
                "Ready groups deferred for lack of slots"
            );
        }
        batch
    }

    /// Move every admitted group to DISPATCHED and persist the batch
    /// atomically. Returns the first dispatch of each admitted group.
    pub fn commit(
        &self,
        store: &dyn StateStore,
        machine: &ReviewMachine,
        batch: &AdmissionBatch,
    ) -> CoordinationResult<Vec<(TaskGroup, Dispatch)>> {
        if batch.admitted.is_empty() {
            return Ok(Vec::new());
        }

        let mut started = Vec::with_capacity(batch.admitted.len());
        let mut commits = Vec::with_capacity(batch.admitted.len());
        for group in &batch.admitted {
            let mut next = group.clone();
            let dispatch = machine.admit(&mut next)?;
            commits.push(GroupCommit::new(next.clone()));
            next.version += 1;
            started.push((next, dispatch));
        }

        store.commit_all(&commits)?;
        info!(
            admitted = started.len(),
            groups = ?started.iter().map(|(g, _)| g.id.as_str()).collect::<Vec<_>>(),
            "Admission batch committed"
        );
        Ok(started)
    }
}
