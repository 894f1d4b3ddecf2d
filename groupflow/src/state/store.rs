//! State store contract and the in-memory backend
//!
//! The store is the only shared mutable resource. Group and session writes
//! are conditioned on the version the writer read; a mismatch fails with
//! [`StoreError::Conflict`] and nothing is written.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock};

use super::schema::keys;
use super::types::*;

/// Error type for state store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("version conflict on {key}: expected {expected}, found {actual}")]
    Conflict {
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Key already exists: {0}")]
    AlreadyExists(String),

    #[error("spawn record for group {group_id} iteration {iteration} already exists")]
    DuplicateSpawn { group_id: GroupId, iteration: u32 },

    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Lock poisoned")]
    LockPoisoned,
}

impl StoreError {
    /// Whether retrying the same operation on a later tick can succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict { .. } | Self::Unavailable(_))
    }
}

/// Result type for state store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a state store backend
pub type SharedStateStore = Arc<dyn StateStore>;

/// One atomic write: a group update plus the side records it produced.
///
/// `group.version` must be the version that was read. On success the stored
/// group carries `version + 1`.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupCommit {
    pub group: TaskGroup,
    pub investigation: Option<InvestigationState>,
    pub spawn_record: Option<SpawnRecord>,
    pub merge_attempt: Option<MergeAttempt>,
    pub escalation: Option<PlanningEscalation>,
}

impl GroupCommit {
    pub fn new(group: TaskGroup) -> Self {
        Self {
            group,
            investigation: None,
            spawn_record: None,
            merge_attempt: None,
            escalation: None,
        }
    }

    pub fn with_investigation(mut self, investigation: Option<InvestigationState>) -> Self {
        self.investigation = investigation;
        self
    }

    pub fn with_spawn_record(mut self, record: SpawnRecord) -> Self {
        self.spawn_record = Some(record);
        self
    }

    pub fn with_merge_attempt(mut self, attempt: Option<MergeAttempt>) -> Self {
        self.merge_attempt = attempt;
        self
    }

    pub fn with_escalation(mut self, escalation: Option<PlanningEscalation>) -> Self {
        self.escalation = escalation;
        self
    }
}

/// Typed CRUD over session state with version-conditioned writes
pub trait StateStore: Send + Sync {
    /// Store a new session. Fails if the id is taken.
    fn create_session(&self, session: &Session) -> StoreResult<()>;

    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>>;

    /// Write a session if its stored version equals `session.version`.
    /// Returns the new version.
    fn update_session(&self, session: &Session) -> StoreResult<u64>;

    /// Store a new group. Fails if the id is taken within the session.
    fn insert_group(&self, group: &TaskGroup) -> StoreResult<()>;

    fn get_group(&self, session_id: &str, group_id: &str) -> StoreResult<Option<TaskGroup>>;

    /// All groups of a session in id order
    fn list_groups(&self, session_id: &str) -> StoreResult<Vec<TaskGroup>>;

    /// Apply one commit atomically. Returns the new group version.
    fn commit(&self, commit: &GroupCommit) -> StoreResult<u64> {
        self.commit_all(std::slice::from_ref(commit))?;
        Ok(commit.group.version + 1)
    }

    /// Apply several commits all-or-nothing. Any conflict rejects the batch.
    fn commit_all(&self, commits: &[GroupCommit]) -> StoreResult<()> {
        self.insert_and_commit(&[], commits)
    }

    /// Store new groups and apply commits as one all-or-nothing write. A
    /// taken id or any conflict rejects the whole batch.
    fn insert_and_commit(&self, inserts: &[TaskGroup], commits: &[GroupCommit]) -> StoreResult<()>;

    fn get_investigation(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Option<InvestigationState>>;

    /// Spawn log of one group in iteration order
    fn list_spawn_records(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<SpawnRecord>>;

    fn has_spawn_record(
        &self,
        session_id: &str,
        group_id: &str,
        iteration: u32,
    ) -> StoreResult<bool>;

    /// Merge attempts of one group in attempt order
    fn list_merge_attempts(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<MergeAttempt>>;

    /// Planning escalations of a session in the order they were raised
    fn list_escalations(&self, session_id: &str) -> StoreResult<Vec<PlanningEscalation>>;
}

#[derive(Debug, Default)]
struct Tables {
    sessions: BTreeMap<String, Session>,
    groups: BTreeMap<String, TaskGroup>,
    investigations: BTreeMap<String, InvestigationState>,
    spawns: BTreeMap<String, SpawnRecord>,
    merges: BTreeMap<String, MergeAttempt>,
    escalations: BTreeMap<String, PlanningEscalation>,
}

fn scan<'a, T>(table: &'a BTreeMap<String, T>, prefix: &str) -> impl Iterator<Item = &'a T> + 'a {
    let prefix = prefix.to_string();
    table
        .range(prefix.clone()..)
        .take_while(move |(k, _)| k.starts_with(&prefix))
        .map(|(_, v)| v)
}

/// Process-local store. Supports fault injection for tests and dry runs:
/// [`InMemoryStore::set_available`] and [`InMemoryStore::fail_next_commits`].
#[derive(Debug)]
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    available: AtomicBool,
    forced_conflicts: AtomicU32,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            available: AtomicBool::new(true),
            forced_conflicts: AtomicU32::new(0),
        }
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Toggle availability; while unavailable every call fails
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make the next `n` commit calls fail with a version conflict
    pub fn fail_next_commits(&self, n: u32) {
        self.forced_conflicts.store(n, Ordering::SeqCst);
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("in-memory store switched off".to_string()))
        }
    }

    fn read(&self) -> StoreResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.check_available()?;
        self.tables.read().map_err(|_| StoreError::LockPoisoned)
    }

    fn write(&self) -> StoreResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.check_available()?;
        self.tables.write().map_err(|_| StoreError::LockPoisoned)
    }

    fn take_forced_conflict(&self) -> bool {
        self.forced_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl StateStore for InMemoryStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        let mut tables = self.write()?;
        let key = keys::session(&session.id);
        if tables.sessions.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        tables.sessions.insert(key, session.clone());
        Ok(())
    }

    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        let tables = self.read()?;
        Ok(tables.sessions.get(&keys::session(session_id)).cloned())
    }

    fn update_session(&self, session: &Session) -> StoreResult<u64> {
        let mut tables = self.write()?;
        let key = keys::session(&session.id);
        let stored = tables
            .sessions
            .get_mut(&key)
            .ok_or_else(|| StoreError::NotFound(key.clone()))?;
        if stored.version != session.version {
            return Err(StoreError::Conflict {
                key,
                expected: session.version,
                actual: stored.version,
            });
        }
        let mut next = session.clone();
        next.version += 1;
        *stored = next;
        Ok(session.version + 1)
    }

    fn insert_group(&self, group: &TaskGroup) -> StoreResult<()> {
        let mut tables = self.write()?;
        let key = keys::group(&group.session_id, &group.id);
        if tables.groups.contains_key(&key) {
            return Err(StoreError::AlreadyExists(key));
        }
        tables.groups.insert(key, group.clone());
        Ok(())
    }

    fn get_group(&self, session_id: &str, group_id: &str) -> StoreResult<Option<TaskGroup>> {
        let tables = self.read()?;
        Ok(tables.groups.get(&keys::group(session_id, group_id)).cloned())
    }

    fn list_groups(&self, session_id: &str) -> StoreResult<Vec<TaskGroup>> {
        let tables = self.read()?;
        Ok(scan(&tables.groups, &keys::groups_of(session_id))
            .cloned()
            .collect())
    }

    fn insert_and_commit(&self, inserts: &[TaskGroup], commits: &[GroupCommit]) -> StoreResult<()> {
        let mut tables = self.write()?;

        if self.take_forced_conflict() {
            let key = commits
                .first()
                .map(|c| keys::group(&c.group.session_id, &c.group.id))
                .unwrap_or_default();
            return Err(StoreError::Conflict {
                key,
                expected: 0,
                actual: 0,
            });
        }

        // Validate the whole batch before touching anything.
        let mut seen = HashSet::new();
        for group in inserts {
            let key = keys::group(&group.session_id, &group.id);
            if tables.groups.contains_key(&key) || !seen.insert(key.clone()) {
                return Err(StoreError::AlreadyExists(key));
            }
        }
        for commit in commits {
            let group = &commit.group;
            let key = keys::group(&group.session_id, &group.id);
            let stored = tables
                .groups
                .get(&key)
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if stored.version != group.version || !seen.insert(key.clone()) {
                return Err(StoreError::Conflict {
                    key,
                    expected: group.version,
                    actual: stored.version,
                });
            }
            if let Some(record) = &commit.spawn_record {
                let spawn_key = keys::spawn(&record.session_id, &record.group_id, record.iteration);
                if tables.spawns.contains_key(&spawn_key) {
                    return Err(StoreError::DuplicateSpawn {
                        group_id: record.group_id.clone(),
                        iteration: record.iteration,
                    });
                }
            }
        }

        for group in inserts {
            tables
                .groups
                .insert(keys::group(&group.session_id, &group.id), group.clone());
        }
        for commit in commits {
            let mut group = commit.group.clone();
            group.version += 1;
            tables
                .groups
                .insert(keys::group(&group.session_id, &group.id), group);

            if let Some(inv) = &commit.investigation {
                tables
                    .investigations
                    .insert(
                        keys::investigation(&inv.session_id, &inv.group_id),
                        inv.clone(),
                    );
            }
            if let Some(record) = &commit.spawn_record {
                tables.spawns.insert(
                    keys::spawn(&record.session_id, &record.group_id, record.iteration),
                    record.clone(),
                );
            }
            if let Some(attempt) = &commit.merge_attempt {
                tables.merges.insert(
                    keys::merge(&attempt.session_id, &attempt.group_id, attempt.attempt),
                    attempt.clone(),
                );
            }
            if let Some(esc) = &commit.escalation {
                let nanos = esc.raised_at.timestamp_nanos_opt().unwrap_or_default();
                tables.escalations.insert(
                    keys::escalation(&esc.session_id, nanos, &esc.group_id),
                    esc.clone(),
                );
            }
        }
        Ok(())
    }

    fn get_investigation(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Option<InvestigationState>> {
        let tables = self.read()?;
        Ok(tables
            .investigations
            .get(&keys::investigation(session_id, group_id))
            .cloned())
    }

    fn list_spawn_records(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<SpawnRecord>> {
        let tables = self.read()?;
        Ok(scan(&tables.spawns, &keys::spawns_of(session_id, group_id))
            .cloned()
            .collect())
    }

    fn has_spawn_record(
        &self,
        session_id: &str,
        group_id: &str,
        iteration: u32,
    ) -> StoreResult<bool> {
        let tables = self.read()?;
        Ok(tables
            .spawns
            .contains_key(&keys::spawn(session_id, group_id, iteration)))
    }

    fn list_merge_attempts(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<MergeAttempt>> {
        let tables = self.read()?;
        Ok(scan(&tables.merges, &keys::merges_of(session_id, group_id))
            .cloned()
            .collect())
    }

    fn list_escalations(&self, session_id: &str) -> StoreResult<Vec<PlanningEscalation>> {
        let tables = self.read()?;
        Ok(scan(&tables.escalations, &keys::escalations_of(session_id))
            .cloned()
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::Tier;
    use crate::invoker::{DispatchIntent, Role, StatusCode, VerifierStatus};

    fn seeded() -> (InMemoryStore, Session, TaskGroup) {
        let store = InMemoryStore::new();
        let session = Session::new(0).with_id("s1");
        store.create_session(&session).unwrap();
        let group = TaskGroup::new("g1", "Parser").in_session("s1");
        store.insert_group(&group).unwrap();
        (store, session, group)
    }

    #[test]
    fn test_session_crud() {
        let (store, mut session, _) = seeded();
        let retrieved = store.get_session("s1").unwrap().unwrap();
        assert_eq!(retrieved.current_wave, 0);

        session.current_wave = 1;
        assert_eq!(store.update_session(&session).unwrap(), 1);
        let retrieved = store.get_session("s1").unwrap().unwrap();
        assert_eq!(retrieved.current_wave, 1);
        assert_eq!(retrieved.version, 1);
    }

    #[test]
    fn test_stale_session_write_conflicts() {
        let (store, session, _) = seeded();
        store.update_session(&session).unwrap();
        let err = store.update_session(&session).unwrap_err();
        assert!(matches!(err, StoreError::Conflict { expected: 0, actual: 1, .. }));
        assert!(err.is_retryable());
    }

    #[test]
    fn test_group_commit_bumps_version() {
        let (store, _, mut group) = seeded();
        group.status = GroupStatus::Dispatched;
        assert_eq!(store.commit(&GroupCommit::new(group.clone())).unwrap(), 1);

        let stored = store.get_group("s1", "g1").unwrap().unwrap();
        assert_eq!(stored.version, 1);
        assert_eq!(stored.status, GroupStatus::Dispatched);

        // Writing from the stale read is rejected and leaves the group alone.
        group.status = GroupStatus::BlockedEscalated;
        assert!(matches!(
            store.commit(&GroupCommit::new(group)),
            Err(StoreError::Conflict { .. })
        ));
        let stored = store.get_group("s1", "g1").unwrap().unwrap();
        assert_eq!(stored.status, GroupStatus::Dispatched);
    }

    #[test]
    fn test_commit_all_is_all_or_nothing() {
        let (store, _, g1) = seeded();
        let g2 = TaskGroup::new("g2", "Lexer").in_session("s1");
        store.insert_group(&g2).unwrap();

        let mut stale = g2.clone();
        stale.version = 5;
        let mut fresh = g1.clone();
        fresh.status = GroupStatus::Dispatched;
        let result = store.commit_all(&[GroupCommit::new(fresh), GroupCommit::new(stale)]);
        assert!(result.is_err());
        assert_eq!(
            store.get_group("s1", "g1").unwrap().unwrap().status,
            GroupStatus::Pending
        );
    }

    #[test]
    fn test_insert_and_commit_is_all_or_nothing() {
        let (store, _, g1) = seeded();
        let mut rewired = g1.clone();
        rewired.dependencies.insert("g2".into());

        // A taken id rejects the inserts and the commit alike.
        let taken = TaskGroup::new("g1", "Parser again").in_session("s1");
        let fresh = TaskGroup::new("g2", "Lexer").in_session("s1");
        let err = store
            .insert_and_commit(&[fresh.clone(), taken], &[GroupCommit::new(rewired.clone())])
            .unwrap_err();
        assert!(matches!(err, StoreError::AlreadyExists(_)));
        assert!(store.get_group("s1", "g2").unwrap().is_none());
        assert!(store.get_group("s1", "g1").unwrap().unwrap().dependencies.is_empty());

        // So does a conflicting commit.
        store.fail_next_commits(1);
        assert!(store
            .insert_and_commit(std::slice::from_ref(&fresh), &[GroupCommit::new(rewired.clone())])
            .is_err());
        assert!(store.get_group("s1", "g2").unwrap().is_none());

        store
            .insert_and_commit(&[fresh], &[GroupCommit::new(rewired)])
            .unwrap();
        assert!(store.get_group("s1", "g2").unwrap().is_some());
        let g1 = store.get_group("s1", "g1").unwrap().unwrap();
        assert_eq!(g1.version, 1);
        assert!(g1.dependencies.contains("g2"));
    }

    #[test]
    fn test_duplicate_spawn_record_rejected() {
        let (store, _, mut group) = seeded();
        let dispatch = group.plan_dispatch(Role::Verifier, DispatchIntent::Verify, None);
        let code = StatusCode::Verifier(VerifierStatus::Pass);
        let record = SpawnRecord::new(&group, &dispatch, code);
        store
            .commit(&GroupCommit::new(group.clone()).with_spawn_record(record.clone()))
            .unwrap();
        assert!(store.has_spawn_record("s1", "g1", dispatch.iteration).unwrap());

        group.version = 1;
        let err = store
            .commit(&GroupCommit::new(group).with_spawn_record(record))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateSpawn { iteration: 1, .. }));
    }

    #[test]
    fn test_list_groups_is_scoped_to_session() {
        let (store, _, _) = seeded();
        store.create_session(&Session::new(0).with_id("s10")).unwrap();
        store
            .insert_group(&TaskGroup::new("g9", "Other").in_session("s10"))
            .unwrap();
        let ids: Vec<_> = store
            .list_groups("s1")
            .unwrap()
            .into_iter()
            .map(|g| g.id)
            .collect();
        assert_eq!(ids, vec!["g1".to_string()]);
    }

    #[test]
    fn test_merge_attempts_listed_in_order() {
        let (store, _, mut group) = seeded();
        for attempt in 1..=3 {
            let record = MergeAttempt {
                session_id: "s1".into(),
                group_id: "g1".into(),
                attempt,
                outcome: MergeOutcome::Conflict,
                tier: Tier::Base,
                detail: None,
                recorded_at: chrono::Utc::now(),
            };
            store
                .commit(&GroupCommit::new(group.clone()).with_merge_attempt(Some(record)))
                .unwrap();
            group.version += 1;
        }
        let attempts: Vec<u32> = store
            .list_merge_attempts("s1", "g1")
            .unwrap()
            .iter()
            .map(|a| a.attempt)
            .collect();
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[test]
    fn test_unavailable_store_fails_every_call() {
        let (store, _, _) = seeded();
        store.set_available(false);
        assert!(matches!(store.list_groups("s1"), Err(StoreError::Unavailable(_))));
        store.set_available(true);
        assert_eq!(store.list_groups("s1").unwrap().len(), 1);
    }

    #[test]
    fn test_forced_conflicts_are_consumed() {
        let (store, _, group) = seeded();
        store.fail_next_commits(1);
        assert!(store.commit(&GroupCommit::new(group.clone())).is_err());
        assert!(store.commit(&GroupCommit::new(group)).is_ok());
    }
}
