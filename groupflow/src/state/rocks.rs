//! RocksDB-backed state store
//!
//! One column family per record type, JSON-encoded values. Every commit is a
//! single `WriteBatch`; version checks and the batch write happen under the
//! database write lock so two writers cannot both pass the same check.

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use rocksdb::{ColumnFamilyDescriptor, Options, WriteBatch, DB};
use serde::{de::DeserializeOwned, Serialize};

use super::schema::{self, keys, ALL_CFS};
use super::store::{GroupCommit, StateStore, StoreError, StoreResult};
use super::types::*;

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

fn encode<T: Serialize>(value: &T) -> StoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StoreError::Serialization(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StoreResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// RocksDB-backed persistent state store
pub struct RocksStateStore {
    db: RwLock<DB>,
    path: PathBuf,
}

impl RocksStateStore {
    /// Open or create a state store at the given path
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let path = path.into();

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect();

        let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

        Ok(Self {
            db: RwLock::new(db),
            path,
        })
    }

    /// Create a shared reference to this store
    pub fn shared(self) -> Arc<Self> {
        Arc::new(self)
    }

    /// Get the database path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    // =========================================================================
    // Generic operations
    // =========================================================================

    fn get_in<T: DeserializeOwned>(db: &DB, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family not found: {}", cf_name)))?;
        match db.get_cf(cf, key.as_bytes())? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        Self::get_in(&db, cf_name, key)
    }

    /// List all values under a key prefix in a column family
    fn scan<T: DeserializeOwned>(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<T>> {
        let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family not found: {}", cf_name)))?;

        let mut values = Vec::new();
        for result in db.prefix_iterator_cf(cf, prefix.as_bytes()) {
            let (key, value) = result?;
            if !key.starts_with(prefix.as_bytes()) {
                break; // Prefix no longer matches
            }
            values.push(decode(&value)?);
        }
        Ok(values)
    }

    fn put_new<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let cf = db
            .cf_handle(cf_name)
            .ok_or_else(|| StoreError::Backend(format!("column family not found: {}", cf_name)))?;
        if db.get_cf(cf, key.as_bytes())?.is_some() {
            return Err(StoreError::AlreadyExists(key.to_string()));
        }
        db.put_cf(cf, key.as_bytes(), encode(value)?)?;
        Ok(())
    }
}

impl StateStore for RocksStateStore {
    fn create_session(&self, session: &Session) -> StoreResult<()> {
        self.put_new(schema::CF_SESSIONS, &keys::session(&session.id), session)
    }

    fn get_session(&self, session_id: &str) -> StoreResult<Option<Session>> {
        self.get(schema::CF_SESSIONS, &keys::session(session_id))
    }

    fn update_session(&self, session: &Session) -> StoreResult<u64> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let key = keys::session(&session.id);
        let stored: Session = Self::get_in(&db, schema::CF_SESSIONS, &key)?
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
        let cf = db
            .cf_handle(schema::CF_SESSIONS)
            .ok_or_else(|| StoreError::Backend("column family not found: sessions".into()))?;
        db.put_cf(cf, key.as_bytes(), encode(&next)?)?;
        Ok(next.version)
    }

    fn insert_group(&self, group: &TaskGroup) -> StoreResult<()> {
        self.put_new(
            schema::CF_GROUPS,
            &keys::group(&group.session_id, &group.id),
            group,
        )
    }

    fn get_group(&self, session_id: &str, group_id: &str) -> StoreResult<Option<TaskGroup>> {
        self.get(schema::CF_GROUPS, &keys::group(session_id, group_id))
    }

    fn list_groups(&self, session_id: &str) -> StoreResult<Vec<TaskGroup>> {
        self.scan(schema::CF_GROUPS, &keys::groups_of(session_id))
    }

    fn insert_and_commit(&self, inserts: &[TaskGroup], commits: &[GroupCommit]) -> StoreResult<()> {
        let db = self.db.write().map_err(|_| StoreError::LockPoisoned)?;
        let cf = |name: &str| {
            db.cf_handle(name)
                .ok_or_else(|| StoreError::Backend(format!("column family not found: {}", name)))
        };

        let mut batch = WriteBatch::default();
        let mut seen = std::collections::HashSet::new();

        for group in inserts {
            let key = keys::group(&group.session_id, &group.id);
            let taken = db.get_cf(cf(schema::CF_GROUPS)?, key.as_bytes())?.is_some();
            if taken || !seen.insert(key.clone()) {
                return Err(StoreError::AlreadyExists(key));
            }
            batch.put_cf(cf(schema::CF_GROUPS)?, key.as_bytes(), encode(group)?);
        }

        for commit in commits {
            let group = &commit.group;
            let key = keys::group(&group.session_id, &group.id);
            let stored: TaskGroup = Self::get_in(&db, schema::CF_GROUPS, &key)?
                .ok_or_else(|| StoreError::NotFound(key.clone()))?;
            if stored.version != group.version || !seen.insert(key.clone()) {
                return Err(StoreError::Conflict {
                    key,
                    expected: group.version,
                    actual: stored.version,
                });
            }

            let mut next = group.clone();
            next.version += 1;
            batch.put_cf(cf(schema::CF_GROUPS)?, key.as_bytes(), encode(&next)?);

            if let Some(inv) = &commit.investigation {
                batch.put_cf(
                    cf(schema::CF_INVESTIGATIONS)?,
                    keys::investigation(&inv.session_id, &inv.group_id).as_bytes(),
                    encode(inv)?,
                );
            }
            if let Some(record) = &commit.spawn_record {
                let spawn_key = keys::spawn(&record.session_id, &record.group_id, record.iteration);
                if db.get_cf(cf(schema::CF_SPAWNS)?, spawn_key.as_bytes())?.is_some() {
                    return Err(StoreError::DuplicateSpawn {
                        group_id: record.group_id.clone(),
                        iteration: record.iteration,
                    });
                }
                batch.put_cf(
                    cf(schema::CF_SPAWNS)?,
                    spawn_key.as_bytes(),
                    encode(record)?,
                );
            }
            if let Some(attempt) = &commit.merge_attempt {
                batch.put_cf(
                    cf(schema::CF_MERGES)?,
                    keys::merge(&attempt.session_id, &attempt.group_id, attempt.attempt).as_bytes(),
                    encode(attempt)?,
                );
            }
            if let Some(esc) = &commit.escalation {
                let nanos = esc.raised_at.timestamp_nanos_opt().unwrap_or_default();
                batch.put_cf(
                    cf(schema::CF_ESCALATIONS)?,
                    keys::escalation(&esc.session_id, nanos, &esc.group_id).as_bytes(),
                    encode(esc)?,
                );
            }
        }

        db.write(batch)?;
        Ok(())
    }

    fn get_investigation(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Option<InvestigationState>> {
        self.get(
            schema::CF_INVESTIGATIONS,
            &keys::investigation(session_id, group_id),
        )
    }

    fn list_spawn_records(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<SpawnRecord>> {
        self.scan(schema::CF_SPAWNS, &keys::spawns_of(session_id, group_id))
    }

    fn has_spawn_record(
        &self,
        session_id: &str,
        group_id: &str,
        iteration: u32,
    ) -> StoreResult<bool> {
        let record: Option<SpawnRecord> = self.get(
            schema::CF_SPAWNS,
            &keys::spawn(session_id, group_id, iteration),
        )?;
        Ok(record.is_some())
    }

    fn list_merge_attempts(
        &self,
        session_id: &str,
        group_id: &str,
    ) -> StoreResult<Vec<MergeAttempt>> {
        self.scan(schema::CF_MERGES, &keys::merges_of(session_id, group_id))
    }

    fn list_escalations(&self, session_id: &str) -> StoreResult<Vec<PlanningEscalation>> {
        self.scan(schema::CF_ESCALATIONS, &keys::escalations_of(session_id))
    }
}
