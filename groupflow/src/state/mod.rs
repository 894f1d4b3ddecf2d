//! State persistence for orchestration sessions
//!
//! The store holds every record the control logic needs to resume a session:
//! - Sessions with their current wave and global status
//! - Task groups with tier, revisions, review status and transition log
//! - Investigation state attached to a group
//! - The append-only spawn log, merge attempts and planning escalations
//!
//! # Architecture
//!
//! [`StateStore`] is a synchronous trait shared as `Arc<dyn StateStore>`.
//! [`InMemoryStore`] is the default backend. With the `heavy-state` feature,
//! [`RocksStateStore`] keeps each record type in its own column family.
//!
//! # Usage
//!
//! ```ignore
//! use groupflow::state::{InMemoryStore, Session, StateStore, TaskGroup};
//!
//! let store = InMemoryStore::new();
//! let session = Session::new(0);
//! store.create_session(&session)?;
//! store.insert_group(&TaskGroup::new("g1", "Add parser").in_session(&session.id))?;
//! ```

pub mod schema;
pub mod store;
pub mod types;

#[cfg(feature = "heavy-state")]
pub mod rocks;

#[cfg(feature = "heavy-state")]
pub use rocks::RocksStateStore;
pub use store::{GroupCommit, InMemoryStore, SharedStateStore, StateStore, StoreError, StoreResult};
pub use types::{
    Dispatch, GroupId, GroupStatus, Hypothesis, HypothesisStatus, InvestigationOrigin,
    InvestigationOutcome, InvestigationState, MergeAttempt, MergeOutcome, PlanningEscalation,
    PlanningTrigger, Session, SessionId, SessionStatus, SpawnRecord, TaskGroup, TransitionRecord,
    WorkCategory,
};
