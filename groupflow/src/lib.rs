//! groupflow: task-group scheduling and review state machine
//!
//! Coordinates worker roles (implementer, verifier, reviewer, investigator,
//! merge step) over task groups under hard concurrency limits, with
//! automatic retry, escalation, and merge-on-approval.
//!
//! # Components
//!
//! - [`scheduler`]: admission control, 4 implementation and 2 research groups
//!   at a time, admitted as one atomic batch per tick
//! - [`review`]: per-group transitions driven by worker status reports
//! - [`escalation`]: pure ladder from failure history to capability tier
//! - [`investigation`]: bounded hypothesis loop for blocking defects
//! - [`merge`]: serialized integration with its own retry ladder
//! - [`phase`]: wave advance, completion, and the clarification pause
//! - [`orchestrator`]: async tick driver wiring the above to a
//!   [`state::StateStore`] and a [`invoker::WorkerInvoker`]
//!
//! # Usage
//!
//! ```ignore
//! use std::sync::Arc;
//! use groupflow::{InMemoryStore, Orchestrator, OrchestratorConfig, TaskGroup};
//!
//! let groups = vec![
//!     TaskGroup::new("model", "Data model"),
//!     TaskGroup::new("api", "HTTP API").depends_on("model").with_wave(1),
//! ];
//! let mut orch = Orchestrator::open_session(
//!     InMemoryStore::new().shared(),
//!     Arc::new(my_invoker),
//!     OrchestratorConfig::from_env()?,
//!     groups,
//! )?;
//! let session = orch.run().await?;
//! ```

#![allow(clippy::uninlined_format_args)]

pub mod advisory;
pub mod config;
pub mod error;
pub mod escalation;
pub mod events;
pub mod graph;
pub mod investigation;
pub mod invoker;
pub mod merge;
pub mod orchestrator;
pub mod phase;
pub mod review;
pub mod scheduler;
pub mod state;
pub mod telemetry;

pub use advisory::{AdvisoryFinding, AdvisorySkill, AdvisorySource};
pub use config::{ConcurrencyPolicy, ConfigError, InvestigationPolicy, OrchestratorConfig};
pub use error::{CoordinationError, CoordinationResult};
pub use escalation::{escalate, EscalationDecision, FailureContext, Tier};
pub use events::{EventBus, EventEnvelope, OrchestratorEvent, SharedEventBus};
pub use graph::{DependencyGraph, GraphError};
pub use investigation::{InvestigationController, InvestigationStep};
pub use invoker::{
    CommandInvoker, DispatchIntent, InvokeError, Role, StatusCode, StatusReport, WorkOrder,
    WorkerInvoker,
};
pub use merge::{MergeAction, MergeRetryWorkflow};
pub use orchestrator::{ApplyOutcome, Orchestrator, TickReport};
pub use phase::{PhaseController, PhaseDecision};
pub use review::{ChangeRouting, ReviewMachine};
pub use scheduler::{ActiveCounts, AdmissionBatch, ConcurrencyScheduler};
pub use state::{
    GroupStatus, InMemoryStore, Session, SessionStatus, SharedStateStore, StateStore, TaskGroup,
    WorkCategory,
};
pub use telemetry::init_tracing;
