//! Orchestrator events
//!
//! Every admission, dispatch, transition, escalation, merge attempt and
//! session state change is published on a tokio broadcast bus. Events are
//! informational: publishing never fails the tick, and a bus with no
//! subscribers simply drops them.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::debug;

use crate::escalation::Tier;
use crate::invoker::{DispatchIntent, Role};
use crate::state::{
    GroupId, GroupStatus, InvestigationOutcome, MergeOutcome, PlanningTrigger, SessionId,
};

/// Channel capacity for broadcast
const CHANNEL_CAPACITY: usize = 256;

/// Everything the orchestrator announces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OrchestratorEvent {
    /// One admission batch was committed
    GroupsAdmitted { groups: Vec<GroupId> },

    /// A work order went out to a worker
    DispatchIssued {
        group_id: GroupId,
        role: Role,
        tier: Tier,
        iteration: u32,
        intent: DispatchIntent,
    },

    Transitioned {
        group_id: GroupId,
        from: GroupStatus,
        to: GroupStatus,
    },

    TierEscalated { group_id: GroupId, from: Tier, to: Tier },

    EscalatedToPlanning {
        group_id: GroupId,
        trigger: PlanningTrigger,
        reason: String,
    },

    InvestigationClosed {
        group_id: GroupId,
        outcome: InvestigationOutcome,
    },

    MergeAttempted {
        group_id: GroupId,
        attempt: u32,
        outcome: MergeOutcome,
    },

    /// A report that no longer matches stored state (stale or replayed)
    ReportIgnored {
        group_id: GroupId,
        iteration: u32,
        reason: String,
    },

    WaveAdvanced { from: u32, to: u32 },

    /// A blocked group was replaced by new groups
    GroupSplit {
        group_id: GroupId,
        replacements: Vec<GroupId>,
    },

    SessionCompleted { merged: usize, blocked: usize },

    AwaitingClarification { stalled: Vec<GroupId> },
}

impl OrchestratorEvent {
    /// Short name for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::GroupsAdmitted { .. } => "groups_admitted",
            Self::DispatchIssued { .. } => "dispatch_issued",
            Self::Transitioned { .. } => "transitioned",
            Self::TierEscalated { .. } => "tier_escalated",
            Self::EscalatedToPlanning { .. } => "escalated_to_planning",
            Self::InvestigationClosed { .. } => "investigation_closed",
            Self::MergeAttempted { .. } => "merge_attempted",
            Self::ReportIgnored { .. } => "report_ignored",
            Self::WaveAdvanced { .. } => "wave_advanced",
            Self::GroupSplit { .. } => "group_split",
            Self::SessionCompleted { .. } => "session_completed",
            Self::AwaitingClarification { .. } => "awaiting_clarification",
        }
    }

    /// Group the event concerns, if any
    pub fn group_id(&self) -> Option<&str> {
        match self {
            Self::DispatchIssued { group_id, .. }
            | Self::Transitioned { group_id, .. }
            | Self::TierEscalated { group_id, .. }
            | Self::EscalatedToPlanning { group_id, .. }
            | Self::InvestigationClosed { group_id, .. }
            | Self::MergeAttempted { group_id, .. }
            | Self::ReportIgnored { group_id, .. }
            | Self::GroupSplit { group_id, .. } => Some(group_id),
            _ => None,
        }
    }
}

/// An event stamped with its session and time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub session_id: SessionId,
    pub timestamp: DateTime<Utc>,
    pub event: OrchestratorEvent,
}

/// Shared reference to EventBus
pub type SharedEventBus = Arc<EventBus>;

/// Broadcast bus for orchestrator events
pub struct EventBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { sender }
    }

    /// Create a shared reference to this event bus
    pub fn shared(self) -> SharedEventBus {
        Arc::new(self)
    }

    /// Publish an event to all subscribers
    pub fn publish(&self, session_id: &str, event: OrchestratorEvent) {
        let event_type = event.event_type();
        let envelope = EventEnvelope {
            session_id: session_id.to_string(),
            timestamp: Utc::now(),
            event,
        };
        match self.sender.send(envelope) {
            Ok(count) => debug!(event_type, receivers = count, "Event published"),
            Err(_) => debug!(event_type, "Event published (no receivers)"),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        bus.publish("s1", OrchestratorEvent::WaveAdvanced { from: 0, to: 1 });

        let envelope = rx.recv().await.unwrap();
        assert_eq!(envelope.session_id, "s1");
        assert_eq!(
            envelope.event,
            OrchestratorEvent::WaveAdvanced { from: 0, to: 1 }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::new();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish("s1", OrchestratorEvent::SessionCompleted { merged: 1, blocked: 0 });
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let event = OrchestratorEvent::TierEscalated {
            group_id: "g1".into(),
            from: Tier::Base,
            to: Tier::Senior,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tier_escalated");
        assert_eq!(event.group_id(), Some("g1"));
        assert_eq!(event.event_type(), "tier_escalated");
    }
}
