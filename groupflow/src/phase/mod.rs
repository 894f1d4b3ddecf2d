//! Phase continuation
//!
//! Decides after every tick whether the session waits, opens the next wave,
//! completes, or pauses for clarification. A later wave is opened as soon as
//! the current one is fully terminal; the only pause is a group that can
//! never become ready (an unknown dependency, or one that was blocked).

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::scheduler::ConcurrencyScheduler;
use crate::state::{GroupId, GroupStatus, Session, TaskGroup};

/// What the session should do next
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum PhaseDecision {
    /// Groups of the open waves are still moving
    Wait,
    /// Every group up to the current wave is terminal; open `to`
    AdvanceWave { from: u32, to: u32 },
    /// Every group is terminal
    Complete,
    /// Pending groups whose dependencies can never be met by this session
    AwaitingClarification { stalled: Vec<GroupId> },
}

/// Stateless wave/phase evaluator
#[derive(Debug, Clone, Copy, Default)]
pub struct PhaseController;

impl PhaseController {
    pub fn new() -> Self {
        Self
    }

    /// Evaluate the session's groups.
    ///
    /// `in_flight` counts dispatches issued but not yet answered; while any
    /// are outstanding the session never advances or pauses.
    pub fn evaluate(
        &self,
        session: &Session,
        groups: &[TaskGroup],
        in_flight: usize,
    ) -> PhaseDecision {
        let by_id: HashMap<&str, &TaskGroup> = groups.iter().map(|g| (g.id.as_str(), g)).collect();
        let open: Vec<&TaskGroup> = groups
            .iter()
            .filter(|g| g.wave <= session.current_wave && !g.is_terminal())
            .collect();

        if !open.is_empty() {
            if in_flight > 0 || open.iter().any(|g| g.status != GroupStatus::Pending) {
                return PhaseDecision::Wait;
            }
            // Only PENDING groups remain and nothing is running.
            let ready = open
                .iter()
                .any(|g| ConcurrencyScheduler::dependencies_met(g, &by_id));
            if ready {
                return PhaseDecision::Wait;
            }
            let mut stalled: Vec<GroupId> = open.iter().map(|g| g.id.clone()).collect();
            stalled.sort();
            debug!(session = %session.id, stalled = ?stalled, "No pending group can become ready");
            return PhaseDecision::AwaitingClarification { stalled };
        }

        if in_flight > 0 {
            return PhaseDecision::Wait;
        }

        match groups
            .iter()
            .map(|g| g.wave)
            .filter(|w| *w > session.current_wave)
            .min()
        {
            Some(next) => PhaseDecision::AdvanceWave {
                from: session.current_wave,
                to: next,
            },
            None => PhaseDecision::Complete,
        }
    }
}
