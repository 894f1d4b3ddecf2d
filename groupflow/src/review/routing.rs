//! Routing of reviewer change requests
//!
//! A CHANGES_REQUESTED report goes back to either the implementer or the
//! verifier. The choice is a pluggable classification so deployments can
//! pick their own policy; [`ChangeRouting::ByDefectKind`] is the default.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::invoker::{DefectKind, ReportPayload, Role};
use crate::state::TaskGroup;

/// Decides which role receives a reviewer's change request
pub trait ChangeRouter: Send + Sync {
    fn route(&self, group: &TaskGroup, payload: &ReportPayload) -> Role;
}

/// Built-in routing policies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeRouting {
    /// Verification defects go to the verifier, everything else (including
    /// an unclassified request) to the implementer
    #[default]
    ByDefectKind,
    /// Every change request goes to the implementer
    AlwaysImplementer,
}

impl ChangeRouter for ChangeRouting {
    fn route(&self, _group: &TaskGroup, payload: &ReportPayload) -> Role {
        match self {
            Self::AlwaysImplementer => Role::Implementer,
            Self::ByDefectKind => match payload.defect_kind {
                Some(DefectKind::Verification) => Role::Verifier,
                Some(DefectKind::Implementation) | Some(DefectKind::Design) | None => {
                    Role::Implementer
                }
            },
        }
    }
}

impl FromStr for ChangeRouting {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "by_defect_kind" => Ok(Self::ByDefectKind),
            "always_implementer" => Ok(Self::AlwaysImplementer),
            other => Err(format!("unknown change routing: {}", other)),
        }
    }
}
