//! Capability tiers a worker can be dispatched at

use serde::{Deserialize, Serialize};

/// Capability / authority level, ordered from lowest to highest.
///
/// `PlanningAuthority` is never a dispatch tier: reaching it means the group
/// leaves the automated loop and is surfaced for re-scoping.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Default tier for first attempts
    #[default]
    Base,
    /// Stronger worker after a repeated failure
    Senior,
    /// Architectural guidance rather than re-implementation
    Lead,
    /// Top-level planning authority (re-scope, split, abandon)
    PlanningAuthority,
}

impl Tier {
    /// All tiers in ladder order
    pub fn all() -> &'static [Tier] {
        &[
            Tier::Base,
            Tier::Senior,
            Tier::Lead,
            Tier::PlanningAuthority,
        ]
    }

    /// The next rung up the ladder (saturates at the planning authority)
    pub fn next(self) -> Self {
        match self {
            Self::Base => Self::Senior,
            Self::Senior => Self::Lead,
            Self::Lead | Self::PlanningAuthority => Self::PlanningAuthority,
        }
    }

    /// Whether a worker can be dispatched at this tier
    pub fn is_dispatchable(self) -> bool {
        !matches!(self, Self::PlanningAuthority)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Base => write!(f, "base"),
            Self::Senior => write!(f, "senior"),
            Self::Lead => write!(f, "lead"),
            Self::PlanningAuthority => write!(f, "planning_authority"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "base" => Ok(Self::Base),
            "senior" => Ok(Self::Senior),
            "lead" => Ok(Self::Lead),
            "planning_authority" | "planning" => Ok(Self::PlanningAuthority),
            other => Err(format!("unknown tier '{}'", other)),
        }
    }
}
