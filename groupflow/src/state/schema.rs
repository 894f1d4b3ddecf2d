//! Column family definitions and key layout for the state store
//!
//! Keys are compound strings so that prefix iteration returns every record
//! of one session (or one group) in key order. Iteration indices and
//! attempt numbers are zero-padded to keep lexical and numeric order equal.

/// Column family for sessions
pub const CF_SESSIONS: &str = "sessions";

/// Column family for task groups
pub const CF_GROUPS: &str = "groups";

/// Column family for investigation state
pub const CF_INVESTIGATIONS: &str = "investigations";

/// Column family for the spawn log
pub const CF_SPAWNS: &str = "spawns";

/// Column family for merge attempts
pub const CF_MERGES: &str = "merges";

/// Column family for planning escalations
pub const CF_ESCALATIONS: &str = "escalations";

/// All column family names
pub const ALL_CFS: &[&str] = &[
    CF_SESSIONS,
    CF_GROUPS,
    CF_INVESTIGATIONS,
    CF_SPAWNS,
    CF_MERGES,
    CF_ESCALATIONS,
];

/// Key prefixes for compound keys
pub mod keys {
    /// Create a session key
    pub fn session(session_id: &str) -> String {
        format!("sess:{}", session_id)
    }

    /// Prefix covering every group of a session
    pub fn groups_of(session_id: &str) -> String {
        format!("group:{}:", session_id)
    }

    /// Create a group key
    pub fn group(session_id: &str, group_id: &str) -> String {
        format!("{}{}", groups_of(session_id), group_id)
    }

    /// Create an investigation key (one per group)
    pub fn investigation(session_id: &str, group_id: &str) -> String {
        format!("inv:{}:{}", session_id, group_id)
    }

    /// Prefix covering the spawn log of one group
    pub fn spawns_of(session_id: &str, group_id: &str) -> String {
        format!("spawn:{}:{}:", session_id, group_id)
    }

    /// Create a spawn record key (group + iteration)
    pub fn spawn(session_id: &str, group_id: &str, iteration: u32) -> String {
        format!("{}{:010}", spawns_of(session_id, group_id), iteration)
    }

    /// Prefix covering the merge attempts of one group
    pub fn merges_of(session_id: &str, group_id: &str) -> String {
        format!("merge:{}:{}:", session_id, group_id)
    }

    /// Create a merge attempt key
    pub fn merge(session_id: &str, group_id: &str, attempt: u32) -> String {
        format!("{}{:010}", merges_of(session_id, group_id), attempt)
    }

    /// Prefix covering the planning escalations of a session
    pub fn escalations_of(session_id: &str) -> String {
        format!("esc:{}:", session_id)
    }

    /// Create a planning escalation key (timestamp-based for ordering)
    pub fn escalation(session_id: &str, timestamp_nanos: i64, group_id: &str) -> String {
        format!("{}{:020}:{}", escalations_of(session_id), timestamp_nanos, group_id)
    }

    /// Parse the iteration index back out of a spawn key
    pub fn parse_spawn_iteration(key: &str) -> Option<u32> {
        let parts: Vec<&str> = key.split(':').collect();
        if parts.len() == 4 && parts[0] == "spawn" {
            parts[3].parse().ok()
        } else {
            None
        }
    }
}
