//! Fleet inventory types (instances, agents, routes)

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A managed Docker instance, owned by exactly one agent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Instance {
    pub id: String,
    pub agent_id: String,
    pub name: String,
}

/// A remote agent record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub id: String,
    /// Identity of the host this agent manages; control connections are keyed by it
    pub host_id: String,
    pub name: String,
    pub last_seen: DateTime<Utc>,
}

/// Resolved path from an instance to the host connection that serves it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub instance_id: String,
    pub agent_id: String,
    pub host_id: String,
}
