//! Server registration and heartbeat payloads.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse health the agent reports in heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    /// Pipeline healthy, broker and control plane reachable.
    Online,
    /// Running but at least one dependency is unreachable.
    Degraded,
}

/// One-time announcement of this agent's server to the control plane.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerRegistration {
    /// Server the agent relays for.
    pub server_id: String,
    /// Deployment region.
    pub region: String,
    /// Agent build version.
    pub version: String,
    /// Product capabilities the server advertises (for example `"STT"`).
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Periodic liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Coarse health verdict.
    pub status: ServerStatus,
    /// Small metrics mapping (queue backlog, processed totals).
    #[serde(default)]
    pub metrics: serde_json::Map<String, serde_json::Value>,
    /// When the agent sent this beat.
    pub sent_at: DateTime<Utc>,
}
