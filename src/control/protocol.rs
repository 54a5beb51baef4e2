// Control protocol messages
//
// The TCP transport frames these as NDJSON tagged by `type`; the HTTP
// transport posts the inner structs as plain JSON bodies.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::membership::{MembershipUpdate, VirtualIpv4};
use crate::overlay::{NetworkPhase, NetworkStatus};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub organization_id: String,
    pub machine_id: Uuid,
    pub hostname: String,
    pub agent_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationResult {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_version: Option<String>,
    /// Server-preferred heartbeat period; overrides the local setting
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_interval_ms: Option<u64>,
}

/// One network this device is currently running, as reported upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunningNetwork {
    pub network_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub virtual_ipv4: Option<VirtualIpv4>,
    pub phase: NetworkPhase,
}

impl From<&NetworkStatus> for RunningNetwork {
    fn from(status: &NetworkStatus) -> Self {
        Self {
            network_name: status.network_name.clone(),
            virtual_ipv4: status.session.as_ref().map(|s| s.virtual_ipv4),
            phase: status.phase,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    pub organization_id: String,
    pub machine_id: Uuid,
    pub hostname: String,
    pub agent_version: String,
    #[serde(default)]
    pub running_networks: Vec<RunningNetwork>,
    pub sent_at: DateTime<Utc>,
}

/// Device → server frame (TCP transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Register(RegisterRequest),
    Heartbeat(HeartbeatRequest),
}

/// Server → device frame (TCP transport).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Registered(RegistrationResult),
    Memberships(MembershipUpdate),
    Rejected { reason: String },
    Error { message: String },
}
