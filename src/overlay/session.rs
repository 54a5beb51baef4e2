// Session snapshots and the per-instance session board
//
// Each network's supervisor task owns its live session. What the rest of the
// process sees is a cloned `NetworkStatus` published to the board after every
// state change.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::membership::{PeerEndpoint, VirtualIpv4};

/// Lifecycle phase of one network membership.
///
/// `Absent -> Joining -> Joined -> Leaving -> Absent`, with
/// `Joined -> Degraded -> Joined | Leaving` for health and
/// `Joining -> Failed` when peers reject the device outright.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkPhase {
    Absent,
    Joining,
    Joined,
    Degraded,
    Leaving,
    Failed,
}

impl NetworkPhase {
    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: NetworkPhase) -> bool {
        use NetworkPhase::*;
        matches!(
            (self, next),
            (Absent, Joining)
                | (Joining, Joined)
                | (Joining, Failed)
                | (Joining, Leaving)
                | (Joining, Joining)
                | (Joined, Degraded)
                | (Joined, Leaving)
                | (Degraded, Joined)
                | (Degraded, Leaving)
                | (Leaving, Absent)
                | (Leaving, Joining)
                | (Failed, Joining)
                | (Failed, Leaving)
        )
    }

    /// Phases in which a session (virtual IP) is held.
    pub fn has_session(self) -> bool {
        matches!(self, NetworkPhase::Joined | NetworkPhase::Degraded)
    }
}

/// Connection state towards one peer or relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerLinkState {
    Connected,
    Unreachable,
    Rejected,
    Unsupported,
    NotTried,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerState {
    pub endpoint: PeerEndpoint,
    pub state: PeerLinkState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub peer_id: Option<String>,
}

/// Immutable snapshot of an active overlay session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverlaySession {
    pub network_name: String,
    pub virtual_ipv4: VirtualIpv4,
    pub hostname: String,
    pub agent_version: String,
    pub peers: Vec<PeerState>,
    pub joined_at: DateTime<Utc>,
}

/// Result of one health probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthStatus {
    Healthy,
    Unhealthy(String),
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }
}

/// Externally visible status of one network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkStatus {
    pub network_name: String,
    pub phase: NetworkPhase,
    /// Present only while `phase.has_session()`
    pub session: Option<OverlaySession>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Shared read-mostly table of network statuses for one instance.
#[derive(Debug, Clone, Default)]
pub struct SessionBoard {
    networks: Arc<DashMap<String, NetworkStatus>>,
}

impl SessionBoard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a new status for a network, replacing the previous one.
    pub fn publish(
        &self,
        network_name: &str,
        phase: NetworkPhase,
        session: Option<OverlaySession>,
        last_error: Option<String>,
    ) {
        if let Some(prev) = self.networks.get(network_name).map(|s| s.phase) {
            if prev != phase && !prev.can_transition_to(phase) {
                tracing::warn!(
                    network = network_name,
                    from = ?prev,
                    to = ?phase,
                    "Unexpected network phase transition"
                );
            }
        }
        let session = if phase.has_session() { session } else { None };
        self.networks.insert(
            network_name.to_string(),
            NetworkStatus {
                network_name: network_name.to_string(),
                phase,
                session,
                last_error,
                updated_at: Utc::now(),
            },
        );
    }

    /// Forget a network (it reached `Absent`).
    pub fn remove(&self, network_name: &str) {
        self.networks.remove(network_name);
    }

    pub fn get(&self, network_name: &str) -> Option<NetworkStatus> {
        self.networks.get(network_name).map(|s| s.clone())
    }

    pub fn phase(&self, network_name: &str) -> Option<NetworkPhase> {
        self.networks.get(network_name).map(|s| s.phase)
    }

    /// All statuses, sorted by network name.
    pub fn snapshot(&self) -> Vec<NetworkStatus> {
        let mut all: Vec<NetworkStatus> = self.networks.iter().map(|e| e.value().clone()).collect();
        all.sort_by(|a, b| a.network_name.cmp(&b.network_name));
        all
    }

    /// Live sessions, sorted by network name.
    pub fn sessions(&self) -> Vec<OverlaySession> {
        self.snapshot()
            .into_iter()
            .filter_map(|s| s.session)
            .collect()
    }

    /// The earliest-joined live session (ties broken by network name).
    pub fn primary_session(&self) -> Option<OverlaySession> {
        self.sessions()
            .into_iter()
            .min_by(|a, b| {
                a.joined_at
                    .cmp(&b.joined_at)
                    .then_with(|| a.network_name.cmp(&b.network_name))
            })
    }

    /// Whether any other network currently holds `addr`.
    pub fn address_in_use(&self, addr: std::net::Ipv4Addr, except_network: &str) -> bool {
        self.networks.iter().any(|e| {
            e.key() != except_network
                && e.value()
                    .session
                    .as_ref()
                    .map(|s| s.virtual_ipv4.addr == addr)
                    .unwrap_or(false)
        })
    }

    pub fn any_unhealthy(&self) -> bool {
        self.networks
            .iter()
            .any(|e| matches!(e.value().phase, NetworkPhase::Degraded | NetworkPhase::Failed))
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
