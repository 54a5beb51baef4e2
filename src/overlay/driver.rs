// Overlay driver — the seam between session lifecycle and actual peer links.
//
// The session manager decides when to join, probe, rejoin and leave. A driver
// knows how to reach peers and relays and negotiate a virtual address. The
// transport cryptography itself lives behind this trait.

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::session::PeerState;
use crate::error::Result;
use crate::membership::{NetworkMembership, PeerEndpoint, VirtualIpv4};
use crate::node::LocalNode;

/// Everything a driver needs to negotiate membership of one network.
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub network_name: String,
    /// Hex SHA-256 of `network_name:secret`; the secret never leaves the device
    pub secret_digest: String,
    /// Direct peers first, then relays
    pub endpoints: Vec<PeerEndpoint>,
    /// Address to ask for: the server-assigned one, or the previous lease on rejoin
    pub requested_ipv4: Option<VirtualIpv4>,
    /// The requested address was assigned by the control server and must be granted as-is
    pub static_ipv4: bool,
    pub local: LocalNode,
}

impl JoinRequest {
    pub fn for_membership(
        membership: &NetworkMembership,
        local: &LocalNode,
        previous_lease: Option<VirtualIpv4>,
    ) -> Self {
        let static_ipv4 = membership.assigned_virtual_ipv4.is_some();
        Self {
            network_name: membership.network_name.clone(),
            secret_digest: secret_digest(
                &membership.network_name,
                membership.join.secret().expose(),
            ),
            endpoints: membership.join.endpoints(),
            requested_ipv4: membership.assigned_virtual_ipv4.or(previous_lease),
            static_ipv4,
            local: local.clone(),
        }
    }
}

/// Digest proving knowledge of the network secret.
pub fn secret_digest(network_name: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(network_name.as_bytes());
    hasher.update(b":");
    hasher.update(secret.as_bytes());
    hasher
        .finalize()
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect()
}

/// An established link into an overlay network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OverlayLink {
    /// Driver-side handle for the underlying connections
    pub id: Uuid,
    pub network_name: String,
    pub virtual_ipv4: VirtualIpv4,
    pub peers: Vec<PeerState>,
}

#[async_trait]
pub trait OverlayDriver: Send + Sync {
    /// Reach a peer or relay and negotiate a virtual address.
    ///
    /// Errors: `Join` (rejected), `AddressConflict`, `Timeout`/`Network`
    /// (nobody reachable; retried by the caller).
    async fn establish(&self, request: &JoinRequest) -> Result<OverlayLink>;

    /// Check the link is still alive.
    async fn probe(&self, link: &OverlayLink) -> Result<()>;

    /// Tear the link down. Must release local resources even when peers are
    /// unreachable; notifying them is best effort.
    async fn release(&self, link: &OverlayLink);
}
