// TCP overlay driver
//
// Speaks the NDJSON link protocol to `tcp://` peers and relays:
//
//   agent -> peer   {"type":"hello", network_name, machine_id, ..., secret_digest, requested_ipv4?}
//   peer  -> agent  {"type":"welcome", virtual_ipv4, peer_id?}
//                 | {"type":"denied", reason}
//                 | {"type":"conflict", address}
//   agent -> peer   {"type":"ping", seq}   peer -> agent {"type":"pong", seq}
//   agent -> peer   {"type":"bye"}
//
// Endpoints are tried in order; the first welcome wins.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{timeout, Instant};
use uuid::Uuid;

use super::driver::{JoinRequest, OverlayDriver, OverlayLink};
use super::session::{PeerLinkState, PeerState};
use crate::config::OverlaySettings;
use crate::error::{AgentError, Result};
use crate::membership::{PeerScheme, VirtualIpv4};
use crate::wire::NdjsonConn;

/// Frames of the overlay link protocol (both directions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LinkFrame {
    Hello {
        network_name: String,
        machine_id: Uuid,
        hostname: String,
        agent_version: String,
        secret_digest: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        requested_ipv4: Option<VirtualIpv4>,
    },
    Welcome {
        virtual_ipv4: VirtualIpv4,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    Denied {
        reason: String,
    },
    Conflict {
        address: Ipv4Addr,
    },
    Ping {
        seq: u64,
    },
    Pong {
        seq: u64,
    },
    Bye,
}

struct LinkConn {
    conn: NdjsonConn,
    seq: u64,
}

/// Overlay driver backed by plain TCP links.
pub struct TcpOverlayDriver {
    links: DashMap<Uuid, Arc<Mutex<LinkConn>>>,
    io_timeout: Duration,
    release_timeout: Duration,
}

impl TcpOverlayDriver {
    pub fn new(settings: &OverlaySettings) -> Self {
        Self {
            links: DashMap::new(),
            io_timeout: settings.probe_timeout(),
            release_timeout: settings.release_timeout(),
        }
    }

    /// Number of open links (for status and tests).
    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    async fn handshake(
        &self,
        request: &JoinRequest,
        addr: &str,
    ) -> Result<(NdjsonConn, VirtualIpv4, Option<String>)> {
        let mut conn = NdjsonConn::connect(addr, self.io_timeout).await?;
        let hello = LinkFrame::Hello {
            network_name: request.network_name.clone(),
            machine_id: request.local.machine_id,
            hostname: request.local.hostname.clone(),
            agent_version: request.local.agent_version.clone(),
            secret_digest: request.secret_digest.clone(),
            requested_ipv4: request.requested_ipv4,
        };
        match conn.request(&hello, self.io_timeout).await? {
            LinkFrame::Welcome {
                virtual_ipv4,
                peer_id,
            } => Ok((conn, virtual_ipv4, peer_id)),
            LinkFrame::Denied { reason } => Err(AgentError::Join {
                network: request.network_name.clone(),
                reason,
            }),
            LinkFrame::Conflict { address } => Err(AgentError::AddressConflict {
                network: request.network_name.clone(),
                address,
            }),
            other => Err(AgentError::Protocol(format!(
                "unexpected reply to hello from {}: {:?}",
                addr, other
            ))),
        }
    }

    fn link(&self, link: &OverlayLink) -> Result<Arc<Mutex<LinkConn>>> {
        self.links
            .get(&link.id)
            .map(|l| l.value().clone())
            .ok_or_else(|| AgentError::Network(format!("link for '{}' is closed", link.network_name)))
    }
}

#[async_trait]
impl OverlayDriver for TcpOverlayDriver {
    async fn establish(&self, request: &JoinRequest) -> Result<OverlayLink> {
        let mut peers: Vec<PeerState> = request
            .endpoints
            .iter()
            .map(|e| PeerState {
                endpoint: e.clone(),
                state: PeerLinkState::NotTried,
                peer_id: None,
            })
            .collect();
        let mut rejection: Option<AgentError> = None;
        let mut last_transient: Option<AgentError> = None;

        for idx in 0..peers.len() {
            let endpoint = peers[idx].endpoint.clone();
            if endpoint.scheme != PeerScheme::Tcp {
                peers[idx].state = PeerLinkState::Unsupported;
                continue;
            }
            let addr = endpoint.authority();
            match self.handshake(request, &addr).await {
                Ok((conn, virtual_ipv4, peer_id)) => {
                    if let Some(wanted) = request.requested_ipv4.filter(|_| request.static_ipv4) {
                        if wanted.addr != virtual_ipv4.addr {
                            return Err(AgentError::AddressConflict {
                                network: request.network_name.clone(),
                                address: wanted.addr,
                            });
                        }
                    }
                    peers[idx].state = PeerLinkState::Connected;
                    peers[idx].peer_id = peer_id;

                    let id = Uuid::new_v4();
                    self.links
                        .insert(id, Arc::new(Mutex::new(LinkConn { conn, seq: 0 })));
                    tracing::debug!(
                        network = %request.network_name,
                        peer = %endpoint,
                        address = %virtual_ipv4,
                        "Overlay link established"
                    );
                    return Ok(OverlayLink {
                        id,
                        network_name: request.network_name.clone(),
                        virtual_ipv4,
                        peers,
                    });
                }
                Err(e @ AgentError::AddressConflict { .. }) => return Err(e),
                Err(e @ AgentError::Join { .. }) => {
                    tracing::warn!(network = %request.network_name, peer = %endpoint, error = %e, "Peer rejected join");
                    peers[idx].state = PeerLinkState::Rejected;
                    rejection = Some(e);
                }
                Err(e) => {
                    tracing::debug!(network = %request.network_name, peer = %endpoint, error = %e, "Peer unreachable");
                    peers[idx].state = PeerLinkState::Unreachable;
                    last_transient = Some(e);
                }
            }
        }

        if let Some(e) = rejection {
            return Err(e);
        }
        Err(match last_transient {
            Some(e) => AgentError::Timeout(format!(
                "no peer reachable for '{}' (last error: {})",
                request.network_name, e
            )),
            None => AgentError::Join {
                network: request.network_name.clone(),
                reason: "no endpoint with a supported transport".into(),
            },
        })
    }

    async fn probe(&self, link: &OverlayLink) -> Result<()> {
        let conn = self.link(link)?;
        let mut guard = conn.lock().await;
        guard.seq += 1;
        let seq = guard.seq;
        guard.conn.send(&LinkFrame::Ping { seq }).await?;

        // Pongs for earlier pings that timed out may still be queued ahead
        // of ours.
        let deadline = Instant::now() + self.io_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match guard.conn.recv::<LinkFrame>(remaining).await? {
                LinkFrame::Pong { seq: got } if got == seq => return Ok(()),
                LinkFrame::Pong { seq: got } if got < seq => {
                    tracing::trace!(network = %link.network_name, stale = got, seq, "Discarding late pong");
                }
                other => {
                    return Err(AgentError::Protocol(format!(
                        "unexpected probe reply: {:?}",
                        other
                    )))
                }
            }
        }
    }

    async fn release(&self, link: &OverlayLink) {
        let Some((_, conn)) = self.links.remove(&link.id) else {
            return;
        };
        let mut guard = conn.lock().await;
        if timeout(self.release_timeout, guard.conn.send(&LinkFrame::Bye))
            .await
            .is_err()
        {
            tracing::debug!(network = %link.network_name, "Peer did not accept bye in time");
        }
    }
}
