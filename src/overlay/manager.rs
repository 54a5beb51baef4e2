// Overlay session manager
//
// Owns the join/leave/health/rejoin operations for the sessions of one
// instance. The operations themselves are stateless with respect to the
// manager: each live session is held by its network supervisor task and only
// published to the board as snapshots.

use chrono::Utc;
use std::sync::Arc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use super::driver::{JoinRequest, OverlayDriver, OverlayLink};
use super::session::{HealthStatus, NetworkPhase, OverlaySession, SessionBoard};
use crate::config::OverlaySettings;
use crate::error::{AgentError, Result};
use crate::membership::{NetworkMembership, VirtualIpv4};
use crate::node::LocalNode;
use crate::retry::{retry_transient, Backoff};

/// A joined network, owned by its supervisor task.
#[derive(Debug)]
pub struct ActiveSession {
    membership: NetworkMembership,
    link: OverlayLink,
    snapshot: OverlaySession,
}

impl ActiveSession {
    pub fn membership(&self) -> &NetworkMembership {
        &self.membership
    }

    pub fn snapshot(&self) -> &OverlaySession {
        &self.snapshot
    }

    pub fn virtual_ipv4(&self) -> VirtualIpv4 {
        self.snapshot.virtual_ipv4
    }
}

#[derive(Clone)]
pub struct SessionManager {
    driver: Arc<dyn OverlayDriver>,
    board: SessionBoard,
    settings: OverlaySettings,
    local: LocalNode,
    cancel: CancellationToken,
}

impl SessionManager {
    pub fn new(
        driver: Arc<dyn OverlayDriver>,
        board: SessionBoard,
        settings: OverlaySettings,
        local: LocalNode,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            driver,
            board,
            settings,
            local,
            cancel,
        }
    }

    pub fn board(&self) -> &SessionBoard {
        &self.board
    }

    pub fn settings(&self) -> &OverlaySettings {
        &self.settings
    }

    /// Token cancelled when the owning instance stops.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Join a network, retrying timeouts with backoff up to
    /// `max_join_attempts` (0 = forever). Rejections and address conflicts
    /// are returned immediately.
    pub async fn join(
        &self,
        membership: &NetworkMembership,
        previous_lease: Option<VirtualIpv4>,
        cancel: &CancellationToken,
    ) -> Result<ActiveSession> {
        let request = JoinRequest::for_membership(membership, &self.local, previous_lease);
        let mut backoff = Backoff::new(
            self.settings.join_backoff_base(),
            self.settings.join_backoff_cap(),
        );
        let link = retry_transient(
            &mut backoff,
            self.settings.max_join_attempts,
            "overlay join",
            cancel,
            || self.attempt(&request),
        )
        .await?;

        tracing::info!(
            network = %membership.network_name,
            address = %link.virtual_ipv4,
            "Joined overlay network"
        );
        Ok(ActiveSession {
            membership: membership.clone(),
            snapshot: self.snapshot_for(&link, Utc::now()),
            link,
        })
    }

    /// One bounded establish attempt plus local conflict detection.
    async fn attempt(&self, request: &JoinRequest) -> Result<OverlayLink> {
        let link = timeout(self.settings.join_timeout(), self.driver.establish(request))
            .await
            .map_err(|_| {
                AgentError::Timeout(format!(
                    "no peer answered for '{}' within {:?}",
                    request.network_name,
                    self.settings.join_timeout()
                ))
            })??;

        let addr = link.virtual_ipv4.addr;
        if self.board.address_in_use(addr, &request.network_name) {
            self.driver.release(&link).await;
            return Err(AgentError::AddressConflict {
                network: request.network_name.clone(),
                address: addr,
            });
        }
        Ok(link)
    }

    fn snapshot_for(&self, link: &OverlayLink, joined_at: chrono::DateTime<Utc>) -> OverlaySession {
        OverlaySession {
            network_name: link.network_name.clone(),
            virtual_ipv4: link.virtual_ipv4,
            hostname: self.local.hostname.clone(),
            agent_version: self.local.agent_version.clone(),
            peers: link.peers.clone(),
            joined_at,
        }
    }

    /// Tear a session down and release its address. Never fails: local
    /// resources are always released, the peer is told only if reachable.
    pub async fn leave(&self, session: ActiveSession) {
        let name = session.membership.network_name.clone();
        self.board.publish(&name, NetworkPhase::Leaving, None, None);
        self.driver.release(&session.link).await;
        self.board.remove(&name);
        tracing::info!(network = %name, address = %session.snapshot.virtual_ipv4, "Left overlay network");
    }

    /// Probe a session once.
    pub async fn health_check(&self, session: &ActiveSession) -> HealthStatus {
        match timeout(self.settings.probe_timeout(), self.driver.probe(&session.link)).await {
            Ok(Ok(())) => HealthStatus::Healthy,
            Ok(Err(e)) => HealthStatus::Unhealthy(e.to_string()),
            Err(_) => HealthStatus::Unhealthy("probe timed out".into()),
        }
    }

    /// A single rejoin attempt for a degraded session, asking for the same
    /// virtual address. The session keeps its identity (`joined_at`) either way.
    pub async fn rejoin(&self, session: &mut ActiveSession) -> Result<()> {
        self.driver.release(&session.link).await;
        let request = JoinRequest::for_membership(
            &session.membership,
            &self.local,
            Some(session.snapshot.virtual_ipv4),
        );
        let link = self.attempt(&request).await?;
        if link.virtual_ipv4 != session.snapshot.virtual_ipv4 {
            tracing::warn!(
                network = %session.membership.network_name,
                old = %session.snapshot.virtual_ipv4,
                new = %link.virtual_ipv4,
                "Rejoin could not keep the previous virtual address"
            );
        }
        session.snapshot = self.snapshot_for(&link, session.snapshot.joined_at);
        session.link = link;
        Ok(())
    }
}
