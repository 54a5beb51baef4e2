// Shared fixtures for integration tests: a scripted control server speaking
// the NDJSON control protocol, a relay speaking the overlay link protocol,
// and an in-memory overlay driver with call counters.

#![allow(dead_code)]

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::Instant;
use uuid::Uuid;

use overlay_agent::config::{AgentSettings, ControlSettings, OverlaySettings};
use overlay_agent::control::{
    ClientFrame, HeartbeatRequest, RegistrationResult, ServerFrame,
};
use overlay_agent::error::{AgentError, Result};
use overlay_agent::membership::{
    JoinParameters, MembershipUpdate, NetworkMembership, NetworkSecret, PeerEndpoint,
};
use overlay_agent::overlay::{
    JoinRequest, LinkFrame, OverlayDriver, OverlayLink, PeerLinkState, PeerState,
};
use overlay_agent::wire::NdjsonConn;

/// Settings with millisecond-scale timers.
pub fn fast_settings() -> AgentSettings {
    AgentSettings {
        control: ControlSettings {
            backoff_base_ms: 10,
            backoff_cap_ms: 50,
            grace_period_secs: 300,
            heartbeat_interval_ms: 20,
            request_timeout_ms: 1_000,
        },
        overlay: OverlaySettings {
            join_timeout_secs: 2,
            max_join_attempts: 0,
            join_backoff_base_ms: 10,
            join_backoff_cap_ms: 50,
            health_interval_ms: 30,
            health_failure_threshold: 3,
            probe_timeout_ms: 500,
            release_timeout_ms: 100,
        },
        ..AgentSettings::default()
    }
}

pub fn membership(name: &str, secret: &str, peer: &str) -> NetworkMembership {
    NetworkMembership {
        network_name: name.to_string(),
        join: JoinParameters::V1 {
            network_secret: NetworkSecret::new(secret),
            peers: vec![peer.parse().unwrap()],
            relays: vec![],
        },
        assigned_virtual_ipv4: None,
    }
}

/// Poll `cond` every 10ms until it holds or `within` elapses.
pub async fn wait_until<F: FnMut() -> bool>(within: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + within;
    loop {
        if cond() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Control server
// ---------------------------------------------------------------------------

#[derive(Default)]
struct ControlState {
    update: Mutex<MembershipUpdate>,
    allowed_orgs: Mutex<Option<HashSet<String>>>,
    offline: AtomicBool,
    generation: AtomicU64,
    registrations: AtomicUsize,
    heartbeats: AtomicUsize,
    last_heartbeat: Mutex<Option<HeartbeatRequest>>,
}

impl ControlState {
    fn org_allowed(&self, org: &str) -> bool {
        match &*self.allowed_orgs.lock().unwrap() {
            Some(allowed) => allowed.contains(org),
            None => true,
        }
    }

    fn reply(&self, frame: ClientFrame) -> ServerFrame {
        match frame {
            ClientFrame::Register(req) => {
                if !self.org_allowed(&req.organization_id) {
                    return ServerFrame::Rejected {
                        reason: format!("unknown organization '{}'", req.organization_id),
                    };
                }
                let n = self.registrations.fetch_add(1, Ordering::SeqCst) + 1;
                ServerFrame::Registered(RegistrationResult {
                    session_id: format!("session-{}", n),
                    server_version: Some("mock".into()),
                    heartbeat_interval_ms: None,
                })
            }
            ClientFrame::Heartbeat(req) => {
                if !self.org_allowed(&req.organization_id) {
                    return ServerFrame::Rejected {
                        reason: "device revoked".into(),
                    };
                }
                self.heartbeats.fetch_add(1, Ordering::SeqCst);
                *self.last_heartbeat.lock().unwrap() = Some(req);
                ServerFrame::Memberships(self.update.lock().unwrap().clone())
            }
        }
    }
}

/// Control server that answers every heartbeat with the configured snapshot.
pub struct MockControlServer {
    addr: SocketAddr,
    state: Arc<ControlState>,
}

impl MockControlServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(ControlState::default());
        let accept_state = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                if accept_state.offline.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let generation = state.generation.load(Ordering::SeqCst);
                    let mut conn = NdjsonConn::from_stream(stream, peer.to_string());
                    loop {
                        let frame = tokio::select! {
                            frame = conn.recv_opt::<ClientFrame>() => frame,
                            _ = tokio::time::sleep(Duration::from_millis(10)) => {
                                if state.generation.load(Ordering::SeqCst) != generation
                                    || state.offline.load(Ordering::SeqCst)
                                {
                                    break;
                                }
                                continue;
                            }
                        };
                        let Ok(Some(frame)) = frame else { break };
                        if state.generation.load(Ordering::SeqCst) != generation
                            || state.offline.load(Ordering::SeqCst)
                        {
                            break;
                        }
                        let reply = state.reply(frame);
                        if conn.send(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self { addr, state }
    }

    pub fn url(&self, organization_id: &str) -> String {
        format!("tcp://{}/{}", self.addr, organization_id)
    }

    /// Replace the desired set (bumps the revision).
    pub fn set_memberships(&self, memberships: Vec<NetworkMembership>) {
        let mut update = self.state.update.lock().unwrap();
        update.revision += 1;
        update.memberships = memberships;
    }

    pub fn allow_only(&self, orgs: &[&str]) {
        *self.state.allowed_orgs.lock().unwrap() =
            Some(orgs.iter().map(|o| o.to_string()).collect());
    }

    /// Close every open connection; new ones are accepted.
    pub fn drop_connections(&self) {
        self.state.generation.fetch_add(1, Ordering::SeqCst);
    }

    /// While offline every connection is closed immediately.
    pub fn set_offline(&self, offline: bool) {
        self.state.offline.store(offline, Ordering::SeqCst);
    }

    pub fn registrations(&self) -> usize {
        self.state.registrations.load(Ordering::SeqCst)
    }

    pub fn heartbeats(&self) -> usize {
        self.state.heartbeats.load(Ordering::SeqCst)
    }

    pub fn last_heartbeat(&self) -> Option<HeartbeatRequest> {
        self.state.last_heartbeat.lock().unwrap().clone()
    }
}

// ---------------------------------------------------------------------------
// Overlay relay (real TCP link protocol)
// ---------------------------------------------------------------------------

/// Relay that welcomes every hello with an address from 10.144.0.0/24,
/// honouring the requested one.
pub struct MockRelay {
    addr: SocketAddr,
    hellos: Arc<AtomicUsize>,
}

impl MockRelay {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hellos = Arc::new(AtomicUsize::new(0));
        let counter = hellos.clone();
        tokio::spawn(async move {
            while let Ok((stream, peer)) = listener.accept().await {
                let counter = counter.clone();
                tokio::spawn(async move {
                    let mut conn = NdjsonConn::from_stream(stream, peer.to_string());
                    while let Ok(Some(frame)) = conn.recv_opt::<LinkFrame>().await {
                        let reply = match frame {
                            LinkFrame::Hello { requested_ipv4, .. } => {
                                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                                let virtual_ipv4 = requested_ipv4.unwrap_or_else(|| {
                                    format!("10.144.0.{}/24", 10 + n).parse().unwrap()
                                });
                                LinkFrame::Welcome {
                                    virtual_ipv4,
                                    peer_id: Some("relay".into()),
                                }
                            }
                            LinkFrame::Ping { seq } => LinkFrame::Pong { seq },
                            LinkFrame::Bye => break,
                            _ => continue,
                        };
                        if conn.send(&reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        Self { addr, hellos }
    }

    pub fn peer_uri(&self) -> String {
        format!("tcp://{}", self.addr)
    }

    pub fn hellos(&self) -> usize {
        self.hellos.load(Ordering::SeqCst)
    }
}

// ---------------------------------------------------------------------------
// Scripted overlay driver
// ---------------------------------------------------------------------------

/// In-memory driver recording every call.
#[derive(Default)]
pub struct ScriptedDriver {
    pub establish_calls: AtomicUsize,
    pub probe_calls: AtomicUsize,
    pub release_calls: AtomicUsize,
    fail_probes: AtomicBool,
    unreachable: AtomicBool,
    establish_delay_ms: AtomicU64,
    denied: Mutex<HashSet<String>>,
    next_host: AtomicUsize,
    live: DashMap<Uuid, String>,
    /// "establish:<net>" / "release:<net>" in call order
    log: Mutex<Vec<String>>,
}

impl ScriptedDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_fail_probes(&self, fail: bool) {
        self.fail_probes.store(fail, Ordering::SeqCst);
    }

    /// Every establish fails with a timeout while set.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    pub fn set_establish_delay(&self, delay: Duration) {
        self.establish_delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn deny(&self, network: &str) {
        self.denied.lock().unwrap().insert(network.to_string());
    }

    pub fn establishes(&self) -> usize {
        self.establish_calls.load(Ordering::SeqCst)
    }

    pub fn probes(&self) -> usize {
        self.probe_calls.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.release_calls.load(Ordering::SeqCst)
    }

    pub fn live_links(&self) -> usize {
        self.live.len()
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

#[async_trait]
impl OverlayDriver for ScriptedDriver {
    async fn establish(&self, request: &JoinRequest) -> Result<OverlayLink> {
        self.establish_calls.fetch_add(1, Ordering::SeqCst);
        self.log
            .lock()
            .unwrap()
            .push(format!("establish:{}", request.network_name));

        let delay = self.establish_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(AgentError::Timeout("scripted: no peer reachable".into()));
        }
        if self.denied.lock().unwrap().contains(&request.network_name) {
            return Err(AgentError::Join {
                network: request.network_name.clone(),
                reason: "scripted denial".into(),
            });
        }

        let virtual_ipv4 = match request.requested_ipv4 {
            Some(addr) => addr,
            None => {
                let n = self.next_host.fetch_add(1, Ordering::SeqCst) + 2;
                format!("10.144.0.{}/24", n).parse().unwrap()
            }
        };
        let id = Uuid::new_v4();
        self.live.insert(id, request.network_name.clone());
        Ok(OverlayLink {
            id,
            network_name: request.network_name.clone(),
            virtual_ipv4,
            peers: request
                .endpoints
                .iter()
                .map(|e: &PeerEndpoint| PeerState {
                    endpoint: e.clone(),
                    state: PeerLinkState::Connected,
                    peer_id: Some("scripted".into()),
                })
                .collect(),
        })
    }

    async fn probe(&self, _link: &OverlayLink) -> Result<()> {
        self.probe_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_probes.load(Ordering::SeqCst) {
            Err(AgentError::Network("scripted probe failure".into()))
        } else {
            Ok(())
        }
    }

    async fn release(&self, link: &OverlayLink) {
        self.release_calls.fetch_add(1, Ordering::SeqCst);
        self.live.remove(&link.id);
        self.log
            .lock()
            .unwrap()
            .push(format!("release:{}", link.network_name));
    }
}
