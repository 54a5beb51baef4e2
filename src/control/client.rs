// Control client
//
// Registers the device, then keeps a heartbeat loop running in the
// background. Each heartbeat reply is a full desired-membership snapshot and
// is forwarded as a `ControlEvent::Update` when it differs from the last one.
// Transport failures reconnect with jittered exponential backoff; sessions are
// left alone until the server has been unreachable for the grace period.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::endpoint::ControlEndpoint;
use super::protocol::{HeartbeatRequest, RegisterRequest, RegistrationResult, RunningNetwork};
use super::transport::{ControlChannel, ControlConnector};
use crate::config::constants::CONTROL_EVENT_CAPACITY;
use crate::config::ControlSettings;
use crate::error::{AgentError, Result};
use crate::membership::{MembershipUpdate, NetworkMembership};
use crate::node::{Identity, LocalNode};
use crate::overlay::SessionBoard;
use crate::retry::{sleep_or_cancel, Backoff};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlEvent {
    /// New desired membership set (already validated)
    Update(MembershipUpdate),
    /// Transport lost; sessions are kept, reconnecting
    Disconnected(AgentError),
    /// Heartbeats answered again after a disconnect
    Reconnected,
    /// Unreachable for longer than the grace period
    GraceExpired,
    /// Credentials rejected; the subscription has ended
    Fatal(AgentError),
}

/// Running heartbeat loop.
pub struct Subscription {
    pub events: mpsc::Receiver<ControlEvent>,
    pub task: JoinHandle<()>,
}

#[derive(Clone)]
pub struct ControlClient {
    connector: Arc<dyn ControlConnector>,
    endpoint: ControlEndpoint,
    identity: Identity,
    local: LocalNode,
    settings: ControlSettings,
}

impl ControlClient {
    pub fn new(
        connector: Arc<dyn ControlConnector>,
        endpoint: ControlEndpoint,
        identity: Identity,
        local: LocalNode,
        settings: ControlSettings,
    ) -> Self {
        Self {
            connector,
            endpoint,
            identity,
            local,
            settings,
        }
    }

    pub fn endpoint(&self) -> &ControlEndpoint {
        &self.endpoint
    }

    fn register_request(&self) -> RegisterRequest {
        RegisterRequest {
            organization_id: self.identity.organization_id.clone(),
            machine_id: self.identity.machine_id,
            hostname: self.local.hostname.clone(),
            agent_version: self.local.agent_version.clone(),
        }
    }

    fn heartbeat_request(&self, board: &SessionBoard) -> HeartbeatRequest {
        HeartbeatRequest {
            organization_id: self.identity.organization_id.clone(),
            machine_id: self.identity.machine_id,
            hostname: self.local.hostname.clone(),
            agent_version: self.local.agent_version.clone(),
            running_networks: board.snapshot().iter().map(RunningNetwork::from).collect(),
            sent_at: chrono::Utc::now(),
        }
    }

    /// Connect and register once.
    pub async fn register(&self) -> Result<(Box<dyn ControlChannel>, RegistrationResult)> {
        let mut channel = self.connector.connect(&self.endpoint).await?;
        let result = channel.register(&self.register_request()).await?;
        tracing::info!(
            server = %self.endpoint,
            machine_id = %self.identity.short_id(),
            session = %result.session_id,
            "Registered with control server"
        );
        Ok((channel, result))
    }

    /// Register, retrying transient failures with backoff until it succeeds,
    /// credentials are rejected, or `cancel` fires.
    pub async fn register_with_retry(
        &self,
        cancel: &CancellationToken,
    ) -> Result<(Box<dyn ControlChannel>, RegistrationResult)> {
        let mut backoff = Backoff::new(self.settings.backoff_base(), self.settings.backoff_cap());
        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                res = self.register() => res,
            };
            match attempt {
                Ok(registered) => return Ok(registered),
                Err(e) if !e.is_transient() => {
                    tracing::error!(server = %self.endpoint, error = %e, "Registration refused");
                    return Err(e);
                }
                Err(e) => {
                    let delay = backoff.next_delay();
                    tracing::warn!(
                        server = %self.endpoint,
                        attempt = backoff.attempt(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Registration failed, retrying"
                    );
                    sleep_or_cancel(delay, cancel).await?;
                }
            }
        }
    }

    /// Start the background heartbeat loop on an already registered channel.
    pub fn subscribe(
        self,
        channel: Box<dyn ControlChannel>,
        registration: RegistrationResult,
        board: SessionBoard,
        cancel: CancellationToken,
    ) -> Subscription {
        let (tx, events) = mpsc::channel(CONTROL_EVENT_CAPACITY);
        let interval = heartbeat_interval(&self.settings, &registration);
        let backoff = Backoff::new(self.settings.backoff_base(), self.settings.backoff_cap());
        let worker = HeartbeatLoop {
            client: self,
            board,
            tx,
            cancel,
            interval,
            backoff,
            disconnected_since: None,
            grace_expired: false,
            last_forwarded: None,
        };
        let task = tokio::spawn(worker.run(channel));
        Subscription { events, task }
    }
}

fn heartbeat_interval(settings: &ControlSettings, registration: &RegistrationResult) -> Duration {
    registration
        .heartbeat_interval_ms
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
        .unwrap_or_else(|| settings.heartbeat_interval())
}

struct HeartbeatLoop {
    client: ControlClient,
    board: SessionBoard,
    tx: mpsc::Sender<ControlEvent>,
    cancel: CancellationToken,
    interval: Duration,
    backoff: Backoff,
    disconnected_since: Option<Instant>,
    grace_expired: bool,
    last_forwarded: Option<Vec<NetworkMembership>>,
}

impl HeartbeatLoop {
    async fn run(mut self, channel: Box<dyn ControlChannel>) {
        let mut channel = Some(channel);
        loop {
            let next = match channel.take() {
                Some(ch) => self.heartbeat(ch).await,
                None => self.reconnect().await,
            };
            match next {
                Ok(ch) => channel = ch,
                Err(_) => break,
            }
        }
        tracing::debug!(server = %self.client.endpoint, "Heartbeat loop stopped");
    }

    /// Emit an event; `Err` when nobody is listening any more.
    async fn emit(&self, event: ControlEvent) -> Result<()> {
        self.tx.send(event).await.map_err(|_| AgentError::Cancelled)
    }

    /// One heartbeat round on a live channel. Returns the channel to keep
    /// using, `None` to reconnect, or `Err` to stop.
    async fn heartbeat(
        &mut self,
        mut channel: Box<dyn ControlChannel>,
    ) -> Result<Option<Box<dyn ControlChannel>>> {
        let request = self.client.heartbeat_request(&self.board);
        let reply = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            res = channel.heartbeat(&request) => res,
        };
        let reply = reply.and_then(|update| update.validate().map(|_| update));

        match reply {
            Ok(update) => {
                if self.disconnected_since.take().is_some() {
                    self.grace_expired = false;
                    self.emit(ControlEvent::Reconnected).await?;
                }
                self.backoff.reset();
                if self.last_forwarded.as_ref() != Some(&update.memberships) {
                    self.last_forwarded = Some(update.memberships.clone());
                    self.emit(ControlEvent::Update(update)).await?;
                }
                sleep_or_cancel(self.interval, &self.cancel).await?;
                Ok(Some(channel))
            }
            Err(e @ AgentError::Auth(_)) => {
                tracing::error!(server = %self.client.endpoint, error = %e, "Control server revoked device");
                self.emit(ControlEvent::Fatal(e)).await?;
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                if self.disconnected_since.is_none() {
                    tracing::warn!(server = %self.client.endpoint, error = %e, "Control channel lost");
                    self.disconnected_since = Some(Instant::now());
                    self.grace_expired = false;
                    self.emit(ControlEvent::Disconnected(e.clone())).await?;
                }
                self.back_off(&e, "Heartbeat failed").await?;
                Ok(None)
            }
        }
    }

    /// One reconnect attempt, sleeping out the backoff on failure. The
    /// backoff is only reset once a heartbeat on the new channel succeeds.
    async fn reconnect(&mut self) -> Result<Option<Box<dyn ControlChannel>>> {
        let attempt = tokio::select! {
            _ = self.cancel.cancelled() => return Err(AgentError::Cancelled),
            res = self.client.register() => res,
        };
        match attempt {
            Ok((channel, registration)) => {
                self.interval = heartbeat_interval(&self.client.settings, &registration);
                Ok(Some(channel))
            }
            Err(e) if !e.is_transient() => {
                tracing::error!(server = %self.client.endpoint, error = %e, "Re-registration refused");
                self.emit(ControlEvent::Fatal(e)).await?;
                Err(AgentError::Cancelled)
            }
            Err(e) => {
                self.back_off(&e, "Reconnect failed").await?;
                Ok(None)
            }
        }
    }

    /// Sleep out the next backoff delay, never past the end of the grace
    /// period, and report grace expiry on either side of the sleep.
    async fn back_off(&mut self, error: &AgentError, what: &str) -> Result<()> {
        self.check_grace().await?;
        let mut delay = self.backoff.next_delay();
        if let Some(remaining) = self.grace_remaining() {
            delay = delay.min(remaining.max(Duration::from_millis(1)));
        }
        tracing::debug!(
            server = %self.client.endpoint,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "{}", what
        );
        sleep_or_cancel(delay, &self.cancel).await?;
        self.check_grace().await
    }

    /// Time left before the grace period runs out, while it is still running.
    fn grace_remaining(&self) -> Option<Duration> {
        if self.grace_expired {
            return None;
        }
        let since = self.disconnected_since?;
        Some(self.client.settings.grace_period().saturating_sub(since.elapsed()))
    }

    async fn check_grace(&mut self) -> Result<()> {
        let since = *self.disconnected_since.get_or_insert_with(Instant::now);
        if self.grace_expired || since.elapsed() < self.client.settings.grace_period() {
            return Ok(());
        }
        self.grace_expired = true;
        self.last_forwarded = None;
        tracing::warn!(
            server = %self.client.endpoint,
            grace_secs = self.client.settings.grace_period().as_secs(),
            "Control server unreachable past grace period"
        );
        self.emit(ControlEvent::GraceExpired).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct FailingConnector {
        error: AgentError,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ControlConnector for FailingConnector {
        async fn connect(&self, _endpoint: &ControlEndpoint) -> Result<Box<dyn ControlChannel>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    /// Registers fine, then fails every heartbeat.
    struct BrokenHeartbeatConnector {
        connects: Arc<AtomicUsize>,
    }

    struct BrokenHeartbeatChannel;

    #[async_trait]
    impl ControlChannel for BrokenHeartbeatChannel {
        async fn register(&mut self, _request: &RegisterRequest) -> Result<RegistrationResult> {
            Ok(registration())
        }

        async fn heartbeat(&mut self, _request: &HeartbeatRequest) -> Result<MembershipUpdate> {
            Err(AgentError::Protocol("malformed snapshot".into()))
        }
    }

    #[async_trait]
    impl ControlConnector for BrokenHeartbeatConnector {
        async fn connect(&self, _endpoint: &ControlEndpoint) -> Result<Box<dyn ControlChannel>> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            Ok(Box::new(BrokenHeartbeatChannel))
        }
    }

    fn registration() -> RegistrationResult {
        RegistrationResult {
            session_id: "s".into(),
            server_version: None,
            heartbeat_interval_ms: None,
        }
    }

    fn client(connector: Arc<dyn ControlConnector>) -> ControlClient {
        let settings = ControlSettings {
            backoff_base_ms: 5,
            backoff_cap_ms: 20,
            ..Default::default()
        };
        ControlClient::new(
            connector,
            ControlEndpoint::parse("tcp://127.0.0.1:1/org").unwrap(),
            Identity::new("org", Uuid::new_v4()),
            LocalNode::new(Uuid::new_v4(), Some("test".into())),
            settings,
        )
    }

    #[test]
    fn test_server_interval_overrides_local() {
        let settings = ControlSettings::default();
        let mut reg = RegistrationResult {
            session_id: "s".into(),
            server_version: None,
            heartbeat_interval_ms: Some(250),
        };
        assert_eq!(heartbeat_interval(&settings, &reg), Duration::from_millis(250));
        reg.heartbeat_interval_ms = Some(0);
        assert_eq!(heartbeat_interval(&settings, &reg), settings.heartbeat_interval());
    }

    #[tokio::test]
    async fn test_register_auth_failure_is_not_retried() {
        let connector = Arc::new(FailingConnector {
            error: AgentError::Auth("bad org".into()),
            calls: AtomicUsize::new(0),
        });
        let err = client(connector.clone())
            .register_with_retry(&CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, AgentError::Auth(_)));
        assert_eq!(connector.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_register_retries_until_cancelled() {
        let connector = Arc::new(FailingConnector {
            error: AgentError::Network("refused".into()),
            calls: AtomicUsize::new(0),
        });
        let cancel = CancellationToken::new();
        let c = client(connector.clone());
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { c.register_with_retry(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err, AgentError::Cancelled);
        assert!(connector.calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_failing_heartbeat_after_reregister_backs_off() {
        let connects = Arc::new(AtomicUsize::new(0));
        let connector = Arc::new(BrokenHeartbeatConnector {
            connects: connects.clone(),
        });
        let settings = ControlSettings {
            backoff_base_ms: 100,
            backoff_cap_ms: 400,
            ..Default::default()
        };
        let client = ControlClient::new(
            connector,
            ControlEndpoint::parse("tcp://127.0.0.1:1/org").unwrap(),
            Identity::new("org", Uuid::new_v4()),
            LocalNode::new(Uuid::new_v4(), Some("test".into())),
            settings,
        );
        let cancel = CancellationToken::new();
        let mut sub = client.subscribe(
            Box::new(BrokenHeartbeatChannel),
            registration(),
            SessionBoard::new(),
            cancel.clone(),
        );

        let mut events = Vec::new();
        let deadline = tokio::time::sleep(Duration::from_millis(500));
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => break,
                Some(event) = sub.events.recv() => events.push(event),
            }
        }
        cancel.cancel();
        let _ = sub.task.await;

        // Shortest jittered delays are 50, 100, 200, 200ms: at most three
        // reconnects fit into 500ms.
        let reconnects = connects.load(Ordering::SeqCst);
        assert!(reconnects >= 1, "never reconnected");
        assert!(reconnects <= 4, "reconnected {} times in 500ms", reconnects);

        let disconnects = events
            .iter()
            .filter(|e| matches!(e, ControlEvent::Disconnected(_)))
            .count();
        assert_eq!(disconnects, 1);
        assert!(!events.contains(&ControlEvent::Reconnected));
    }
}
