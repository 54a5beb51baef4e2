// Per-network supervisor task
//
// One task per network name processes join/leave commands strictly in order
// and runs the periodic health check for the session it holds. Because every
// operation for a network goes through its task, joins and leaves for the
// same network never overlap, while different networks proceed concurrently.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::manager::{ActiveSession, SessionManager};
use super::session::{HealthStatus, NetworkPhase};
use crate::config::constants::NETWORK_COMMAND_CAPACITY;
use crate::error::Result;
use crate::membership::NetworkMembership;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkCommand {
    Join(NetworkMembership),
    Leave,
}

/// Handle to a running network supervisor.
pub struct NetworkHandle {
    network_name: String,
    tx: mpsc::Sender<NetworkCommand>,
    task: JoinHandle<()>,
}

impl NetworkHandle {
    pub fn network_name(&self) -> &str {
        &self.network_name
    }

    /// Queue a command. Returns false if the supervisor has already exited.
    pub async fn send(&self, command: NetworkCommand) -> bool {
        self.tx.send(command).await.is_ok()
    }

    /// Close the command queue. The supervisor drains what is queued, leaves
    /// the network and exits; the returned handle resolves when it has.
    pub fn retire(self) -> JoinHandle<()> {
        drop(self.tx);
        self.task
    }
}

impl SessionManager {
    /// Spawn the supervisor for `network_name`.
    ///
    /// `predecessor` is the still-retiring supervisor of the same network, if
    /// any; the new one waits for it so a leave and a later join of the same
    /// network cannot interleave.
    pub fn spawn_network(
        &self,
        network_name: &str,
        predecessor: Option<JoinHandle<()>>,
    ) -> NetworkHandle {
        let (tx, rx) = mpsc::channel(NETWORK_COMMAND_CAPACITY);
        let supervisor = NetworkSupervisor {
            name: network_name.to_string(),
            manager: self.clone(),
            cancel: self.cancel_token().child_token(),
            rx,
            session: None,
            failures: 0,
        };
        let task = tokio::spawn(supervisor.run(predecessor));
        NetworkHandle {
            network_name: network_name.to_string(),
            tx,
            task,
        }
    }
}

enum JoinOutcome {
    Done(Result<ActiveSession>),
    /// Join abandoned; carries the command that superseded it, if any.
    Abandoned(Option<NetworkCommand>),
}

struct NetworkSupervisor {
    name: String,
    manager: SessionManager,
    cancel: CancellationToken,
    rx: mpsc::Receiver<NetworkCommand>,
    session: Option<ActiveSession>,
    failures: u32,
}

impl NetworkSupervisor {
    async fn run(mut self, predecessor: Option<JoinHandle<()>>) {
        if let Some(prev) = predecessor {
            tokio::select! {
                _ = prev => {}
                _ = self.cancel.cancelled() => return,
            }
        }

        let period = self.manager.settings().health_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut pending: Option<NetworkCommand> = None;
        loop {
            let command = match pending.take() {
                Some(cmd) => cmd,
                None => tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break,
                    cmd = self.rx.recv() => match cmd {
                        Some(cmd) => cmd,
                        None => break,
                    },
                    _ = ticker.tick(), if self.session.is_some() => {
                        self.check_health().await;
                        continue;
                    }
                },
            };

            match command {
                NetworkCommand::Join(membership) => {
                    pending = self.handle_join(membership, &mut ticker).await;
                }
                NetworkCommand::Leave => self.handle_leave().await,
            }
        }

        self.handle_leave().await;
        tracing::debug!(network = %self.name, "Network supervisor exited");
    }

    async fn handle_join(
        &mut self,
        membership: NetworkMembership,
        ticker: &mut Interval,
    ) -> Option<NetworkCommand> {
        if let Some(session) = &self.session {
            if session.membership() == &membership {
                return None;
            }
            tracing::info!(network = %self.name, "Join parameters changed, leaving before rejoining");
            self.handle_leave().await;
        }

        let board = self.manager.board().clone();
        board.publish(&self.name, NetworkPhase::Joining, None, None);

        let outcome = {
            let join = self.manager.join(&membership, None, &self.cancel);
            tokio::pin!(join);
            loop {
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => break JoinOutcome::Abandoned(None),
                    cmd = self.rx.recv() => match cmd {
                        Some(NetworkCommand::Join(m)) if m == membership => continue,
                        Some(cmd) => break JoinOutcome::Abandoned(Some(cmd)),
                        None => break JoinOutcome::Abandoned(None),
                    },
                    res = &mut join => break JoinOutcome::Done(res),
                }
            }
        };

        match outcome {
            JoinOutcome::Done(Ok(session)) => {
                board.publish(
                    &self.name,
                    NetworkPhase::Joined,
                    Some(session.snapshot().clone()),
                    None,
                );
                self.session = Some(session);
                self.failures = 0;
                ticker.reset();
                None
            }
            JoinOutcome::Done(Err(e)) => {
                tracing::warn!(network = %self.name, error = %e, "Failed to join overlay network");
                board.publish(&self.name, NetworkPhase::Failed, None, Some(e.to_string()));
                None
            }
            JoinOutcome::Abandoned(next) => {
                tracing::debug!(network = %self.name, "Pending join abandoned");
                board.publish(&self.name, NetworkPhase::Leaving, None, None);
                board.remove(&self.name);
                next
            }
        }
    }

    async fn handle_leave(&mut self) {
        match self.session.take() {
            Some(session) => self.manager.leave(session).await,
            None => self.manager.board().remove(&self.name),
        }
        self.failures = 0;
    }

    async fn check_health(&mut self) {
        let threshold = self.manager.settings().health_failure_threshold;
        let board = self.manager.board().clone();
        let Some(session) = self.session.as_mut() else {
            return;
        };

        let reason = match self.manager.health_check(session).await {
            HealthStatus::Healthy => {
                self.failures = 0;
                if board.phase(&self.name) == Some(NetworkPhase::Degraded) {
                    tracing::info!(network = %self.name, "Overlay session recovered");
                    board.publish(&self.name, NetworkPhase::Joined, Some(session.snapshot().clone()), None);
                }
                return;
            }
            HealthStatus::Unhealthy(reason) => reason,
        };

        self.failures += 1;
        tracing::warn!(
            network = %self.name,
            failures = self.failures,
            threshold,
            reason = %reason,
            "Health check failed"
        );
        if self.failures < threshold {
            return;
        }
        self.failures = 0;

        board.publish(
            &self.name,
            NetworkPhase::Degraded,
            Some(session.snapshot().clone()),
            Some(reason),
        );

        let manager = self.manager.clone();
        let result = tokio::select! {
            _ = self.cancel.cancelled() => return,
            res = manager.rejoin(session) => res,
        };
        match result {
            Ok(()) => {
                tracing::info!(network = %self.name, address = %session.virtual_ipv4(), "Rejoined overlay network");
                board.publish(&self.name, NetworkPhase::Joined, Some(session.snapshot().clone()), None);
            }
            Err(e) => {
                tracing::warn!(network = %self.name, error = %e, "Rejoin attempt failed");
                board.publish(
                    &self.name,
                    NetworkPhase::Degraded,
                    Some(session.snapshot().clone()),
                    Some(e.to_string()),
                );
            }
        }
    }
}
