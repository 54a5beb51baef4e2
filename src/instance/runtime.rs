// Instance runtime — the task that drives one instance.
//
// register → subscribe → feed membership snapshots to the reconciler until
// the instance is stopped or the control server revokes it.

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::control::{ControlClient, ControlEvent};
use crate::error::AgentError;
use crate::membership::{MembershipReconciler, MembershipUpdate};
use crate::overlay::SessionManager;

/// Where an instance stands with its control server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlState {
    /// Registration in progress
    Starting,
    Connected,
    /// Transport lost, sessions kept
    Reconnecting,
    /// Unreachable past the grace period, sessions torn down
    Unreachable,
    /// Credentials rejected; the instance is finished and may be restarted
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlStatus {
    pub state: ControlState,
    pub last_error: Option<String>,
}

impl ControlStatus {
    pub fn new(state: ControlState) -> Self {
        Self {
            state,
            last_error: None,
        }
    }

    fn with_error(state: ControlState, error: &AgentError) -> Self {
        Self {
            state,
            last_error: Some(error.to_string()),
        }
    }
}

pub(crate) struct InstanceRuntime {
    pub name: String,
    pub client: ControlClient,
    pub manager: SessionManager,
    pub status: watch::Sender<ControlStatus>,
    pub cancel: CancellationToken,
}

impl InstanceRuntime {
    pub(crate) async fn run(self) {
        let InstanceRuntime {
            name,
            client,
            manager,
            status,
            cancel,
        } = self;

        status.send_replace(ControlStatus::new(ControlState::Starting));
        let (channel, registration) = match client.register_with_retry(&cancel).await {
            Ok(registered) => registered,
            Err(AgentError::Cancelled) => {
                status.send_replace(ControlStatus::new(ControlState::Stopped));
                return;
            }
            Err(e) => {
                tracing::error!(instance = %name, error = %e, "Instance failed to register");
                status.send_replace(ControlStatus::with_error(ControlState::Failed, &e));
                return;
            }
        };
        status.send_replace(ControlStatus::new(ControlState::Connected));

        let board = manager.board().clone();
        let mut subscription = client.subscribe(channel, registration, board, cancel.child_token());
        let mut reconciler = MembershipReconciler::new(manager);
        let mut failure: Option<AgentError> = None;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = subscription.events.recv() => event,
            };
            match event {
                Some(ControlEvent::Update(update)) => {
                    if let Err(e) = reconciler.apply(update).await {
                        tracing::warn!(instance = %name, error = %e, "Rejected membership update");
                    }
                }
                Some(ControlEvent::Disconnected(e)) => {
                    status.send_replace(ControlStatus::with_error(ControlState::Reconnecting, &e));
                }
                Some(ControlEvent::Reconnected) => {
                    tracing::info!(instance = %name, "Control channel restored");
                    status.send_replace(ControlStatus::new(ControlState::Connected));
                }
                Some(ControlEvent::GraceExpired) => {
                    if let Err(e) = reconciler.apply(MembershipUpdate::empty()).await {
                        tracing::warn!(instance = %name, error = %e, "Failed to tear down sessions");
                    }
                    status.send_modify(|s| s.state = ControlState::Unreachable);
                }
                Some(ControlEvent::Fatal(e)) => {
                    tracing::error!(instance = %name, error = %e, "Instance revoked by control server");
                    failure = Some(e);
                    break;
                }
                None => break,
            }
        }

        // Failed is only published once every network has been left, so a
        // host restarting the instance never overlaps the old sessions.
        reconciler.shutdown().await;
        subscription.task.abort();
        match failure {
            Some(e) => {
                status.send_replace(ControlStatus::with_error(ControlState::Failed, &e));
            }
            None => status.send_modify(|s| s.state = ControlState::Stopped),
        }
        tracing::info!(instance = %name, "Instance stopped");
    }
}
