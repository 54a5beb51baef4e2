// Instance Registry — tracks running agent instances
//
// One entry per instance name. Each instance is a tokio task (see `runtime`)
// plus the shared state the registry reads to answer status queries. The
// registry itself never blocks on network I/O: `start` returns as soon as the
// task is spawned and `stop` only waits for the task to wind down.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::runtime::{ControlState, ControlStatus, InstanceRuntime};
use crate::config::constants::STOP_TIMEOUT_SECS;
use crate::config::AgentSettings;
use crate::control::{ControlClient, ControlConnector, ControlEndpoint, DefaultConnector};
use crate::error::{AgentError, Result};
use crate::node::{get_or_create_machine_id, machine_id_from_str, Identity, LocalNode};
use crate::overlay::{NetworkStatus, OverlayDriver, SessionBoard, SessionManager, TcpOverlayDriver};

/// What a caller supplies to start an instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceConfig {
    /// `tcp://host[:port]/<org>` or `http(s)://host[:port]/<org>`
    pub config_server_url: String,
    /// Required unless the URL path carries it
    pub organization_id: Option<String>,
    /// Stable device id; the persisted identity file is used when absent
    pub machine_id: Option<String>,
    /// Overrides the OS hostname
    pub hostname: Option<String>,
}

impl InstanceConfig {
    pub fn new(config_server_url: impl Into<String>) -> Self {
        Self {
            config_server_url: config_server_url.into(),
            ..Default::default()
        }
    }

    pub fn with_organization_id(mut self, organization_id: impl Into<String>) -> Self {
        self.organization_id = Some(organization_id.into());
        self
    }

    pub fn with_machine_id(mut self, machine_id: impl Into<String>) -> Self {
        self.machine_id = Some(machine_id.into());
        self
    }

    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hostname = Some(hostname.into());
        self
    }

    /// Parse the control URL and settle the organisation id.
    pub fn resolve(&self) -> Result<(ControlEndpoint, String)> {
        let endpoint = ControlEndpoint::parse(&self.config_server_url)?;
        let org = endpoint.resolve_organization(self.organization_id.as_deref())?;
        Ok((endpoint, org))
    }
}

/// Coarse instance health as seen by a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Connected,
    Degraded,
    Stopped,
}

/// Identity of the primary session of an instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub instance_name: String,
    pub network_name: String,
    pub virtual_ipv4: String,
    pub hostname: String,
    pub version: String,
}

/// Full status of one instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceSnapshot {
    pub name: String,
    pub organization_id: String,
    pub machine_id: Uuid,
    pub control_endpoint: String,
    pub status: InstanceStatus,
    pub last_error: Option<String>,
    pub networks: Vec<NetworkStatus>,
}

struct InstanceEntry {
    identity: Identity,
    endpoint: ControlEndpoint,
    board: SessionBoard,
    control: watch::Receiver<ControlStatus>,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
    stopping: bool,
}

impl InstanceEntry {
    /// Finished on its own (rejected or ended) rather than through `stop`.
    fn is_finished(&self) -> bool {
        !self.stopping
            && matches!(
                self.control.borrow().state,
                ControlState::Failed | ControlState::Stopped
            )
    }

    fn status(&self) -> InstanceStatus {
        if self.stopping {
            return InstanceStatus::Stopped;
        }
        match self.control.borrow().state {
            ControlState::Starting => InstanceStatus::Starting,
            ControlState::Reconnecting | ControlState::Unreachable => InstanceStatus::Degraded,
            ControlState::Failed | ControlState::Stopped => InstanceStatus::Stopped,
            ControlState::Connected if self.board.any_unhealthy() => InstanceStatus::Degraded,
            ControlState::Connected => InstanceStatus::Connected,
        }
    }

    fn to_snapshot(&self, name: &str) -> InstanceSnapshot {
        InstanceSnapshot {
            name: name.to_string(),
            organization_id: self.identity.organization_id.clone(),
            machine_id: self.identity.machine_id,
            control_endpoint: self.endpoint.to_string(),
            status: self.status(),
            last_error: self.control.borrow().last_error.clone(),
            networks: self.board.snapshot(),
        }
    }
}

/// Process-wide table of instances. Cheap to clone.
#[derive(Clone)]
pub struct InstanceRegistry {
    instances: Arc<DashMap<String, InstanceEntry>>,
    settings: Arc<AgentSettings>,
    driver: Arc<dyn OverlayDriver>,
    connector: Arc<dyn ControlConnector>,
    /// Persisted machine id, read or created once per registry
    machine_id: Arc<Mutex<Option<Uuid>>>,
}

impl InstanceRegistry {
    pub fn new(
        settings: AgentSettings,
        driver: Arc<dyn OverlayDriver>,
        connector: Arc<dyn ControlConnector>,
    ) -> Self {
        Self {
            instances: Arc::new(DashMap::new()),
            settings: Arc::new(settings),
            driver,
            connector,
            machine_id: Arc::new(Mutex::new(None)),
        }
    }

    /// Registry using the built-in TCP overlay driver and control transports.
    pub fn with_defaults(settings: AgentSettings) -> Self {
        let driver = Arc::new(TcpOverlayDriver::new(&settings.overlay));
        let connector = Arc::new(DefaultConnector::new(settings.control.request_timeout()));
        Self::new(settings, driver, connector)
    }

    pub fn settings(&self) -> &AgentSettings {
        &self.settings
    }

    /// Start an instance. Returns once its task is spawned; registration and
    /// joins continue in the background.
    ///
    /// An instance that has already failed (e.g. its credentials were
    /// rejected) keeps its entry for status queries until it is stopped or
    /// started again; starting it again replaces it.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self, instance_name: &str, config: InstanceConfig) -> Result<()> {
        if instance_name.trim().is_empty() {
            return Err(AgentError::InvalidConfig("instance name is empty".into()));
        }
        if self.is_active(instance_name) {
            return Err(AgentError::DuplicateInstance(instance_name.to_string()));
        }
        self.settings.validate()?;
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| AgentError::InvalidConfig("no tokio runtime available".into()))?;

        let (endpoint, organization_id) = config.resolve()?;
        let machine_id = match config.machine_id.as_deref() {
            Some(raw) => machine_id_from_str(raw)?,
            None => self.persisted_machine_id()?,
        };
        let identity = Identity::new(organization_id, machine_id);
        let local = LocalNode::new(machine_id, config.hostname.clone());

        let slot = self.instances.entry(instance_name.to_string());
        if let Entry::Occupied(existing) = &slot {
            if !existing.get().is_finished() {
                return Err(AgentError::DuplicateInstance(instance_name.to_string()));
            }
        }

        let cancel = CancellationToken::new();
        let board = SessionBoard::new();
        let manager = SessionManager::new(
            self.driver.clone(),
            board.clone(),
            self.settings.overlay.clone(),
            local.clone(),
            cancel.child_token(),
        );
        let client = ControlClient::new(
            self.connector.clone(),
            endpoint.clone(),
            identity.clone(),
            local,
            self.settings.control.clone(),
        );
        let (status_tx, status_rx) = watch::channel(ControlStatus::new(ControlState::Starting));
        let instance = InstanceRuntime {
            name: instance_name.to_string(),
            client,
            manager,
            status: status_tx,
            cancel: cancel.clone(),
        };
        let task = runtime.spawn(instance.run());

        tracing::info!(
            instance = instance_name,
            server = %endpoint,
            organization = %identity.organization_id,
            machine_id = %identity.short_id(),
            "Instance started"
        );
        let entry = InstanceEntry {
            identity,
            endpoint,
            board,
            control: status_rx,
            cancel,
            task: Some(task),
            stopping: false,
        };
        match slot {
            Entry::Occupied(mut existing) => {
                let old = existing.insert(entry);
                old.cancel.cancel();
                if let Some(task) = old.task {
                    task.abort();
                }
                tracing::debug!(instance = instance_name, "Replaced finished instance");
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
            }
        }
        Ok(())
    }

    fn is_active(&self, instance_name: &str) -> bool {
        self.instances
            .get(instance_name)
            .map(|e| !e.is_finished())
            .unwrap_or(false)
    }

    /// The device's persisted machine id. Concurrent first starts share one
    /// read-or-create of the identity file.
    fn persisted_machine_id(&self) -> Result<Uuid> {
        let mut cached = self
            .machine_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(id) = *cached {
            return Ok(id);
        }
        let id = get_or_create_machine_id(&self.settings.identity.resolve_path()?)?;
        *cached = Some(id);
        Ok(id)
    }

    /// Stop an instance: cancel everything in flight, leave every network
    /// and remove it from the registry.
    pub async fn stop(&self, instance_name: &str) -> Result<()> {
        let (cancel, task) = {
            let mut entry = self
                .instances
                .get_mut(instance_name)
                .filter(|e| !e.stopping)
                .ok_or_else(|| AgentError::NotFound(instance_name.to_string()))?;
            entry.stopping = true;
            (entry.cancel.clone(), entry.task.take())
        };

        cancel.cancel();
        if let Some(task) = task {
            let abort = task.abort_handle();
            if tokio::time::timeout(Duration::from_secs(STOP_TIMEOUT_SECS), task)
                .await
                .is_err()
            {
                tracing::warn!(instance = instance_name, "Instance did not stop in time, aborting");
                abort.abort();
            }
        }

        self.instances.remove(instance_name);
        tracing::info!(instance = instance_name, "Instance removed");
        Ok(())
    }

    /// Snapshot of the instance's primary session, if it has one.
    pub fn get_network_info(&self, instance_name: &str) -> Option<NetworkInfo> {
        let entry = self.instances.get(instance_name)?;
        let session = entry.board.primary_session()?;
        Some(NetworkInfo {
            instance_name: instance_name.to_string(),
            network_name: session.network_name,
            virtual_ipv4: session.virtual_ipv4.addr.to_string(),
            hostname: session.hostname,
            version: session.agent_version,
        })
    }

    pub fn status(&self, instance_name: &str) -> Option<InstanceSnapshot> {
        self.instances
            .get(instance_name)
            .map(|e| e.to_snapshot(instance_name))
    }

    /// Names of all instances, sorted.
    pub fn list(&self) -> Vec<String> {
        let mut names: Vec<String> = self.instances.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Stop every instance.
    pub async fn shutdown(&self) {
        let stops = self.list().into_iter().map(|name| {
            let registry = self.clone();
            async move {
                if let Err(e) = registry.stop(&name).await {
                    tracing::debug!(instance = %name, error = %e, "Skipped during shutdown");
                }
            }
        });
        futures::future::join_all(stops).await;
    }
}
