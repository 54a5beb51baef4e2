// Configuration structs
//
// Durations are stored as integer milliseconds/seconds so the TOML stays
// readable; accessors hand out `Duration`s.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::constants::{CONFIG_DIR_NAME, IDENTITY_FILE_NAME};
use crate::error::{AgentError, Result};

/// Top-level agent settings (`~/.overlay-agent/config.toml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AgentSettings {
    #[serde(default)]
    pub control: ControlSettings,
    #[serde(default)]
    pub overlay: OverlaySettings,
    #[serde(default)]
    pub identity: IdentitySettings,
}

/// Control-plane connection tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ControlSettings {
    /// First reconnect delay
    pub backoff_base_ms: u64,
    /// Upper bound on reconnect delay
    pub backoff_cap_ms: u64,
    /// How long the control server may stay unreachable before memberships
    /// are torn down
    pub grace_period_secs: u64,
    /// Heartbeat / poll interval (the server may override it at registration)
    pub heartbeat_interval_ms: u64,
    /// Deadline for a single request/response exchange
    pub request_timeout_ms: u64,
}

impl Default for ControlSettings {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            grace_period_secs: 300,
            heartbeat_interval_ms: 1_000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ControlSettings {
    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_secs(self.grace_period_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Overlay session tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OverlaySettings {
    /// Deadline for one join attempt (peer negotiation)
    pub join_timeout_secs: u64,
    /// 0 = retry timed-out joins forever
    pub max_join_attempts: u32,
    pub join_backoff_base_ms: u64,
    pub join_backoff_cap_ms: u64,
    /// Period between health probes of a joined session
    pub health_interval_ms: u64,
    /// Consecutive probe failures before a session is marked degraded
    pub health_failure_threshold: u32,
    pub probe_timeout_ms: u64,
    /// Bound on the courtesy "bye" sent to peers on leave
    pub release_timeout_ms: u64,
}

impl Default for OverlaySettings {
    fn default() -> Self {
        Self {
            join_timeout_secs: 30,
            max_join_attempts: 0,
            join_backoff_base_ms: 1_000,
            join_backoff_cap_ms: 30_000,
            health_interval_ms: 10_000,
            health_failure_threshold: 3,
            probe_timeout_ms: 5_000,
            release_timeout_ms: 2_000,
        }
    }
}

impl OverlaySettings {
    pub fn join_timeout(&self) -> Duration {
        Duration::from_secs(self.join_timeout_secs)
    }

    pub fn join_backoff_base(&self) -> Duration {
        Duration::from_millis(self.join_backoff_base_ms)
    }

    pub fn join_backoff_cap(&self) -> Duration {
        Duration::from_millis(self.join_backoff_cap_ms)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_millis(self.health_interval_ms)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn release_timeout(&self) -> Duration {
        Duration::from_millis(self.release_timeout_ms)
    }
}

/// Where the machine identity lives.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IdentitySettings {
    /// Overrides `~/.overlay-agent/machine_id`
    pub path: Option<PathBuf>,
}

impl IdentitySettings {
    /// Resolved identity file path.
    pub fn resolve_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.path {
            return Ok(path.clone());
        }
        let home = dirs::home_dir()
            .ok_or_else(|| AgentError::Storage("cannot determine home directory".into()))?;
        Ok(home.join(CONFIG_DIR_NAME).join(IDENTITY_FILE_NAME))
    }
}

impl AgentSettings {
    /// Reject settings that would make retry or health loops spin or stall.
    pub fn validate(&self) -> Result<()> {
        let c = &self.control;
        let o = &self.overlay;
        let checks = [
            (c.backoff_base_ms == 0, "control.backoff_base_ms must be > 0"),
            (c.backoff_cap_ms < c.backoff_base_ms, "control.backoff_cap_ms must be >= backoff_base_ms"),
            (c.heartbeat_interval_ms == 0, "control.heartbeat_interval_ms must be > 0"),
            (c.request_timeout_ms == 0, "control.request_timeout_ms must be > 0"),
            (o.join_timeout_secs == 0, "overlay.join_timeout_secs must be > 0"),
            (o.join_backoff_base_ms == 0, "overlay.join_backoff_base_ms must be > 0"),
            (o.join_backoff_cap_ms < o.join_backoff_base_ms, "overlay.join_backoff_cap_ms must be >= join_backoff_base_ms"),
            (o.health_interval_ms == 0, "overlay.health_interval_ms must be > 0"),
            (o.health_failure_threshold == 0, "overlay.health_failure_threshold must be >= 1"),
            (o.probe_timeout_ms == 0, "overlay.probe_timeout_ms must be > 0"),
        ];
        match checks.iter().find(|(bad, _)| *bad) {
            Some((_, msg)) => Err(AgentError::InvalidConfig(msg.to_string())),
            None => Ok(()),
        }
    }
}
