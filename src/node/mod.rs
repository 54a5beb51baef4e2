// Node module — who this device is.
//
// Every agent process runs on one device. The device has a persisted machine
// id (see `identity`) and a hostname reported to the control server and to
// overlay peers.

pub mod identity;

pub use identity::{
    get_or_create_identity, get_or_create_machine_id, machine_id_from_str, rotate_machine_id,
    Identity,
};

use crate::config::constants::AGENT_VERSION;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What this device tells peers and the control server about itself.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalNode {
    pub machine_id: Uuid,
    pub hostname: String,
    pub agent_version: String,
}

impl LocalNode {
    pub fn new(machine_id: Uuid, hostname: Option<String>) -> Self {
        Self {
            machine_id,
            hostname: hostname.unwrap_or_else(system_hostname),
            agent_version: AGENT_VERSION.to_string(),
        }
    }
}

/// OS hostname, falling back to "unknown-device" when it is not valid UTF-8.
pub fn system_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-device".to_string())
}
