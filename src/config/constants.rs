// Project-wide constants
//
// Centralised here so port numbers and other magic values have one
// source of truth. Import via `use crate::config::constants::*;`.

/// Default port of the control server when a `tcp://` URL omits it.
pub const DEFAULT_CONTROL_PORT: u16 = 11020;

/// Directory under `$HOME` holding the agent's config and identity.
pub const CONFIG_DIR_NAME: &str = ".overlay-agent";

/// Config file name inside [`CONFIG_DIR_NAME`].
pub const CONFIG_FILE_NAME: &str = "config.toml";

/// Persisted machine identity file name inside [`CONFIG_DIR_NAME`].
pub const IDENTITY_FILE_NAME: &str = "machine_id";

/// Capacity of the bounded channel from the control subscription to the
/// reconciler.
pub const CONTROL_EVENT_CAPACITY: usize = 16;

/// Capacity of each per-network command queue.
pub const NETWORK_COMMAND_CAPACITY: usize = 8;

/// Maximum accepted length of one NDJSON line on the wire.
pub const MAX_FRAME_BYTES: usize = 256 * 1024;

/// How long `stop` waits for an instance task to wind down before aborting it.
pub const STOP_TIMEOUT_SECS: u64 = 10;

/// Agent version reported to the control server and peers.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
