// Overlay Agent - device client for a centrally managed overlay network
// Library exports

pub mod config;
pub mod control;
pub mod error;
pub mod ffi;
pub mod instance;
pub mod logging;
pub mod membership;
pub mod node;
pub mod overlay;
pub mod retry;
pub mod wire;

pub use config::{load_settings, AgentSettings};
pub use error::{AgentError, Result};
pub use instance::{InstanceConfig, InstanceRegistry, InstanceSnapshot, InstanceStatus, NetworkInfo};
pub use membership::{MembershipUpdate, NetworkMembership};
pub use node::Identity;
