// Instance module — named, independently running agent instances.

pub mod registry;
pub mod runtime;

pub use registry::{InstanceConfig, InstanceRegistry, InstanceSnapshot, InstanceStatus, NetworkInfo};
pub use runtime::{ControlState, ControlStatus};
