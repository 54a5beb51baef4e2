// Control module — talking to the control server.
//
//   endpoint   — control URL parsing and organisation resolution
//   protocol   — request/response messages
//   transport  — channel/connector traits, scheme dispatch
//   tcp, http  — the two built-in transports
//   client     — registration and the background heartbeat loop

pub mod client;
pub mod endpoint;
pub mod http;
pub mod protocol;
pub mod tcp;
pub mod transport;

pub use client::{ControlClient, ControlEvent, Subscription};
pub use endpoint::{ControlEndpoint, ControlScheme};
pub use protocol::{
    ClientFrame, HeartbeatRequest, RegisterRequest, RegistrationResult, RunningNetwork,
    ServerFrame,
};
pub use transport::{ControlChannel, ControlConnector, DefaultConnector};
