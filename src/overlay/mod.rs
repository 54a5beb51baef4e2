// Overlay module — session lifecycle for joined networks.
//
//   driver      — seam to the code that actually reaches peers and relays
//   tcp         — NDJSON-over-TCP driver
//   manager     — join / leave / health check / rejoin
//   supervisor  — one task per network, serialising its operations
//   session     — snapshots and the per-instance session board

pub mod driver;
pub mod manager;
pub mod session;
pub mod supervisor;
pub mod tcp;

pub use driver::{secret_digest, JoinRequest, OverlayDriver, OverlayLink};
pub use manager::{ActiveSession, SessionManager};
pub use session::{
    HealthStatus, NetworkPhase, NetworkStatus, OverlaySession, PeerLinkState, PeerState,
    SessionBoard,
};
pub use supervisor::{NetworkCommand, NetworkHandle};
pub use tcp::{LinkFrame, TcpOverlayDriver};
