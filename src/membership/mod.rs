// Membership module — what the control server wants this device joined to,
// and converging the running sessions towards it.

pub mod reconciler;
pub mod types;

pub use reconciler::{plan, MembershipReconciler, ReconcilePlan};
pub use types::{
    JoinParameters, MembershipUpdate, NetworkMembership, NetworkSecret, PeerEndpoint, PeerScheme,
    VirtualIpv4,
};
