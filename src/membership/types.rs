// Membership data model — what the control server tells a device to join.
//
// Everything the server sends is parsed into typed values here, so a bad
// peer URI or a duplicated network name is caught at the boundary instead of
// surfacing halfway through a join.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{AgentError, Result};

/// An IPv4 address with its prefix length, written `10.0.0.2/24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct VirtualIpv4 {
    pub addr: Ipv4Addr,
    pub prefix_len: u8,
}

impl VirtualIpv4 {
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(AgentError::Protocol(format!(
                "invalid prefix length /{}",
                prefix_len
            )));
        }
        Ok(Self { addr, prefix_len })
    }

    fn mask(&self) -> u32 {
        match self.prefix_len {
            0 => 0,
            len => u32::MAX << (32 - u32::from(len)),
        }
    }

    /// Whether `other` falls inside this address's subnet.
    pub fn contains(&self, other: Ipv4Addr) -> bool {
        let mask = self.mask();
        (u32::from(self.addr) & mask) == (u32::from(other) & mask)
    }
}

impl fmt::Display for VirtualIpv4 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix_len)
    }
}

impl FromStr for VirtualIpv4 {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = || AgentError::Protocol(format!("invalid virtual address '{}'", s));
        let (addr, len) = match s.split_once('/') {
            Some((addr, len)) => (addr, len.parse::<u8>().map_err(|_| bad())?),
            None => (s, 32),
        };
        let addr = addr.parse::<Ipv4Addr>().map_err(|_| bad())?;
        Self::new(addr, len)
    }
}

impl TryFrom<String> for VirtualIpv4 {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<VirtualIpv4> for String {
    fn from(value: VirtualIpv4) -> Self {
        value.to_string()
    }
}

/// Transport a peer or relay is reached over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PeerScheme {
    Tcp,
    Udp,
    Ws,
    Wss,
}

impl PeerScheme {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "tcp" => Some(PeerScheme::Tcp),
            "udp" => Some(PeerScheme::Udp),
            "ws" => Some(PeerScheme::Ws),
            "wss" => Some(PeerScheme::Wss),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PeerScheme::Tcp => "tcp",
            PeerScheme::Udp => "udp",
            PeerScheme::Ws => "ws",
            PeerScheme::Wss => "wss",
        }
    }
}

/// A validated `scheme://host:port` peer or relay address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PeerEndpoint {
    pub scheme: PeerScheme,
    pub host: String,
    pub port: u16,
}

impl PeerEndpoint {
    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

impl fmt::Display for PeerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}://{}", self.scheme.as_str(), self.authority())
    }
}

impl FromStr for PeerEndpoint {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self> {
        let bad = |why: &str| AgentError::Protocol(format!("invalid peer address '{}': {}", s, why));
        let (scheme, rest) = s.split_once("://").ok_or_else(|| bad("missing scheme"))?;
        let scheme = PeerScheme::parse(scheme).ok_or_else(|| bad("unsupported scheme"))?;
        let rest = rest.trim_end_matches('/');
        let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
            let (host, port) = stripped.split_once("]:").ok_or_else(|| bad("missing port"))?;
            (host, port)
        } else {
            rest.rsplit_once(':').ok_or_else(|| bad("missing port"))?
        };
        if host.is_empty() {
            return Err(bad("empty host"));
        }
        let port = port.parse::<u16>().map_err(|_| bad("invalid port"))?;
        if port == 0 {
            return Err(bad("port 0"));
        }
        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
        })
    }
}

impl TryFrom<String> for PeerEndpoint {
    type Error = AgentError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PeerEndpoint> for String {
    fn from(value: PeerEndpoint) -> Self {
        value.to_string()
    }
}

/// Pre-shared network secret. Never printed.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NetworkSecret(String);

impl NetworkSecret {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NetworkSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("NetworkSecret(***)")
    }
}

/// Join parameters, versioned by `schema` so newer servers can extend them
/// without older agents misreading the payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum JoinParameters {
    V1 {
        network_secret: NetworkSecret,
        #[serde(default)]
        peers: Vec<PeerEndpoint>,
        #[serde(default)]
        relays: Vec<PeerEndpoint>,
    },
}

impl JoinParameters {
    pub fn secret(&self) -> &NetworkSecret {
        match self {
            JoinParameters::V1 { network_secret, .. } => network_secret,
        }
    }

    /// Direct peers first, then relays.
    pub fn endpoints(&self) -> Vec<PeerEndpoint> {
        match self {
            JoinParameters::V1 { peers, relays, .. } => {
                peers.iter().chain(relays.iter()).cloned().collect()
            }
        }
    }
}

/// Assignment of this device to one overlay network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkMembership {
    pub network_name: String,
    pub join: JoinParameters,
    /// Static address chosen by the server; `None` lets peers allocate one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assigned_virtual_ipv4: Option<VirtualIpv4>,
}

impl NetworkMembership {
    fn validate(&self) -> Result<()> {
        if self.network_name.trim().is_empty() {
            return Err(AgentError::Protocol("membership with empty network name".into()));
        }
        if self.join.endpoints().is_empty() {
            return Err(AgentError::Protocol(format!(
                "membership '{}' has neither peers nor relays",
                self.network_name
            )));
        }
        Ok(())
    }
}

/// Full desired-state snapshot from the control server.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MembershipUpdate {
    /// Monotonic server-side revision, informational only
    #[serde(default)]
    pub revision: u64,
    #[serde(default)]
    pub memberships: Vec<NetworkMembership>,
}

impl MembershipUpdate {
    /// The empty desired set (revoke everything).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn validate(&self) -> Result<()> {
        let mut seen = HashSet::new();
        for m in &self.memberships {
            m.validate()?;
            if !seen.insert(m.network_name.as_str()) {
                return Err(AgentError::Protocol(format!(
                    "duplicate membership for network '{}'",
                    m.network_name
                )));
            }
        }
        Ok(())
    }
}
