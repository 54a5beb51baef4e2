// Control endpoint parsing
//
//   tcp://host[:port]/<organization_id>    NDJSON control channel (default port 11020)
//   http(s)://host[:port]/<organization_id> REST control channel

use reqwest::Url;
use std::fmt;

use crate::config::constants::DEFAULT_CONTROL_PORT;
use crate::error::{AgentError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlScheme {
    Tcp,
    Http,
    Https,
}

impl ControlScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlScheme::Tcp => "tcp",
            ControlScheme::Http => "http",
            ControlScheme::Https => "https",
        }
    }
}

/// Where the control server lives, and (optionally) which organisation the
/// URL names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlEndpoint {
    pub scheme: ControlScheme,
    pub host: String,
    pub port: u16,
    /// Organisation id taken from the URL path, if any
    pub organization_id: Option<String>,
}

impl ControlEndpoint {
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw.trim())
            .map_err(|e| AgentError::InvalidConfig(format!("invalid control URL '{}': {}", raw, e)))?;

        let scheme = match url.scheme() {
            "tcp" => ControlScheme::Tcp,
            "http" => ControlScheme::Http,
            "https" => ControlScheme::Https,
            other => {
                return Err(AgentError::InvalidConfig(format!(
                    "unsupported control URL scheme '{}' (expected tcp, http or https)",
                    other
                )))
            }
        };

        let host = url
            .host_str()
            .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| AgentError::InvalidConfig(format!("control URL '{}' has no host", raw)))?;

        let port = match scheme {
            ControlScheme::Tcp => url.port().unwrap_or(DEFAULT_CONTROL_PORT),
            _ => url.port_or_known_default().unwrap_or(DEFAULT_CONTROL_PORT),
        };

        let path = url.path().trim_matches('/');
        let organization_id = if path.is_empty() {
            None
        } else {
            Some(path.to_string())
        };

        Ok(Self {
            scheme,
            host,
            port,
            organization_id,
        })
    }

    /// Organisation to register under.
    ///
    /// An explicit id wins when the URL carries none; if both are present
    /// they must agree.
    pub fn resolve_organization(&self, explicit: Option<&str>) -> Result<String> {
        let explicit = explicit.map(str::trim).filter(|s| !s.is_empty());
        match (explicit, self.organization_id.as_deref()) {
            (Some(a), Some(b)) if a != b => Err(AgentError::InvalidConfig(format!(
                "organization id '{}' does not match control URL organization '{}'",
                a, b
            ))),
            (Some(a), _) => Ok(a.to_string()),
            (None, Some(b)) => Ok(b.to_string()),
            (None, None) => Err(AgentError::InvalidConfig(
                "no organization id given and none in the control URL".into(),
            )),
        }
    }

    /// `host:port`, bracketing IPv6 literals.
    pub fn authority(&self) -> String {
        if self.host.contains(':') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    /// `scheme://host:port` without the organisation path.
    pub fn base_url(&self) -> String {
        format!("{}://{}", self.scheme.as_str(), self.authority())
    }
}

impl fmt::Display for ControlEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base_url())?;
        if let Some(org) = &self.organization_id {
            write!(f, "/{}", org)?;
        }
        Ok(())
    }
}
