// Control transports
//
// A `ControlChannel` is one registered conversation with the control server.
// A `ControlConnector` opens channels; the default one picks the transport
// from the endpoint scheme. Tests substitute their own connectors.

use async_trait::async_trait;
use std::time::Duration;

use super::endpoint::{ControlEndpoint, ControlScheme};
use super::http::HttpControlChannel;
use super::protocol::{HeartbeatRequest, RegisterRequest, RegistrationResult};
use super::tcp::TcpControlChannel;
use crate::error::Result;
use crate::membership::MembershipUpdate;

#[async_trait]
pub trait ControlChannel: Send {
    /// Authenticate this device. `Auth` errors are permanent.
    async fn register(&mut self, request: &RegisterRequest) -> Result<RegistrationResult>;

    /// Report liveness and running networks; the reply is the full desired
    /// membership set.
    async fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<MembershipUpdate>;
}

#[async_trait]
pub trait ControlConnector: Send + Sync {
    async fn connect(&self, endpoint: &ControlEndpoint) -> Result<Box<dyn ControlChannel>>;
}

/// Connector for the built-in tcp/http/https transports.
#[derive(Debug, Clone)]
pub struct DefaultConnector {
    request_timeout: Duration,
}

impl DefaultConnector {
    pub fn new(request_timeout: Duration) -> Self {
        Self { request_timeout }
    }
}

#[async_trait]
impl ControlConnector for DefaultConnector {
    async fn connect(&self, endpoint: &ControlEndpoint) -> Result<Box<dyn ControlChannel>> {
        match endpoint.scheme {
            ControlScheme::Tcp => Ok(Box::new(
                TcpControlChannel::connect(endpoint, self.request_timeout).await?,
            )),
            ControlScheme::Http | ControlScheme::Https => Ok(Box::new(HttpControlChannel::new(
                endpoint,
                self.request_timeout,
            )?)),
        }
    }
}
