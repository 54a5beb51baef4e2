// NDJSON-over-TCP control channel
//
// One long-lived connection per registration: a `register` frame first, then
// one `heartbeat` request per interval, each answered by a single frame.

use async_trait::async_trait;
use std::time::Duration;

use super::endpoint::ControlEndpoint;
use super::protocol::{ClientFrame, HeartbeatRequest, RegisterRequest, RegistrationResult, ServerFrame};
use super::transport::ControlChannel;
use crate::error::{AgentError, Result};
use crate::membership::MembershipUpdate;
use crate::wire::NdjsonConn;

pub struct TcpControlChannel {
    conn: NdjsonConn,
    request_timeout: Duration,
}

impl TcpControlChannel {
    pub async fn connect(endpoint: &ControlEndpoint, request_timeout: Duration) -> Result<Self> {
        let conn = NdjsonConn::connect(&endpoint.authority(), request_timeout).await?;
        tracing::debug!(server = %endpoint, "Control connection opened");
        Ok(Self {
            conn,
            request_timeout,
        })
    }

    async fn exchange(&mut self, frame: &ClientFrame) -> Result<ServerFrame> {
        self.conn.request(frame, self.request_timeout).await
    }
}

#[async_trait]
impl ControlChannel for TcpControlChannel {
    async fn register(&mut self, request: &RegisterRequest) -> Result<RegistrationResult> {
        match self.exchange(&ClientFrame::Register(request.clone())).await? {
            ServerFrame::Registered(result) => Ok(result),
            ServerFrame::Rejected { reason } => Err(AgentError::Auth(reason)),
            ServerFrame::Error { message } => Err(AgentError::Protocol(message)),
            other => Err(AgentError::Protocol(format!(
                "unexpected reply to register: {:?}",
                other
            ))),
        }
    }

    async fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<MembershipUpdate> {
        match self.exchange(&ClientFrame::Heartbeat(request.clone())).await? {
            ServerFrame::Memberships(update) => Ok(update),
            ServerFrame::Rejected { reason } => Err(AgentError::Auth(reason)),
            ServerFrame::Error { message } => Err(AgentError::Protocol(message)),
            other => Err(AgentError::Protocol(format!(
                "unexpected reply to heartbeat: {:?}",
                other
            ))),
        }
    }
}
