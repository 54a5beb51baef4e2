// HTTP control channel.
//
// REST flavour of the control protocol:
//
//   POST /api/v1/organizations/{org}/devices/register
//     Body: RegisterRequest
//     Response: RegistrationResult
//
//   POST /api/v1/organizations/{org}/devices/{machine_id}/heartbeat
//     Auth: Bearer <session_id>
//     Body: HeartbeatRequest
//     Response: MembershipUpdate

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

use super::endpoint::ControlEndpoint;
use super::protocol::{HeartbeatRequest, RegisterRequest, RegistrationResult};
use super::transport::ControlChannel;
use crate::error::{AgentError, Result};
use crate::membership::MembershipUpdate;

pub struct HttpControlChannel {
    base_url: Url,
    http: Client,
    session_token: Option<String>,
}

impl HttpControlChannel {
    pub fn new(endpoint: &ControlEndpoint, request_timeout: Duration) -> Result<Self> {
        let http = Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| AgentError::InvalidConfig(format!("failed to build HTTP client: {}", e)))?;
        let base_url = Url::parse(&endpoint.base_url())
            .map_err(|e| AgentError::InvalidConfig(format!("invalid control URL: {}", e)))?;
        Ok(Self {
            base_url,
            http,
            session_token: None,
        })
    }

    /// `base_url` with `segments` appended, each percent-encoded.
    fn api_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base_url.clone();
        {
            let mut path = url.path_segments_mut().map_err(|_| {
                AgentError::InvalidConfig(format!("{} cannot carry a path", self.base_url))
            })?;
            path.pop_if_empty().extend(segments);
        }
        Ok(url)
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, url: Url, body: &B) -> Result<T> {
        let mut req = self.http.post(url).json(body);
        if let Some(token) = &self.session_token {
            req = req.bearer_auth(token);
        }
        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                AgentError::Timeout(format!("control server did not answer: {}", e))
            } else {
                AgentError::Network(format!("failed to reach control server: {}", e))
            }
        })?;
        let resp = check_status(resp).await?;
        let text = resp
            .text()
            .await
            .map_err(|e| AgentError::Network(format!("reading control response: {}", e)))?;
        serde_json::from_str(&text)
            .map_err(|e| AgentError::Protocol(format!("undecodable control response: {}", e)))
    }
}

async fn check_status(resp: Response) -> Result<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
            Err(AgentError::Auth(format!("control server refused device ({}): {}", status, body)))
        }
        _ => Err(AgentError::Network(format!("control server error {}: {}", status, body))),
    }
}

#[async_trait]
impl ControlChannel for HttpControlChannel {
    async fn register(&mut self, request: &RegisterRequest) -> Result<RegistrationResult> {
        let url = self.api_url(&[
            "api",
            "v1",
            "organizations",
            request.organization_id.as_str(),
            "devices",
            "register",
        ])?;
        let result: RegistrationResult = self.post(url, request).await?;
        self.session_token = Some(result.session_id.clone());
        Ok(result)
    }

    async fn heartbeat(&mut self, request: &HeartbeatRequest) -> Result<MembershipUpdate> {
        let machine_id = request.machine_id.to_string();
        let url = self.api_url(&[
            "api",
            "v1",
            "organizations",
            request.organization_id.as_str(),
            "devices",
            machine_id.as_str(),
            "heartbeat",
        ])?;
        self.post(url, request).await
    }
}
