use std::time::Duration;

use opendx_core::policy::{DecisionRequest, DecisionResponse};

#[derive(Debug, thiserror::Error)]
pub enum PdpError {
    #[error("policy decision point unreachable: {0}")]
    Transport(String),
    #[error("policy decision point returned status {0}")]
    Status(u16),
}

/// Thin client for the PDP's decide endpoint.
#[derive(Clone)]
pub struct PdpClient {
    http: reqwest::Client,
    base_url: String,
}

impl PdpClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn decide(&self, request: &DecisionRequest) -> Result<DecisionResponse, PdpError> {
        let url = format!("{}/api/v1/policy/decide", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(request)
            .send()
            .await
            .map_err(|err| PdpError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PdpError::Status(status.as_u16()));
        }

        response
            .json::<DecisionResponse>()
            .await
            .map_err(|err| PdpError::Transport(err.to_string()))
    }
}
