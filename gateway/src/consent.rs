use std::time::Duration;

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use opendx_core::policy::ConsentRequiredField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ConsentStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
    Revoked,
}

impl ConsentStatus {
    pub fn is_terminal(self) -> bool {
        self != Self::Pending
    }
}

/// The consent engine owns the record; the gateway only holds this handle.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRecord {
    pub consent_id: String,
    pub status: ConsentStatus,
    #[serde(default)]
    pub consent_portal_url: Option<String>,
    #[serde(default)]
    pub fields: Vec<ConsentRequiredField>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConsentRequest<'a> {
    application_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    owner_id: Option<&'a str>,
    fields: &'a [ConsentRequiredField],
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: ConsentStatus,
}

#[derive(Debug, thiserror::Error)]
pub enum ConsentError {
    #[error("consent engine unreachable: {0}")]
    Transport(String),
    #[error("consent engine returned status {0}")]
    Status(u16),
}

/// Client for the external consent engine.
#[derive(Clone)]
pub struct ConsentClient {
    http: reqwest::Client,
    base_url: String,
    poll_interval: Duration,
}

impl ConsentClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration, poll_interval: Duration) -> Self {
        let base_url: String = base_url.into();
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            poll_interval,
        }
    }

    /// Open a consent request for the owner covering `fields`.
    pub async fn create(
        &self,
        application_id: &str,
        owner_id: Option<&str>,
        fields: &[ConsentRequiredField],
    ) -> Result<ConsentRecord, ConsentError> {
        let url = format!("{}/consents", self.base_url);
        let response = self
            .http
            .post(&url)
            .json(&CreateConsentRequest {
                application_id,
                owner_id,
                fields,
            })
            .send()
            .await
            .map_err(|err| ConsentError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsentError::Status(status.as_u16()));
        }

        response
            .json::<ConsentRecord>()
            .await
            .map_err(|err| ConsentError::Transport(err.to_string()))
    }

    pub async fn status(&self, consent_id: &str) -> Result<ConsentStatus, ConsentError> {
        let url = format!("{}/consents/{}", self.base_url, consent_id);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| ConsentError::Transport(err.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ConsentError::Status(status.as_u16()));
        }

        response
            .json::<StatusResponse>()
            .await
            .map(|body| body.status)
            .map_err(|err| ConsentError::Transport(err.to_string()))
    }

    /// Poll until the consent leaves `pending` or the deadline passes.
    /// Returns the last observed status; dropping the future cancels the
    /// poll at the next interval.
    pub async fn await_decision(
        &self,
        consent_id: &str,
        deadline: Duration,
    ) -> Result<ConsentStatus, ConsentError> {
        let started = tokio::time::Instant::now();
        loop {
            let status = self.status(consent_id).await?;
            if status.is_terminal() || started.elapsed() >= deadline {
                return Ok(status);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}
