//! Fire-and-forget client for the audit ingestion API.
//!
//! Validation is synchronous: an invalid event is rejected before anything
//! leaves the process. A valid event is posted on a background task and the
//! caller returns immediately; transport failures are logged and dropped.
//! Audit must never fail the operation it describes.

use std::time::Duration;

use opendx_core::audit::{
    DataExchangeEvent, ManagementEvent, validate_exchange, validate_management,
};

pub use opendx_core::audit::AuditValidationError;

const DEFAULT_TIMEOUT_SECS: u64 = 5;

const EXCHANGE_PATH: &str = "/v1/audit/exchange";
const MANAGEMENT_PATH: &str = "/api/events";

#[derive(Clone)]
pub struct AuditClient {
    inner: Option<Inner>,
}

#[derive(Clone)]
struct Inner {
    http: reqwest::Client,
    base_url: String,
}

impl AuditClient {
    /// Client targeting the audit ingress at `base_url`. An empty base URL
    /// yields a disabled client.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Self {
        let base_url: String = base_url.into();
        let base_url = base_url.trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Self::disabled();
        }
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            inner: Some(Inner { http, base_url }),
        }
    }

    /// A client that validates events but never sends anything.
    pub fn disabled() -> Self {
        Self { inner: None }
    }

    /// Reads `AUDIT_BASE_URL` (empty or unset disables the client) and
    /// `AUDIT_HTTP_TIMEOUT_SECS`.
    pub fn from_env() -> Self {
        let base_url = std::env::var("AUDIT_BASE_URL").unwrap_or_default();
        let timeout = std::env::var("AUDIT_HTTP_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_TIMEOUT_SECS));
        Self::with_timeout(base_url, timeout)
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.is_some()
    }

    /// Record a data-exchange event. Returns an error only for invalid
    /// events; the send itself is asynchronous and best-effort.
    pub fn log_data_exchange(
        &self,
        mut event: DataExchangeEvent,
    ) -> Result<(), AuditValidationError> {
        validate_exchange(&event)?;
        event.fill_defaults();
        if let Some(inner) = &self.inner {
            inner.post(EXCHANGE_PATH, encode_body(&event));
        }
        Ok(())
    }

    /// Record a management event. Same contract as [`log_data_exchange`].
    ///
    /// [`log_data_exchange`]: AuditClient::log_data_exchange
    pub fn log_management(&self, mut event: ManagementEvent) -> Result<(), AuditValidationError> {
        validate_management(&event)?;
        event.fill_defaults();
        if let Some(inner) = &self.inner {
            inner.post(MANAGEMENT_PATH, encode_body(&event));
        }
        Ok(())
    }
}

fn encode_body<T: serde::Serialize>(event: &T) -> Option<String> {
    match serde_json::to_string(event) {
        Ok(body) => Some(body),
        Err(err) => {
            tracing::warn!(error = %err, "failed to serialize audit event, dropping");
            None
        }
    }
}

impl Inner {
    fn post(&self, path: &str, body: Option<String>) {
        let Some(body) = body else { return };
        let url = format!("{}{}", self.base_url, path);
        let http = self.http.clone();
        tokio::spawn(async move {
            let result = http
                .post(&url)
                .header("content-type", "application/json")
                .body(body)
                .send()
                .await;
            match result {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => {
                    tracing::warn!(url, status = %response.status(), "audit ingress rejected event");
                }
                Err(err) => {
                    tracing::warn!(url, error = %err, "failed to deliver audit event");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opendx_core::audit::EventStatus;

    fn exchange_event() -> DataExchangeEvent {
        DataExchangeEvent {
            event_id: None,
            timestamp: None,
            consumer_app_id: "app-1".into(),
            provider_schema_id: "schema-1".into(),
            consumer_id: None,
            provider_id: None,
            actor_user_id: None,
            on_behalf_of_owner_id: None,
            requested_fields: vec!["name".into()],
            status: EventStatus::Success,
        }
    }

    #[tokio::test]
    async fn invalid_event_fails_synchronously_and_sends_nothing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", EXCHANGE_PATH)
            .expect(0)
            .create_async()
            .await;

        let client = AuditClient::new(server.url());
        let mut event = exchange_event();
        event.consumer_app_id.clear();

        let err = client
            .log_data_exchange(event)
            .expect_err("empty consumerAppId must be rejected");
        assert_eq!(err, AuditValidationError::MissingField("consumerAppId"));

        // Give any (buggy) background send a chance to fire before asserting.
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn valid_event_is_posted_in_background() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", EXCHANGE_PATH)
            .with_status(202)
            .create_async()
            .await;

        let client = AuditClient::new(server.url());
        client
            .log_data_exchange(exchange_event())
            .expect("valid event must be accepted");

        for _ in 0..100 {
            if mock.matched_async().await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn disabled_client_validates_but_never_sends() {
        let client = AuditClient::disabled();
        assert!(!client.is_enabled());

        client
            .log_data_exchange(exchange_event())
            .expect("valid event is a no-op success");

        let mut event = exchange_event();
        event.provider_schema_id.clear();
        client
            .log_data_exchange(event)
            .expect_err("validation still applies when disabled");
    }

    #[test]
    fn empty_base_url_disables_the_client() {
        assert!(!AuditClient::new("").is_enabled());
        assert!(AuditClient::new("http://localhost:9099").is_enabled());
    }
}
