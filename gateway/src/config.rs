use std::time::Duration;

/// Gateway configuration, loaded once at init from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub pdp_base_url: String,
    pub consent_base_url: String,
    pub schema_file: String,
    pub providers_file: String,
    pub pdp_timeout: Duration,
    pub consent_timeout: Duration,
    pub consent_poll_interval: Duration,
    /// Grace window spent polling a fresh consent for a fast approval
    /// before answering CONSENT_PENDING. Zero disables the wait.
    pub consent_wait: Duration,
}

impl Config {
    /// Panics on missing required variables: the gateway cannot start
    /// without knowing its collaborators.
    pub fn from_env() -> Self {
        Self {
            pdp_base_url: required("PDP_BASE_URL"),
            consent_base_url: required("CONSENT_BASE_URL"),
            schema_file: required("SCHEMA_FILE"),
            providers_file: required("PROVIDERS_FILE"),
            pdp_timeout: secs_env("PDP_TIMEOUT_SECS", 10),
            consent_timeout: secs_env("CONSENT_TIMEOUT_SECS", 10),
            consent_poll_interval: secs_env("CONSENT_POLL_INTERVAL_SECS", 2),
            consent_wait: secs_env("CONSENT_WAIT_SECS", 0),
        }
    }
}

fn required(name: &str) -> String {
    match std::env::var(name) {
        Ok(value) if !value.trim().is_empty() => value,
        _ => panic!("{name} must be set and non-empty"),
    }
}

fn secs_env(name: &str, default: u64) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(default))
}
