use std::time::Duration;

const DEFAULT_STREAM: &str = "audit-events";
const DEFAULT_GROUP: &str = "audit-consumers";
const DEFAULT_MAX_RETRY: u64 = 5;
const DEFAULT_BLOCK_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(60);

/// Process-wide pipeline configuration, loaded once at init and immutable
/// afterwards.
#[derive(Debug, Clone)]
pub struct Config {
    pub stream: String,
    pub group: String,
    pub dlq_stream: String,
    pub consumer_name: String,
    pub max_retry: u64,
    pub block_timeout: Duration,
    pub pending_timeout: Duration,
}

impl Config {
    pub fn from_env() -> Self {
        let stream = env_or("AUDIT_STREAM_NAME", DEFAULT_STREAM);
        let dlq_stream = std::env::var("AUDIT_DLQ_STREAM_NAME")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| default_dlq_name(&stream));
        Self {
            group: env_or("AUDIT_GROUP_NAME", DEFAULT_GROUP),
            consumer_name: std::env::var("AUDIT_CONSUMER_NAME")
                .or_else(|_| std::env::var("HOSTNAME"))
                .unwrap_or_else(|_| "audit-consumer".into()),
            max_retry: std::env::var("AUDIT_MAX_RETRY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_RETRY),
            block_timeout: secs_env("AUDIT_BLOCK_TIMEOUT", DEFAULT_BLOCK_TIMEOUT),
            pending_timeout: secs_env("AUDIT_PENDING_TIMEOUT", DEFAULT_PENDING_TIMEOUT),
            stream,
            dlq_stream,
        }
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn secs_env(name: &str, default: Duration) -> Duration {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}

fn default_dlq_name(stream: &str) -> String {
    format!("{stream}_dlq")
}
