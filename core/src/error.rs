use serde::Serialize;
use utoipa::ToSchema;

/// Structured error response shared by all opendx services.
/// The `error` field is a stable machine-readable code; `message` is safe to
/// surface to callers and never carries upstream detail.
#[derive(Debug, Serialize, ToSchema)]
pub struct ApiError {
    /// Machine-readable error code (e.g. "invalid_argument", "access_expired")
    pub error: String,
    /// Safe description of what went wrong
    pub message: String,
    /// Which field caused the error (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    /// Fields blocking the request (authorization / consent errors)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub blocking_fields: Option<Vec<crate::policy::FieldRef>>,
    /// Request ID for tracing and debugging
    pub request_id: String,
}

/// Error codes used across the services
pub mod codes {
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const NOT_FOUND: &str = "not_found";
    pub const UNAUTHENTICATED: &str = "unauthenticated";
    pub const PERMISSION_DENIED: &str = "permission_denied";
    pub const ACCESS_EXPIRED: &str = "access_expired";
    pub const CONSENT_PENDING: &str = "consent_pending";
    pub const CONSENT_DENIED: &str = "consent_denied";
    pub const UPSTREAM_UNAVAILABLE: &str = "upstream_unavailable";
    pub const PARTIAL_FAILURE: &str = "partial_failure";
    pub const INTERNAL: &str = "internal";
}
