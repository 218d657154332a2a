use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opendx_core::error::{ApiError, codes};
use opendx_core::policy::FieldRef;

use crate::federator::FederationError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    Federation(FederationError),
}

impl From<FederationError> for AppError {
    fn from(err: FederationError) -> Self {
        AppError::Federation(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();
        let AppError::Federation(err) = self;

        let (status, code, message, blocking_fields): (
            StatusCode,
            &str,
            String,
            Option<Vec<FieldRef>>,
        ) = match err {
            FederationError::InvalidQuery { message } => {
                (StatusCode::BAD_REQUEST, codes::INVALID_ARGUMENT, message, None)
            }
            FederationError::PermissionDenied { fields } => (
                StatusCode::FORBIDDEN,
                codes::PERMISSION_DENIED,
                "application is not authorized for the requested fields".into(),
                Some(fields),
            ),
            FederationError::AccessExpired { fields } => (
                StatusCode::FORBIDDEN,
                codes::ACCESS_EXPIRED,
                "application access has expired, re-issue the allow-list grant".into(),
                Some(fields),
            ),
            FederationError::ConsentDenied { status, fields } => (
                StatusCode::FORBIDDEN,
                codes::CONSENT_DENIED,
                format!("owner consent is {status:?}").to_lowercase(),
                Some(
                    fields
                        .into_iter()
                        .map(|f| FieldRef::new(f.schema_id, f.field_name))
                        .collect(),
                ),
            ),
            FederationError::Upstream(detail) => {
                tracing::error!(error = %detail, "upstream failure");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    codes::UPSTREAM_UNAVAILABLE,
                    "an upstream dependency is unavailable".into(),
                    None,
                )
            }
        };

        (
            status,
            Json(ApiError {
                error: code.to_string(),
                message,
                field: None,
                blocking_fields,
                request_id,
            }),
        )
            .into_response()
    }
}
