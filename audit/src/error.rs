use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opendx_core::error::{ApiError, codes};

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Event failed validation (400)
    Validation { message: String },
    /// Stream broker unreachable (503)
    Upstream(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();

        let (status, api_error) = match self {
            AppError::Validation { message } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: codes::INVALID_ARGUMENT.to_string(),
                    message,
                    field: None,
                    blocking_fields: None,
                    request_id,
                },
            ),
            AppError::Upstream(detail) => {
                tracing::error!(error = %detail, "stream broker unavailable");
                (
                    StatusCode::SERVICE_UNAVAILABLE,
                    ApiError {
                        error: codes::UPSTREAM_UNAVAILABLE.to_string(),
                        message: "Event could not be accepted, try again later".to_string(),
                        field: None,
                        blocking_fields: None,
                        request_id,
                    },
                )
            }
        };

        (status, Json(api_error)).into_response()
    }
}
