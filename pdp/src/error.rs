use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use opendx_core::error::{ApiError, codes};

use crate::decision::EvalError;
use crate::store::StoreError;

/// Internal error type that converts to structured API responses
#[derive(Debug)]
pub enum AppError {
    /// Request failed validation (400)
    Validation {
        message: String,
        field: Option<String>,
    },
    /// Database error (500)
    Database(sqlx::Error),
    /// Internal error (500)
    Internal(String),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let request_id = uuid::Uuid::new_v4().to_string();

        let (status, api_error) = match self {
            AppError::Validation { message, field } => (
                StatusCode::BAD_REQUEST,
                ApiError {
                    error: codes::INVALID_ARGUMENT.to_string(),
                    message,
                    field,
                    blocking_fields: None,
                    request_id,
                },
            ),
            AppError::Database(err) => {
                tracing::error!(error = ?err, "database error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: codes::INTERNAL.to_string(),
                        message: "An internal error occurred".to_string(),
                        field: None,
                        blocking_fields: None,
                        request_id,
                    },
                )
            }
            AppError::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ApiError {
                        error: codes::INTERNAL.to_string(),
                        message: "An internal error occurred".to_string(),
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

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        AppError::Database(err)
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Database(err) => AppError::Database(err),
            StoreError::Corrupt(msg) => AppError::Internal(msg),
        }
    }
}

impl From<EvalError> for AppError {
    fn from(err: EvalError) -> Self {
        match err {
            EvalError::InvalidArgument(message) => AppError::Validation {
                message,
                field: None,
            },
            EvalError::Store(err) => err.into(),
        }
    }
}
