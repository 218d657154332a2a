use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use opendx_core::audit::{
    DataExchangeEvent, ManagementEvent, validate_exchange, validate_management,
};
use opendx_core::error::ApiError;

use crate::broker::StreamBroker;
use crate::error::AppError;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/v1/audit/exchange", post(ingest_exchange))
        .route("/api/events", post(ingest_management))
}

#[derive(Serialize, utoipa::ToSchema)]
pub struct IngestResponse {
    pub event_id: uuid::Uuid,
    pub message_id: String,
}

/// Accept a data-exchange audit event
///
/// Validates synchronously, fills eventId/timestamp when absent, and
/// publishes to the audit stream. Persistence happens asynchronously in the
/// consumer group.
#[utoipa::path(
    post,
    path = "/v1/audit/exchange",
    request_body = DataExchangeEvent,
    responses(
        (status = 202, description = "Event accepted", body = IngestResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Stream broker unavailable", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn ingest_exchange(
    State(state): State<AppState>,
    Json(mut event): Json<DataExchangeEvent>,
) -> Result<impl IntoResponse, AppError> {
    validate_exchange(&event).map_err(|err| AppError::Validation {
        message: err.to_string(),
    })?;
    event.fill_defaults();

    let fields = event.to_stream_fields();
    let message_id = state
        .broker
        .publish(&state.config.stream, &fields)
        .await
        .map_err(|err| AppError::Upstream(err.to_string()))?;

    metrics::counter!("audit_events_published_total", "kind" => "data_exchange").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            // fill_defaults guarantees the id
            event_id: event.event_id.unwrap_or_default(),
            message_id,
        }),
    ))
}

/// Accept a management audit event
#[utoipa::path(
    post,
    path = "/api/events",
    request_body = ManagementEvent,
    responses(
        (status = 202, description = "Event accepted", body = IngestResponse),
        (status = 400, description = "Validation error", body = ApiError),
        (status = 503, description = "Stream broker unavailable", body = ApiError)
    ),
    tag = "audit"
)]
pub async fn ingest_management(
    State(state): State<AppState>,
    Json(mut event): Json<ManagementEvent>,
) -> Result<impl IntoResponse, AppError> {
    validate_management(&event).map_err(|err| AppError::Validation {
        message: err.to_string(),
    })?;
    event.fill_defaults();

    let fields = event.to_stream_fields();
    let message_id = state
        .broker
        .publish(&state.config.stream, &fields)
        .await
        .map_err(|err| AppError::Upstream(err.to_string()))?;

    metrics::counter!("audit_events_published_total", "kind" => "management").increment(1);

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            event_id: event.event_id.unwrap_or_default(),
            message_id,
        }),
    ))
}
