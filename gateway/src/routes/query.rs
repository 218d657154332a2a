use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use serde::Serialize;

use opendx_core::error::ApiError;
use opendx_core::policy::ConsentRequiredField;

use crate::error::AppError;
use crate::federator::{FederatedQuery, FederatedResponse, FederationOutcome};
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/public/graphql", post(federated_query))
}

/// Returned when the owner's consent is still pending: the caller forwards
/// the portal URL to the owner and retries with the consent handle.
#[derive(Debug, Serialize, utoipa::ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsentPendingResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub consent_portal_url: Option<String>,
    pub fields: Vec<ConsentRequiredField>,
}

/// Execute a federated query
///
/// Resolves the requested fields against the active schema, checks the
/// application's authorization with the PDP, drives the consent flow when a
/// field requires it, and fans out to the owning providers. Per-provider
/// failures yield a partial response with an errors array.
#[utoipa::path(
    post,
    path = "/public/graphql",
    request_body = FederatedQuery,
    responses(
        (status = 200, description = "Aggregated data, possibly partial", body = FederatedResponse),
        (status = 202, description = "Owner consent pending", body = ConsentPendingResponse),
        (status = 400, description = "Invalid query", body = ApiError),
        (status = 403, description = "Unauthorized, expired, or consent denied", body = ApiError),
        (status = 503, description = "Upstream unavailable", body = ApiError)
    ),
    tag = "query"
)]
pub async fn federated_query(
    State(state): State<AppState>,
    Json(query): Json<FederatedQuery>,
) -> Result<impl IntoResponse, AppError> {
    let outcome = state.federator.execute(query).await?;

    Ok(match outcome {
        FederationOutcome::Data(response) => {
            let outcome_label = if response.errors.is_empty() {
                "success"
            } else {
                "partial"
            };
            metrics::counter!("gateway_queries_total", "outcome" => outcome_label).increment(1);
            (StatusCode::OK, Json(response)).into_response()
        }
        FederationOutcome::ConsentPending {
            consent_id,
            portal_url,
            fields,
        } => {
            metrics::counter!("gateway_queries_total", "outcome" => "consent_pending").increment(1);
            (
                StatusCode::ACCEPTED,
                Json(ConsentPendingResponse {
                    status: "consent_pending".into(),
                    consent_id,
                    consent_portal_url: portal_url,
                    fields,
                }),
            )
                .into_response()
        }
    })
}
