use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::put;
use axum::{Json, Router};

use crate::schema::SchemaMap;
use crate::state::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/internal/schema", put(replace_schema))
}

/// Swap the active field mapping
///
/// In-flight queries keep the mapping they resolved against; new queries see
/// the replacement.
#[utoipa::path(
    put,
    path = "/internal/schema",
    request_body = SchemaMap,
    responses((status = 204, description = "Active schema replaced")),
    tag = "admin"
)]
pub async fn replace_schema(
    State(state): State<AppState>,
    Json(map): Json<SchemaMap>,
) -> impl IntoResponse {
    let fields = map.fields.len();
    state.schema.replace(map);
    tracing::info!(fields, "active schema replaced");
    StatusCode::NO_CONTENT
}
