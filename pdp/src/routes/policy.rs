use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;

use opendx_core::audit::{
    Actor, ActorType, EventStatus, ManagementEvent, ManagementEventType, Target,
};
use opendx_core::error::ApiError;
use opendx_core::policy::{
    AllowListUpdateRecord, DecisionRequest, DecisionResponse, PutMetadataRequest,
    PutMetadataResponse, UpdateAllowListRequest, UpdateAllowListResponse, parse_grant_duration,
};

use crate::decision;
use crate::error::AppError;
use crate::state::AppState;
use crate::store::{PgAllowListStore, PgMetadataStore};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/api/v1/policy/metadata", post(put_metadata))
        .route("/api/v1/policy/metadata/{schema_id}", get(list_metadata))
        .route("/api/v1/policy/update-allowlist", post(update_allowlist))
        .route("/api/v1/policy/decide", post(decide))
}

/// Record a management-plane mutation in the audit trail. Best-effort: a
/// failure here is logged by the client and never fails the request.
fn audit_management(
    state: &AppState,
    event_type: ManagementEventType,
    status: EventStatus,
    resource: &str,
    resource_id: Option<String>,
) {
    let event = ManagementEvent {
        event_id: None,
        timestamp: None,
        event_type,
        status,
        actor: Actor {
            actor_type: ActorType::Service,
            id: Some("pdp".into()),
            role: None,
        },
        target: Target {
            resource: resource.into(),
            resource_id,
        },
        metadata: None,
    };
    if let Err(err) = state.audit.log_management(event) {
        tracing::warn!(error = %err, "management audit event rejected");
    }
}

/// Upsert policy metadata for a schema's fields
///
/// Existing rows keep their id and createdAt; re-upserting identical content
/// is idempotent apart from updatedAt.
#[utoipa::path(
    post,
    path = "/api/v1/policy/metadata",
    request_body = PutMetadataRequest,
    responses(
        (status = 201, description = "Records upserted", body = PutMetadataResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "policy"
)]
pub async fn put_metadata(
    State(state): State<AppState>,
    Json(req): Json<PutMetadataRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.schema_id.trim().is_empty() {
        return Err(AppError::Validation {
            message: "schemaId must not be empty".into(),
            field: Some("schemaId".into()),
        });
    }
    if req.records.is_empty() {
        return Err(AppError::Validation {
            message: "records must not be empty".into(),
            field: Some("records".into()),
        });
    }
    for (i, record) in req.records.iter().enumerate() {
        if record.field_name.trim().is_empty() {
            return Err(AppError::Validation {
                message: format!("records[{i}].fieldName must not be empty"),
                field: Some(format!("records[{i}].fieldName")),
            });
        }
        if record.source.trim().is_empty() {
            return Err(AppError::Validation {
                message: format!("records[{i}].source must not be empty"),
                field: Some(format!("records[{i}].source")),
            });
        }
    }

    let store = PgMetadataStore::new(state.db.clone());
    let result = store.put_records(&req.schema_id, req.records).await;

    let status = if result.is_ok() {
        EventStatus::Success
    } else {
        EventStatus::Failure
    };
    audit_management(
        &state,
        ManagementEventType::Update,
        status,
        "policy_metadata",
        Some(req.schema_id.clone()),
    );

    let records = result?;
    metrics::counter!("pdp_metadata_upserts_total").increment(records.len() as u64);

    Ok((StatusCode::CREATED, Json(PutMetadataResponse { records })))
}

/// List policy metadata for one schema
#[utoipa::path(
    get,
    path = "/api/v1/policy/metadata/{schema_id}",
    params(("schema_id" = String, Path, description = "Schema identifier")),
    responses(
        (status = 200, description = "Records for the schema", body = PutMetadataResponse)
    ),
    tag = "policy"
)]
pub async fn list_metadata(
    State(state): State<AppState>,
    Path(schema_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    let store = PgMetadataStore::new(state.db.clone());
    let records = store.list_by_schema(&schema_id).await?;
    Ok(Json(PutMetadataResponse { records }))
}

/// Grant or refresh an application's field access
///
/// Every call restarts the grant clock: expiresAt = now + grantDuration.
#[utoipa::path(
    post,
    path = "/api/v1/policy/update-allowlist",
    request_body = UpdateAllowListRequest,
    responses(
        (status = 200, description = "Grants refreshed", body = UpdateAllowListResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "policy"
)]
pub async fn update_allowlist(
    State(state): State<AppState>,
    Json(req): Json<UpdateAllowListRequest>,
) -> Result<impl IntoResponse, AppError> {
    if req.application_id.trim().is_empty() {
        return Err(AppError::Validation {
            message: "applicationId must not be empty".into(),
            field: Some("applicationId".into()),
        });
    }
    if req.records.is_empty() {
        return Err(AppError::Validation {
            message: "records must not be empty".into(),
            field: Some("records".into()),
        });
    }
    for (i, record) in req.records.iter().enumerate() {
        if record.schema_id.trim().is_empty() || record.field_name.trim().is_empty() {
            return Err(AppError::Validation {
                message: format!("records[{i}] must carry schemaId and fieldName"),
                field: Some(format!("records[{i}]")),
            });
        }
    }
    let ttl = parse_grant_duration(&req.grant_duration).map_err(|err| AppError::Validation {
        message: err.to_string(),
        field: Some("grantDuration".into()),
    })?;

    let store = PgAllowListStore::new(state.db.clone());
    let result = store.upsert(&req.application_id, &req.records, ttl).await;

    let status = if result.is_ok() {
        EventStatus::Success
    } else {
        EventStatus::Failure
    };
    audit_management(
        &state,
        ManagementEventType::Update,
        status,
        "allow_list",
        Some(req.application_id.clone()),
    );

    let entries = result?;
    metrics::counter!("pdp_allowlist_upserts_total").increment(entries.len() as u64);

    let records = entries
        .into_iter()
        .map(|entry| AllowListUpdateRecord {
            schema_id: entry.schema_id,
            field_name: entry.field_name,
            expires_at: entry.expires_at,
            updated_at: entry.granted_at,
        })
        .collect();

    Ok(Json(UpdateAllowListResponse { records }))
}

/// Decide whether an application may read a set of fields
///
/// Reports authorization, expiry, and consent requirements in one pass.
/// The PDP never contacts the consent engine — it only says whether consent
/// is needed.
#[utoipa::path(
    post,
    path = "/api/v1/policy/decide",
    request_body = DecisionRequest,
    responses(
        (status = 200, description = "Decision", body = DecisionResponse),
        (status = 400, description = "Validation error", body = ApiError)
    ),
    tag = "policy"
)]
pub async fn decide(
    State(state): State<AppState>,
    Json(req): Json<DecisionRequest>,
) -> Result<impl IntoResponse, AppError> {
    let metadata = PgMetadataStore::new(state.db.clone());
    let allow_list = PgAllowListStore::new(state.db.clone());

    let decision = decision::evaluate(&metadata, &allow_list, &req, Utc::now()).await?;

    metrics::counter!(
        "pdp_decisions_total",
        "authorized" => if decision.app_authorized { "true" } else { "false" }
    )
    .increment(1);

    Ok(Json(decision))
}
