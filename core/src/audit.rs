use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Outcome of the operation an audit event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventStatus {
    Success,
    Failure,
}

impl EventStatus {
    /// Stream payloads carry the lowercase form.
    pub fn as_stream_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

/// Record of one consumer-app → provider-schema exchange attempt.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataExchangeEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub consumer_app_id: String,
    pub provider_schema_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_user_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_behalf_of_owner_id: Option<String>,
    #[serde(default)]
    pub requested_fields: Vec<String>,
    pub status: EventStatus,
}

/// Kind of management operation being audited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ManagementEventType {
    Create,
    Update,
    Delete,
}

impl ManagementEventType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorType {
    User,
    Service,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActorRole {
    Member,
    Admin,
}

/// Who performed a management operation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    #[serde(rename = "type")]
    pub actor_type: ActorType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<ActorRole>,
}

/// What a management operation acted on.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub resource: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_id: Option<String>,
}

/// Record of a control-plane mutation (policy, allow-list, schema, ...).
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagementEvent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
    pub event_type: ManagementEventType,
    pub status: EventStatus,
    pub actor: Actor,
    pub target: Target,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

/// Names of stream-payload fields with special meaning.
pub mod stream_fields {
    pub const EVENT_ID: &str = "event_id";
    pub const TIMESTAMP: &str = "timestamp";
    pub const STATUS: &str = "status";
    pub const TRANSACTION_STATUS: &str = "transaction_status";
    pub const REQUESTED_DATA: &str = "requested_data";
    pub const CONSUMER_ID: &str = "consumer_id";
    pub const PROVIDER_ID: &str = "provider_id";
    pub const REQUEST_TYPE: &str = "request_type";
    pub const AUTH_METHOD: &str = "auth_method";
    pub const USER_ID: &str = "user_id";
    pub const SESSION_ID: &str = "session_id";
    pub const RETRY_COUNT: &str = "_retry_count";
    pub const ERROR: &str = "_error";
    pub const ORIGINAL_ID: &str = "_original_id";
    pub const FAILED_AT: &str = "_failed_at";
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuditValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("actor.id is required when actor.type is USER")]
    MissingActorId,
    #[error("actor.role is required when actor.type is USER")]
    MissingActorRole,
    #[error("target.resourceId is required for this event")]
    MissingResourceId,
}

/// Check a data-exchange event before anything is sent or enqueued.
pub fn validate_exchange(event: &DataExchangeEvent) -> Result<(), AuditValidationError> {
    if event.consumer_app_id.trim().is_empty() {
        return Err(AuditValidationError::MissingField("consumerAppId"));
    }
    if event.provider_schema_id.trim().is_empty() {
        return Err(AuditValidationError::MissingField("providerSchemaId"));
    }
    Ok(())
}

/// Check a management event before anything is sent or enqueued.
///
/// `target.resourceId` may be absent only for a CREATE that failed — there is
/// no resource to point at in that case.
pub fn validate_management(event: &ManagementEvent) -> Result<(), AuditValidationError> {
    if event.target.resource.trim().is_empty() {
        return Err(AuditValidationError::MissingField("target.resource"));
    }
    if event.actor.actor_type == ActorType::User {
        if event.actor.id.as_deref().is_none_or(|id| id.trim().is_empty()) {
            return Err(AuditValidationError::MissingActorId);
        }
        if event.actor.role.is_none() {
            return Err(AuditValidationError::MissingActorRole);
        }
    }
    let create_failure = event.event_type == ManagementEventType::Create
        && event.status == EventStatus::Failure;
    if event.target.resource_id.is_none() && !create_failure {
        return Err(AuditValidationError::MissingResourceId);
    }
    Ok(())
}

impl DataExchangeEvent {
    /// Fill event_id and timestamp when the producer left them out.
    pub fn fill_defaults(&mut self) {
        self.event_id.get_or_insert_with(Uuid::new_v4);
        self.timestamp.get_or_insert_with(Utc::now);
    }

    /// Flatten into the stream payload map. `consumer_id` carries the
    /// consuming application id and `provider_id` the provider schema id.
    pub fn to_stream_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if let Some(id) = self.event_id {
            fields.insert(stream_fields::EVENT_ID.into(), id.to_string());
        }
        if let Some(ts) = self.timestamp {
            fields.insert(stream_fields::TIMESTAMP.into(), ts.to_rfc3339());
        }
        fields.insert(stream_fields::REQUEST_TYPE.into(), "data_exchange".into());
        fields.insert(stream_fields::STATUS.into(), self.status.as_stream_str().into());
        fields.insert(stream_fields::CONSUMER_ID.into(), self.consumer_app_id.clone());
        fields.insert(stream_fields::PROVIDER_ID.into(), self.provider_schema_id.clone());
        fields.insert(
            stream_fields::REQUESTED_DATA.into(),
            serde_json::to_string(&self.requested_fields).unwrap_or_else(|_| "[]".into()),
        );
        if let Some(user_id) = &self.actor_user_id {
            fields.insert(stream_fields::USER_ID.into(), user_id.clone());
        }
        fields
    }
}

impl ManagementEvent {
    pub fn fill_defaults(&mut self) {
        self.event_id.get_or_insert_with(Uuid::new_v4);
        self.timestamp.get_or_insert_with(Utc::now);
    }

    pub fn to_stream_fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        if let Some(id) = self.event_id {
            fields.insert(stream_fields::EVENT_ID.into(), id.to_string());
        }
        if let Some(ts) = self.timestamp {
            fields.insert(stream_fields::TIMESTAMP.into(), ts.to_rfc3339());
        }
        fields.insert(stream_fields::REQUEST_TYPE.into(), "management".into());
        fields.insert(stream_fields::STATUS.into(), self.status.as_stream_str().into());
        fields.insert("event_type".into(), self.event_type.as_str().into());
        if let Some(id) = &self.actor.id {
            fields.insert(stream_fields::USER_ID.into(), id.clone());
        }
        fields.insert("resource".into(), self.target.resource.clone());
        if let Some(resource_id) = &self.target.resource_id {
            fields.insert("resource_id".into(), resource_id.clone());
        }
        if let Some(metadata) = &self.metadata {
            fields.insert("metadata".into(), metadata.to_string());
        }
        fields
    }
}
