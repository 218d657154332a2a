use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use opendx_core::audit::stream_fields;
use sqlx::PgPool;
use uuid::Uuid;

/// One row of the append-only audit trail, as parsed from a stream payload.
#[derive(Debug, Clone, PartialEq)]
pub struct AuditLogRow {
    pub event_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub application_id: Option<String>,
    pub schema_id: Option<String>,
    pub status: String,
    pub request_type: Option<String>,
    pub requested_data: Option<serde_json::Value>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub auth_method: Option<String>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ParseError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("invalid event_id '{0}'")]
    InvalidEventId(String),
    #[error("invalid status '{0}', expected success or failure")]
    InvalidStatus(String),
    #[error("requested_data is not a JSON array: {0}")]
    InvalidRequestedData(String),
}

impl AuditLogRow {
    /// Parse a flat stream payload. `transaction_status` wins over `status`
    /// when both appear; either spelling is normalized to lowercase.
    /// `consumer_id` maps to the application and `provider_id` to the schema.
    pub fn from_stream(fields: &BTreeMap<String, String>) -> Result<Self, ParseError> {
        let event_id = fields
            .get(stream_fields::EVENT_ID)
            .ok_or(ParseError::MissingField("event_id"))?;
        let event_id = event_id
            .parse::<Uuid>()
            .map_err(|_| ParseError::InvalidEventId(event_id.clone()))?;

        let status = fields
            .get(stream_fields::TRANSACTION_STATUS)
            .or_else(|| fields.get(stream_fields::STATUS))
            .ok_or(ParseError::MissingField("status"))?;
        let status = status.to_lowercase();
        if status != "success" && status != "failure" {
            return Err(ParseError::InvalidStatus(status));
        }

        let timestamp = fields
            .get(stream_fields::TIMESTAMP)
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|ts| ts.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);

        let requested_data = match fields.get(stream_fields::REQUESTED_DATA) {
            Some(raw) => {
                let value: serde_json::Value = serde_json::from_str(raw)
                    .map_err(|_| ParseError::InvalidRequestedData(raw.clone()))?;
                if !value.is_array() {
                    return Err(ParseError::InvalidRequestedData(raw.clone()));
                }
                Some(value)
            }
            None => None,
        };

        Ok(Self {
            event_id,
            timestamp,
            application_id: fields.get(stream_fields::CONSUMER_ID).cloned(),
            schema_id: fields.get(stream_fields::PROVIDER_ID).cloned(),
            status,
            request_type: fields.get(stream_fields::REQUEST_TYPE).cloned(),
            requested_data,
            user_id: fields.get(stream_fields::USER_ID).cloned(),
            session_id: fields.get(stream_fields::SESSION_ID).cloned(),
            auth_method: fields.get(stream_fields::AUTH_METHOD).cloned(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("sink error: {0}")]
pub struct SinkError(String);

impl SinkError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<sqlx::Error> for SinkError {
    fn from(err: sqlx::Error) -> Self {
        Self(err.to_string())
    }
}

/// Where parsed audit rows land. The trail is append-only.
pub trait AuditSink {
    async fn record(&self, row: &AuditLogRow) -> Result<(), SinkError>;
}

#[derive(Clone)]
pub struct PgSink {
    pool: PgPool,
}

impl PgSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl AuditSink for PgSink {
    async fn record(&self, row: &AuditLogRow) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (id, event_id, timestamp, application_id, schema_id, status,
                 request_type, requested_data, user_id, session_id, auth_method)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(row.event_id)
        .bind(row.timestamp)
        .bind(&row.application_id)
        .bind(&row.schema_id)
        .bind(&row.status)
        .bind(&row.request_type)
        .bind(&row.requested_data)
        .bind(&row.user_id)
        .bind(&row.session_id)
        .bind(&row.auth_method)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_a_complete_exchange_payload() {
        let event_id = Uuid::new_v4();
        let fields = payload(&[
            ("event_id", &event_id.to_string()),
            ("timestamp", "2026-03-01T08:30:00+00:00"),
            ("status", "success"),
            ("consumer_id", "passport-app"),
            ("provider_id", "drp.person.v1"),
            ("request_type", "data_exchange"),
            ("requested_data", r#"["name","email"]"#),
        ]);

        let row = AuditLogRow::from_stream(&fields).unwrap();
        assert_eq!(row.event_id, event_id);
        assert_eq!(row.status, "success");
        assert_eq!(row.application_id.as_deref(), Some("passport-app"));
        assert_eq!(row.schema_id.as_deref(), Some("drp.person.v1"));
        assert_eq!(
            row.requested_data,
            Some(serde_json::json!(["name", "email"]))
        );
        assert_eq!(row.timestamp.to_rfc3339(), "2026-03-01T08:30:00+00:00");
    }

    #[test]
    fn transaction_status_wins_and_is_normalized() {
        let fields = payload(&[
            ("event_id", &Uuid::new_v4().to_string()),
            ("transaction_status", "SUCCESS"),
            ("status", "failure"),
        ]);
        let row = AuditLogRow::from_stream(&fields).unwrap();
        assert_eq!(row.status, "success");
    }

    #[test]
    fn missing_status_is_rejected() {
        let fields = payload(&[("event_id", &Uuid::new_v4().to_string())]);
        assert_eq!(
            AuditLogRow::from_stream(&fields),
            Err(ParseError::MissingField("status"))
        );
    }

    #[test]
    fn unknown_status_is_rejected() {
        let fields = payload(&[
            ("event_id", &Uuid::new_v4().to_string()),
            ("status", "maybe"),
        ]);
        assert_eq!(
            AuditLogRow::from_stream(&fields),
            Err(ParseError::InvalidStatus("maybe".into()))
        );
    }

    #[test]
    fn malformed_event_id_is_rejected() {
        let fields = payload(&[("event_id", "not-a-uuid"), ("status", "success")]);
        assert_eq!(
            AuditLogRow::from_stream(&fields),
            Err(ParseError::InvalidEventId("not-a-uuid".into()))
        );
    }

    #[test]
    fn requested_data_must_be_a_json_array() {
        let fields = payload(&[
            ("event_id", &Uuid::new_v4().to_string()),
            ("status", "success"),
            ("requested_data", "{\"not\":\"an array\"}"),
        ]);
        assert!(matches!(
            AuditLogRow::from_stream(&fields),
            Err(ParseError::InvalidRequestedData(_))
        ));
    }

    #[test]
    fn unparseable_timestamp_falls_back_to_now() {
        let fields = payload(&[
            ("event_id", &Uuid::new_v4().to_string()),
            ("status", "failure"),
            ("timestamp", "last tuesday"),
        ]);
        let row = AuditLogRow::from_stream(&fields).unwrap();
        assert!((Utc::now() - row.timestamp).num_seconds() < 5);
    }
}
