use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// A (schema, field) pair — the unit of policy lookup and grant accounting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldRef {
    pub schema_id: String,
    pub field_name: String,
}

impl FieldRef {
    pub fn new(schema_id: impl Into<String>, field_name: impl Into<String>) -> Self {
        Self {
            schema_id: schema_id.into(),
            field_name: field_name.into(),
        }
    }
}

impl std::fmt::Display for FieldRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema_id, self.field_name)
    }
}

/// Access class of a field, independent of any consuming application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum AccessControlType {
    Public,
    Restricted,
    ConsentRequired,
    OwnerOnly,
}

impl AccessControlType {
    /// Whether a field of this class needs the data owner's consent before
    /// any provider call is made on its behalf.
    pub fn requires_owner_consent(self) -> bool {
        matches!(self, Self::ConsentRequired | Self::OwnerOnly)
    }

    /// Stable storage / wire form.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Public => "public",
            Self::Restricted => "restricted",
            Self::ConsentRequired => "consent_required",
            Self::OwnerOnly => "owner_only",
        }
    }
}

impl std::str::FromStr for AccessControlType {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "public" => Ok(Self::Public),
            "restricted" => Ok(Self::Restricted),
            "consent_required" => Ok(Self::ConsentRequired),
            "owner_only" => Ok(Self::OwnerOnly),
            other => Err(format!("unknown access control type '{other}'")),
        }
    }
}

/// Per-(schema, field) policy metadata. Created via upsert; id and created_at
/// survive re-upserts of the same field.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyMetadataRecord {
    pub id: Uuid,
    pub schema_id: String,
    pub field_name: String,
    /// Which provider system the field originates from
    pub source: String,
    pub is_owner: bool,
    pub access_control_type: AccessControlType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One field's metadata as submitted to the upsert endpoint.
#[derive(Debug, Clone, Deserialize, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFieldInput {
    pub field_name: String,
    pub source: String,
    pub is_owner: bool,
    pub access_control_type: AccessControlType,
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PutMetadataRequest {
    pub schema_id: String,
    pub records: Vec<PolicyFieldInput>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PutMetadataResponse {
    pub records: Vec<PolicyMetadataRecord>,
}

/// A live grant: application X may read (schema, field) until expires_at.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowListEntry {
    pub application_id: String,
    pub schema_id: String,
    pub field_name: String,
    pub granted_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl AllowListEntry {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpdateAllowListRequest {
    pub application_id: String,
    pub records: Vec<FieldRef>,
    /// Grant lifetime token, e.g. "30d", "12h", "90s"
    pub grant_duration: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AllowListUpdateRecord {
    pub schema_id: String,
    pub field_name: String,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct UpdateAllowListResponse {
    pub records: Vec<AllowListUpdateRecord>,
}

/// Input to the decision evaluator.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRequest {
    pub application_id: String,
    pub required_fields: Vec<FieldRef>,
}

/// A consent-required field enriched with owner-facing metadata so the
/// consent portal can render it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ConsentRequiredField {
    pub schema_id: String,
    pub field_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// The PDP's answer for one application + field set.
///
/// `app_authorized` stays true when the only problem is expiry: expiry is a
/// refresh signal, not a denial, and callers route on `app_access_expired`.
/// A field that is both unknown to the allow-list and expired is impossible;
/// a field whose entry expired is reported only under `expired_fields`.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DecisionResponse {
    pub app_authorized: bool,
    pub unauthorized_fields: Vec<FieldRef>,
    pub app_access_expired: bool,
    pub expired_fields: Vec<FieldRef>,
    pub app_requires_owner_consent: bool,
    pub consent_required_fields: Vec<ConsentRequiredField>,
}

/// Error for grant-duration tokens that don't match `^[0-9]+(s|m|h|d)$`.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("invalid grant duration '{0}', expected <N>s, <N>m, <N>h or <N>d")]
pub struct GrantDurationError(pub String);

/// Parse a grant-duration token from the closed set `<N>(s|m|h|d)`.
pub fn parse_grant_duration(token: &str) -> Result<Duration, GrantDurationError> {
    let err = || GrantDurationError(token.to_string());

    if !token.is_ascii() {
        return Err(err());
    }
    let (digits, unit) = token.split_at(token.len().saturating_sub(1));
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(err());
    }
    let value: i64 = digits.parse().map_err(|_| err())?;

    let seconds_per_unit = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3_600,
        "d" => 86_400,
        _ => return Err(err()),
    };

    value
        .checked_mul(seconds_per_unit)
        .map(Duration::seconds)
        .ok_or_else(err)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_each_duration_unit() {
        assert_eq!(parse_grant_duration("90s").unwrap(), Duration::seconds(90));
        assert_eq!(parse_grant_duration("15m").unwrap(), Duration::minutes(15));
        assert_eq!(parse_grant_duration("12h").unwrap(), Duration::hours(12));
        assert_eq!(parse_grant_duration("30d").unwrap(), Duration::days(30));
    }

    #[test]
    fn rejects_malformed_duration_tokens() {
        for token in ["", "d", "30", "30w", "1.5h", "-3d", "3 d", "h12"] {
            assert_eq!(
                parse_grant_duration(token),
                Err(GrantDurationError(token.to_string())),
                "token {token:?} should be rejected"
            );
        }
    }

    #[test]
    fn rejects_overflowing_duration() {
        assert!(parse_grant_duration("99999999999999999999d").is_err());
    }

    #[test]
    fn expiry_is_inclusive_at_the_boundary() {
        let now = Utc::now();
        let entry = AllowListEntry {
            application_id: "app-1".into(),
            schema_id: "s1".into(),
            field_name: "age".into(),
            granted_at: now - Duration::days(1),
            expires_at: now,
        };
        assert!(entry.is_expired(now));
        assert!(!entry.is_expired(now - Duration::seconds(1)));
    }

    #[test]
    fn decision_response_uses_camel_case_wire_names() {
        let response = DecisionResponse {
            app_authorized: true,
            unauthorized_fields: vec![],
            app_access_expired: false,
            expired_fields: vec![],
            app_requires_owner_consent: true,
            consent_required_fields: vec![ConsentRequiredField {
                schema_id: "s1".into(),
                field_name: "email".into(),
                owner: Some("citizen".into()),
                display_name: None,
                description: None,
            }],
        };
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["appAuthorized"], true);
        assert_eq!(value["appRequiresOwnerConsent"], true);
        assert_eq!(value["consentRequiredFields"][0]["fieldName"], "email");
        assert_eq!(value["consentRequiredFields"][0]["schemaId"], "s1");
    }

    #[test]
    fn access_control_type_consent_classes() {
        assert!(AccessControlType::ConsentRequired.requires_owner_consent());
        assert!(AccessControlType::OwnerOnly.requires_owner_consent());
        assert!(!AccessControlType::Public.requires_owner_consent());
        assert!(!AccessControlType::Restricted.requires_owner_consent());
    }
}
