use chrono::{DateTime, Utc};
use opendx_core::policy::{
    AccessControlType, ConsentRequiredField, DecisionRequest, DecisionResponse,
};

use crate::store::{AllowListStore, MetadataStore, StoreError};

#[derive(Debug, thiserror::Error)]
pub enum EvalError {
    #[error("{0}")]
    InvalidArgument(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Answer the three policy questions for one application and field set:
/// is the app authorized for every field, has any grant expired, and does
/// any field need the owner's consent.
///
/// A field with no metadata row is treated as `restricted` with no
/// enrichment. A field whose grant expired is reported only under
/// `expired_fields` — expiry is a refresh signal, so it neither lands in
/// `unauthorized_fields` nor flips `app_authorized`.
pub async fn evaluate<M, A>(
    metadata: &M,
    allow_list: &A,
    request: &DecisionRequest,
    now: DateTime<Utc>,
) -> Result<DecisionResponse, EvalError>
where
    M: MetadataStore,
    A: AllowListStore,
{
    if request.application_id.trim().is_empty() {
        return Err(EvalError::InvalidArgument(
            "applicationId must not be empty".into(),
        ));
    }
    if request.required_fields.is_empty() {
        return Err(EvalError::InvalidArgument(
            "requiredFields must not be empty".into(),
        ));
    }

    let mut unauthorized_fields = Vec::new();
    let mut expired_fields = Vec::new();
    let mut consent_required_fields = Vec::new();

    let mut seen = std::collections::HashSet::new();
    for field in &request.required_fields {
        if !seen.insert((field.schema_id.as_str(), field.field_name.as_str())) {
            continue;
        }

        let record = metadata.field(&field.schema_id, &field.field_name).await?;
        let access = record
            .as_ref()
            .map(|r| r.access_control_type)
            .unwrap_or(AccessControlType::Restricted);

        let entry = allow_list.lookup(&request.application_id, field).await?;
        match entry {
            Some(entry) if entry.is_expired(now) => {
                expired_fields.push(field.clone());
            }
            Some(_) => {}
            None if access == AccessControlType::Public => {}
            None => {
                unauthorized_fields.push(field.clone());
            }
        }

        if access.requires_owner_consent() {
            let record = record.as_ref();
            consent_required_fields.push(ConsentRequiredField {
                schema_id: field.schema_id.clone(),
                field_name: field.field_name.clone(),
                owner: record.and_then(|r| r.owner.clone()),
                display_name: record.and_then(|r| r.display_name.clone()),
                description: record.and_then(|r| r.description.clone()),
            });
        }
    }

    Ok(DecisionResponse {
        app_authorized: unauthorized_fields.is_empty(),
        app_access_expired: !expired_fields.is_empty(),
        app_requires_owner_consent: !consent_required_fields.is_empty(),
        unauthorized_fields,
        expired_fields,
        consent_required_fields,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use opendx_core::policy::{AllowListEntry, FieldRef, PolicyMetadataRecord};
    use std::collections::HashMap;
    use uuid::Uuid;

    #[derive(Default)]
    struct MemMetadata(HashMap<(String, String), PolicyMetadataRecord>);

    impl MemMetadata {
        fn with(mut self, record: PolicyMetadataRecord) -> Self {
            self.0.insert(
                (record.schema_id.clone(), record.field_name.clone()),
                record,
            );
            self
        }
    }

    impl MetadataStore for MemMetadata {
        async fn field(
            &self,
            schema_id: &str,
            field_name: &str,
        ) -> Result<Option<PolicyMetadataRecord>, StoreError> {
            Ok(self
                .0
                .get(&(schema_id.to_string(), field_name.to_string()))
                .cloned())
        }
    }

    #[derive(Default)]
    struct MemAllowList(HashMap<(String, String, String), AllowListEntry>);

    impl MemAllowList {
        fn with(mut self, entry: AllowListEntry) -> Self {
            self.0.insert(
                (
                    entry.application_id.clone(),
                    entry.schema_id.clone(),
                    entry.field_name.clone(),
                ),
                entry,
            );
            self
        }
    }

    impl AllowListStore for MemAllowList {
        async fn lookup(
            &self,
            application_id: &str,
            field: &FieldRef,
        ) -> Result<Option<AllowListEntry>, StoreError> {
            Ok(self
                .0
                .get(&(
                    application_id.to_string(),
                    field.schema_id.clone(),
                    field.field_name.clone(),
                ))
                .cloned())
        }
    }

    fn metadata_record(
        schema_id: &str,
        field_name: &str,
        access: AccessControlType,
    ) -> PolicyMetadataRecord {
        let now = Utc::now();
        PolicyMetadataRecord {
            id: Uuid::new_v4(),
            schema_id: schema_id.into(),
            field_name: field_name.into(),
            source: "drp".into(),
            is_owner: true,
            access_control_type: access,
            owner: Some("citizen".into()),
            display_name: Some(format!("Display {field_name}")),
            description: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn entry(app: &str, schema: &str, field: &str, expires_in: Duration) -> AllowListEntry {
        let now = Utc::now();
        AllowListEntry {
            application_id: app.into(),
            schema_id: schema.into(),
            field_name: field.into(),
            granted_at: now - Duration::hours(1),
            expires_at: now + expires_in,
        }
    }

    fn request(app: &str, fields: &[(&str, &str)]) -> DecisionRequest {
        DecisionRequest {
            application_id: app.into(),
            required_fields: fields
                .iter()
                .map(|(s, f)| FieldRef::new(*s, *f))
                .collect(),
        }
    }

    #[tokio::test]
    async fn public_field_is_authorized_without_any_grant() {
        let metadata =
            MemMetadata::default().with(metadata_record("s1", "name", AccessControlType::Public));
        let allow_list = MemAllowList::default();

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "name")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(decision.app_authorized);
        assert!(!decision.app_access_expired);
        assert!(!decision.app_requires_owner_consent);
        assert!(decision.unauthorized_fields.is_empty());
        assert!(decision.expired_fields.is_empty());
        assert!(decision.consent_required_fields.is_empty());
    }

    #[tokio::test]
    async fn consent_required_field_with_valid_grant_reports_consent() {
        let metadata = MemMetadata::default().with(metadata_record(
            "s1",
            "email",
            AccessControlType::ConsentRequired,
        ));
        let allow_list =
            MemAllowList::default().with(entry("a1", "s1", "email", Duration::days(7)));

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "email")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(decision.app_authorized);
        assert!(decision.app_requires_owner_consent);
        assert_eq!(decision.consent_required_fields.len(), 1);
        let consent = &decision.consent_required_fields[0];
        assert_eq!(consent.field_name, "email");
        assert_eq!(consent.schema_id, "s1");
        assert_eq!(consent.owner.as_deref(), Some("citizen"));
        assert_eq!(consent.display_name.as_deref(), Some("Display email"));
    }

    #[tokio::test]
    async fn unknown_field_is_treated_as_restricted_and_unauthorized() {
        let metadata = MemMetadata::default();
        let allow_list = MemAllowList::default();

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "nic")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(!decision.app_authorized);
        assert_eq!(decision.unauthorized_fields, vec![FieldRef::new("s1", "nic")]);
        assert!(!decision.app_requires_owner_consent);
        assert!(decision.consent_required_fields.is_empty());
    }

    #[tokio::test]
    async fn expired_grant_reports_expired_not_unauthorized() {
        let metadata = MemMetadata::default().with(metadata_record(
            "s1",
            "age",
            AccessControlType::Restricted,
        ));
        let allow_list =
            MemAllowList::default().with(entry("a1", "s1", "age", Duration::seconds(-2)));

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "age")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(decision.app_access_expired);
        assert_eq!(decision.expired_fields, vec![FieldRef::new("s1", "age")]);
        assert!(decision.unauthorized_fields.is_empty());
        assert!(decision.app_authorized);
    }

    #[tokio::test]
    async fn expired_grant_on_unknown_field_still_counts_as_expired_only() {
        // No metadata row at all, but a stale grant exists: the tie-break says
        // report under expired, never double-count as unauthorized.
        let metadata = MemMetadata::default();
        let allow_list =
            MemAllowList::default().with(entry("a1", "s1", "age", Duration::seconds(-2)));

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "age")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(decision.app_access_expired);
        assert_eq!(decision.expired_fields, vec![FieldRef::new("s1", "age")]);
        assert!(decision.unauthorized_fields.is_empty());
    }

    #[tokio::test]
    async fn duplicate_required_fields_are_evaluated_once() {
        let metadata = MemMetadata::default();
        let allow_list = MemAllowList::default();

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "nic"), ("s1", "nic")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert_eq!(decision.unauthorized_fields.len(), 1);
    }

    #[tokio::test]
    async fn owner_only_field_requires_consent() {
        let metadata = MemMetadata::default().with(metadata_record(
            "s1",
            "address",
            AccessControlType::OwnerOnly,
        ));
        let allow_list =
            MemAllowList::default().with(entry("a1", "s1", "address", Duration::days(1)));

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "address")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(decision.app_requires_owner_consent);
    }

    #[tokio::test]
    async fn empty_application_id_is_invalid() {
        let err = evaluate(
            &MemMetadata::default(),
            &MemAllowList::default(),
            &request("", &[("s1", "name")]),
            Utc::now(),
        )
        .await
        .expect_err("empty applicationId must be rejected");
        assert!(matches!(err, EvalError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn empty_field_list_is_invalid() {
        let err = evaluate(
            &MemMetadata::default(),
            &MemAllowList::default(),
            &request("a1", &[]),
            Utc::now(),
        )
        .await
        .expect_err("empty requiredFields must be rejected");
        assert!(matches!(err, EvalError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn mixed_fields_compose_one_decision() {
        let metadata = MemMetadata::default()
            .with(metadata_record("s1", "name", AccessControlType::Public))
            .with(metadata_record(
                "s1",
                "email",
                AccessControlType::ConsentRequired,
            ));
        let allow_list = MemAllowList::default()
            .with(entry("a1", "s1", "email", Duration::days(7)))
            .with(entry("a1", "s1", "age", Duration::seconds(-5)));

        let decision = evaluate(
            &metadata,
            &allow_list,
            &request("a1", &[("s1", "name"), ("s1", "email"), ("s1", "age"), ("s1", "nic")]),
            Utc::now(),
        )
        .await
        .unwrap();

        assert!(!decision.app_authorized);
        assert_eq!(decision.unauthorized_fields, vec![FieldRef::new("s1", "nic")]);
        assert!(decision.app_access_expired);
        assert_eq!(decision.expired_fields, vec![FieldRef::new("s1", "age")]);
        assert!(decision.app_requires_owner_consent);
        assert_eq!(decision.consent_required_fields.len(), 1);
    }
}
