use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use utoipa::ToSchema;

use opendx_audit_client::AuditClient;
use opendx_core::audit::{DataExchangeEvent, EventStatus};
use opendx_core::policy::{ConsentRequiredField, DecisionRequest, FieldRef};

use crate::consent::{ConsentClient, ConsentError, ConsentStatus};
use crate::pdp::{PdpClient, PdpError};
use crate::providers::ProviderRegistry;
use crate::schema::{ResolvedField, SchemaRegistry};

/// A federated query as the public endpoint receives it.
#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct FederatedQuery {
    pub application_id: String,
    /// Consumer-facing field names from the active schema
    pub fields: Vec<String>,
    /// Data owner the query is made on behalf of
    #[serde(default)]
    pub owner_id: Option<String>,
    /// Handle of a previously opened consent, if the caller is retrying
    #[serde(default)]
    pub consent_id: Option<String>,
}

/// One provider's failure inside an otherwise successful response.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ProviderFailure {
    pub provider: String,
    pub code: String,
    pub message: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct FederatedResponse {
    #[schema(value_type = Object)]
    pub data: serde_json::Map<String, serde_json::Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<ProviderFailure>,
}

/// What a federated query produced: data (possibly partial) or a consent
/// hand-off the caller must complete first.
#[derive(Debug)]
pub enum FederationOutcome {
    Data(FederatedResponse),
    ConsentPending {
        consent_id: Option<String>,
        portal_url: Option<String>,
        fields: Vec<ConsentRequiredField>,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("{message}")]
    InvalidQuery { message: String },
    #[error("application is not authorized for the requested fields")]
    PermissionDenied { fields: Vec<FieldRef> },
    #[error("application access has expired for some requested fields")]
    AccessExpired { fields: Vec<FieldRef> },
    #[error("owner consent was not granted")]
    ConsentDenied {
        status: ConsentStatus,
        fields: Vec<ConsentRequiredField>,
    },
    #[error("upstream unavailable: {0}")]
    Upstream(String),
}

impl From<PdpError> for FederationError {
    fn from(err: PdpError) -> Self {
        FederationError::Upstream(err.to_string())
    }
}

impl From<ConsentError> for FederationError {
    fn from(err: ConsentError) -> Self {
        FederationError::Upstream(err.to_string())
    }
}

struct Partition {
    provider_key: String,
    schema_id: String,
    fields: Vec<ResolvedField>,
}

/// Orchestrates one federated query: schema resolution, policy decision,
/// consent, per-provider fan-out, aggregation, and audit.
pub struct Federator {
    schema: Arc<SchemaRegistry>,
    pdp: PdpClient,
    consent: ConsentClient,
    providers: Arc<ProviderRegistry>,
    audit: AuditClient,
    /// How long a freshly created consent is polled for a fast approval
    /// before the query returns CONSENT_PENDING. Zero returns immediately.
    consent_wait: Duration,
}

impl Federator {
    pub fn new(
        schema: Arc<SchemaRegistry>,
        pdp: PdpClient,
        consent: ConsentClient,
        providers: Arc<ProviderRegistry>,
        audit: AuditClient,
        consent_wait: Duration,
    ) -> Self {
        Self {
            schema,
            pdp,
            consent,
            providers,
            audit,
            consent_wait,
        }
    }

    /// Run the full federation state machine. Cancelling the caller's
    /// request drops this future, which aborts any in-flight provider
    /// sub-requests with it.
    pub async fn execute(
        &self,
        query: FederatedQuery,
    ) -> Result<FederationOutcome, FederationError> {
        if query.application_id.trim().is_empty() {
            return Err(FederationError::InvalidQuery {
                message: "applicationId must not be empty".into(),
            });
        }
        if query.fields.is_empty() {
            return Err(FederationError::InvalidQuery {
                message: "fields must not be empty".into(),
            });
        }

        let resolved =
            self.schema
                .resolve(&query.fields)
                .map_err(|err| FederationError::InvalidQuery {
                    message: err.to_string(),
                })?;

        let decision = self
            .pdp
            .decide(&DecisionRequest {
                application_id: query.application_id.clone(),
                required_fields: resolved
                    .iter()
                    .map(|field| {
                        FieldRef::new(field.source.schema_id.clone(), field.consumer_field.clone())
                    })
                    .collect(),
            })
            .await?;

        if !decision.app_authorized {
            return Err(FederationError::PermissionDenied {
                fields: decision.unauthorized_fields,
            });
        }
        if decision.app_access_expired {
            return Err(FederationError::AccessExpired {
                fields: decision.expired_fields,
            });
        }

        if decision.app_requires_owner_consent {
            match self.resolve_consent(&query, &decision.consent_required_fields).await? {
                ConsentGate::Proceed => {}
                ConsentGate::Pending {
                    consent_id,
                    portal_url,
                    fields,
                } => {
                    return Ok(FederationOutcome::ConsentPending {
                        consent_id,
                        portal_url,
                        fields: fields.unwrap_or(decision.consent_required_fields),
                    });
                }
                ConsentGate::Denied(status) => {
                    return Err(FederationError::ConsentDenied {
                        status,
                        fields: decision.consent_required_fields,
                    });
                }
            }
        }

        self.fan_out(&query, resolved).await
    }

    /// Drive the consent gate: check an existing consent handle if the
    /// caller presented one, otherwise open a new consent request.
    async fn resolve_consent(
        &self,
        query: &FederatedQuery,
        fields: &[ConsentRequiredField],
    ) -> Result<ConsentGate, FederationError> {
        if let Some(consent_id) = &query.consent_id {
            let status = self.consent.status(consent_id).await?;
            return Ok(match status {
                ConsentStatus::Approved => ConsentGate::Proceed,
                ConsentStatus::Pending => ConsentGate::Pending {
                    consent_id: Some(consent_id.clone()),
                    portal_url: None,
                    fields: None,
                },
                other => ConsentGate::Denied(other),
            });
        }

        let record = self
            .consent
            .create(&query.application_id, query.owner_id.as_deref(), fields)
            .await?;

        // Grace window for owners who approve right away; zero skips the poll.
        let status = if record.status == ConsentStatus::Pending && !self.consent_wait.is_zero() {
            self.consent
                .await_decision(&record.consent_id, self.consent_wait)
                .await?
        } else {
            record.status
        };

        Ok(match status {
            ConsentStatus::Approved => ConsentGate::Proceed,
            ConsentStatus::Pending => ConsentGate::Pending {
                consent_id: Some(record.consent_id),
                portal_url: record.consent_portal_url,
                fields: if record.fields.is_empty() {
                    None
                } else {
                    Some(record.fields)
                },
            },
            other => ConsentGate::Denied(other),
        })
    }

    /// Partition authorized fields by provider, dispatch concurrently, and
    /// re-key each provider's response to the consumer-facing field names.
    async fn fan_out(
        &self,
        query: &FederatedQuery,
        resolved: Vec<ResolvedField>,
    ) -> Result<FederationOutcome, FederationError> {
        let mut partitions: HashMap<String, Partition> = HashMap::new();
        for field in resolved {
            partitions
                .entry(field.source.provider.clone())
                .or_insert_with(|| Partition {
                    provider_key: field.source.provider.clone(),
                    schema_id: field.source.schema_id.clone(),
                    fields: Vec::new(),
                })
                .fields
                .push(field);
        }
        let partition_count = partitions.len();

        let mut data = serde_json::Map::new();
        let mut errors = Vec::new();

        let mut set: JoinSet<Result<serde_json::Value, crate::providers::DispatchError>> =
            JoinSet::new();
        let mut in_flight: HashMap<tokio::task::Id, Partition> = HashMap::new();

        for (provider_key, partition) in partitions {
            let Some(handle) = self.providers.get(&provider_key) else {
                self.emit_audit(query, &partition, EventStatus::Failure);
                errors.push(ProviderFailure {
                    provider: provider_key,
                    code: opendx_core::error::codes::UPSTREAM_UNAVAILABLE.into(),
                    message: "provider is not configured".into(),
                });
                continue;
            };

            let body = serde_json::json!({
                "fields": partition
                    .fields
                    .iter()
                    .map(|f| f.source.provider_field.clone())
                    .collect::<Vec<_>>(),
            });
            let abort = set.spawn(async move { handle.dispatch(&body).await });
            in_flight.insert(abort.id(), partition);
        }

        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, result)) => {
                    let Some(partition) = in_flight.remove(&id) else {
                        continue;
                    };
                    match result {
                        Ok(body) => {
                            self.emit_audit(query, &partition, EventStatus::Success);
                            for field in &partition.fields {
                                let value = body
                                    .get(&field.source.provider_field)
                                    .cloned()
                                    .unwrap_or(serde_json::Value::Null);
                                data.insert(field.consumer_field.clone(), value);
                            }
                        }
                        Err(err) => {
                            self.emit_audit(query, &partition, EventStatus::Failure);
                            tracing::warn!(
                                provider = %partition.provider_key,
                                error = %err,
                                "provider sub-request failed"
                            );
                            errors.push(ProviderFailure {
                                provider: partition.provider_key,
                                code: opendx_core::error::codes::UPSTREAM_UNAVAILABLE.into(),
                                message: err.to_string(),
                            });
                        }
                    }
                }
                Err(join_err) => {
                    // A panicking sub-request must not take the query down.
                    let partition = in_flight.remove(&join_err.id());
                    let provider = partition
                        .as_ref()
                        .map(|p| p.provider_key.clone())
                        .unwrap_or_else(|| "unknown".into());
                    if let Some(partition) = &partition {
                        self.emit_audit(query, partition, EventStatus::Failure);
                    }
                    tracing::error!(
                        provider = %provider,
                        error = %join_err,
                        "provider sub-request panicked"
                    );
                    errors.push(ProviderFailure {
                        provider,
                        code: opendx_core::error::codes::INTERNAL.into(),
                        message: "provider sub-request failed internally".into(),
                    });
                }
            }
        }

        metrics::counter!(
            "gateway_provider_dispatches_total",
            "outcome" => if errors.is_empty() { "success" } else { "partial" }
        )
        .increment(partition_count as u64);

        if !errors.is_empty() && data.is_empty() {
            return Err(FederationError::Upstream(
                "all providers failed for this query".into(),
            ));
        }

        Ok(FederationOutcome::Data(FederatedResponse { data, errors }))
    }

    /// One data-exchange audit event per provider schema touched.
    fn emit_audit(&self, query: &FederatedQuery, partition: &Partition, status: EventStatus) {
        let event = DataExchangeEvent {
            event_id: None,
            timestamp: None,
            consumer_app_id: query.application_id.clone(),
            provider_schema_id: partition.schema_id.clone(),
            consumer_id: None,
            provider_id: Some(partition.provider_key.clone()),
            actor_user_id: None,
            on_behalf_of_owner_id: query.owner_id.clone(),
            requested_fields: partition
                .fields
                .iter()
                .map(|f| f.consumer_field.clone())
                .collect(),
            status,
        };
        if let Err(err) = self.audit.log_data_exchange(event) {
            tracing::warn!(error = %err, "exchange audit event rejected");
        }
    }
}

enum ConsentGate {
    Proceed,
    Pending {
        consent_id: Option<String>,
        portal_url: Option<String>,
        /// Field list echoed by the consent engine, when it supplies one
        fields: Option<Vec<ConsentRequiredField>>,
    },
    Denied(ConsentStatus),
}
