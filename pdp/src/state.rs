use metrics_exporter_prometheus::PrometheusHandle;
use opendx_audit_client::AuditClient;
use sqlx::PgPool;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub audit: AuditClient,
    pub metrics: PrometheusHandle,
}
