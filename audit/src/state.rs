use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;
use sqlx::PgPool;

use crate::broker::RedisBroker;
use crate::config::Config;

#[derive(Clone)]
pub struct AppState {
    pub db: PgPool,
    pub broker: RedisBroker,
    pub config: Arc<Config>,
    pub metrics: PrometheusHandle,
}
