use std::sync::Arc;

use metrics_exporter_prometheus::PrometheusHandle;

use crate::federator::Federator;
use crate::schema::SchemaRegistry;

#[derive(Clone)]
pub struct AppState {
    pub federator: Arc<Federator>,
    pub schema: Arc<SchemaRegistry>,
    pub metrics: PrometheusHandle,
}
