use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use opendx_audit_client::AuditClient;
use tower::ServiceBuilder;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod consent;
mod error;
mod federator;
mod pdp;
mod providers;
mod routes;
mod schema;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "opendx Gateway",
        version = "0.1.0",
        description = "Federated query gateway: policy decisions, consent flows, and per-provider fan-out."
    ),
    paths(
        routes::health::health_check,
        routes::query::federated_query,
        routes::admin::replace_schema,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::query::ConsentPendingResponse,
        opendx_core::error::ApiError,
        opendx_core::policy::FieldRef,
        opendx_core::policy::ConsentRequiredField,
        federator::FederatedQuery,
        federator::FederatedResponse,
        federator::ProviderFailure,
        schema::SchemaMap,
        schema::FieldSource,
    ))
)]
struct ApiDoc;

#[tokio::main]
async fn main() {
    // Load .env if present (dev only)
    let _ = dotenvy::dotenv();

    // Structured JSON logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "opendx_gateway=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install metrics recorder");

    let config = config::Config::from_env();

    let schema_raw = std::fs::read_to_string(&config.schema_file)
        .unwrap_or_else(|err| panic!("Failed to read {}: {err}", config.schema_file));
    let schema = Arc::new(
        schema::SchemaRegistry::from_json(&schema_raw).expect("SCHEMA_FILE is not a valid schema"),
    );

    let providers_raw = std::fs::read_to_string(&config.providers_file)
        .unwrap_or_else(|err| panic!("Failed to read {}: {err}", config.providers_file));
    let providers = Arc::new(
        providers::ProviderRegistry::from_json(&providers_raw)
            .expect("PROVIDERS_FILE is not a valid provider list"),
    );
    if providers.is_empty() {
        tracing::warn!("no providers configured, every federated query will fail");
    }
    tracing::info!(
        providers = providers.len(),
        fields = schema.active().fields.len(),
        "gateway configured"
    );

    let audit = AuditClient::from_env();
    if !audit.is_enabled() {
        tracing::info!("audit client disabled (AUDIT_BASE_URL not set)");
    }

    let federator = Arc::new(federator::Federator::new(
        schema.clone(),
        pdp::PdpClient::new(config.pdp_base_url.clone(), config.pdp_timeout),
        consent::ConsentClient::new(
            config.consent_base_url.clone(),
            config.consent_timeout,
            config.consent_poll_interval,
        ),
        providers,
        audit,
        config.consent_wait,
    ));

    let app_state = state::AppState {
        federator,
        schema,
        metrics: metrics_handle,
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::query::router())
        .merge(routes::admin::router())
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CatchPanicLayer::new()),
        )
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8081);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Gateway listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .expect("Server error");
}
