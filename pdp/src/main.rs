use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use opendx_audit_client::AuditClient;
use opendx_core::policy::parse_grant_duration;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod decision;
mod error;
mod purge;
mod routes;
mod state;
mod store;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "opendx Policy Decision Point",
        version = "0.1.0",
        description = "Field-level access policy metadata, per-application allow-lists, and access decisions."
    ),
    paths(
        routes::health::health_check,
        routes::policy::put_metadata,
        routes::policy::list_metadata,
        routes::policy::update_allowlist,
        routes::policy::decide,
    ),
    components(schemas(
        routes::health::HealthResponse,
        opendx_core::error::ApiError,
        opendx_core::policy::FieldRef,
        opendx_core::policy::AccessControlType,
        opendx_core::policy::PolicyMetadataRecord,
        opendx_core::policy::PolicyFieldInput,
        opendx_core::policy::PutMetadataRequest,
        opendx_core::policy::PutMetadataResponse,
        opendx_core::policy::UpdateAllowListRequest,
        opendx_core::policy::UpdateAllowListResponse,
        opendx_core::policy::AllowListUpdateRecord,
        opendx_core::policy::DecisionRequest,
        opendx_core::policy::DecisionResponse,
        opendx_core::policy::ConsentRequiredField,
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
                .unwrap_or_else(|_| "opendx_pdp=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install metrics recorder");

    // Database connection
    let database_url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to database");

    // Run migrations
    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("Failed to run migrations");

    let audit = AuditClient::from_env();
    if !audit.is_enabled() {
        tracing::info!("audit client disabled (AUDIT_BASE_URL not set)");
    }

    let shutdown = CancellationToken::new();

    let purge_interval = std::env::var("ALLOW_LIST_PURGE_INTERVAL_SECS")
        .ok()
        .and_then(|v| v.parse().ok())
        .map(Duration::from_secs)
        .unwrap_or(Duration::from_secs(3600));
    let retention = std::env::var("ALLOW_LIST_RETENTION")
        .map(|v| parse_grant_duration(&v).expect("ALLOW_LIST_RETENTION must be <N>(s|m|h|d)"))
        .unwrap_or_else(|_| chrono::Duration::days(30));
    let purge_task = purge::spawn(pool.clone(), purge_interval, retention, shutdown.clone());

    let app_state = state::AppState {
        db: pool,
        audit,
        metrics: metrics_handle,
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::policy::router())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8082);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("PDP listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind listen address");

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            serve_shutdown.cancel();
        })
        .await
        .expect("Server error");

    shutdown.cancel();
    let _ = purge_task.await;
}
