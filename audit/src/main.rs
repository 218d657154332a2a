use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use metrics_exporter_prometheus::PrometheusBuilder;
use sqlx::postgres::PgPoolOptions;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use crate::broker::{RedisBroker, StreamBroker};

mod broker;
mod config;
mod consumer;
mod error;
mod routes;
mod sink;
mod state;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "opendx Audit Pipeline",
        version = "0.1.0",
        description = "At-least-once audit event ingestion: HTTP ingress, stream, consumer group, relational sink."
    ),
    paths(
        routes::health::health_check,
        routes::ingest::ingest_exchange,
        routes::ingest::ingest_management,
    ),
    components(schemas(
        routes::health::HealthResponse,
        routes::ingest::IngestResponse,
        opendx_core::error::ApiError,
        opendx_core::audit::DataExchangeEvent,
        opendx_core::audit::ManagementEvent,
        opendx_core::audit::EventStatus,
        opendx_core::audit::ManagementEventType,
        opendx_core::audit::Actor,
        opendx_core::audit::ActorType,
        opendx_core::audit::ActorRole,
        opendx_core::audit::Target,
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
                .unwrap_or_else(|_| "opendx_audit=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    let metrics_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install metrics recorder");

    let config = config::Config::from_env();
    tracing::info!(
        stream = %config.stream,
        group = %config.group,
        dlq = %config.dlq_stream,
        consumer = %config.consumer_name,
        "audit pipeline configured"
    );

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

    // Stream broker connection + consumer group
    let redis_url = std::env::var("REDIS_URL").expect("REDIS_URL must be set");
    let broker = RedisBroker::connect(&redis_url)
        .await
        .expect("Failed to connect to stream broker");
    broker
        .ensure_group(&config.stream, &config.group)
        .await
        .expect("Failed to create consumer group");

    let shutdown = CancellationToken::new();
    let config = Arc::new(config);

    // Consumer worker draining the stream into the relational sink
    let worker = consumer::Consumer::new(
        broker.clone(),
        sink::PgSink::new(pool.clone()),
        (*config).clone(),
    );
    let consumer_shutdown = shutdown.clone();
    let consumer_task = tokio::spawn(async move { worker.run(consumer_shutdown).await });

    let app_state = state::AppState {
        db: pool,
        broker,
        config,
        metrics: metrics_handle,
    };

    let app = Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .merge(routes::health::router())
        .merge(routes::ingest::router())
        .layer(TraceLayer::new_for_http())
        .with_state(app_state);

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8083);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("Audit service listening on {}", addr);

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

    // Let the consumer drain its in-flight message before exit.
    shutdown.cancel();
    let _ = consumer_task.await;
}
