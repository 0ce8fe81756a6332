use axum::{routing::get, Router};
use axum_prometheus::PrometheusMetricLayer;
use code_exec_engine::config;
use code_exec_engine::cron_scheduler::CronScheduler;
use code_exec_engine::db::RepositoryStore;
use code_exec_engine::execution::ExecutionEngine;
use code_exec_engine::image_cache::ImageCache;
use code_exec_engine::proxy::ProxyRegistry;
use code_exec_engine::routes::api_routes;
use code_exec_engine::sandbox::SandboxManager;
use code_exec_engine::secrets::SecretsVault;
use code_exec_engine::service_supervisor::ServiceSupervisor;
use code_exec_engine::state::AppState;
use code_exec_engine::webhook_router::WebhookRouter;
use code_exec_engine::docker;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tracing_subscriber::{fmt, EnvFilter};

async fn root() -> &'static str {
    "code execution engine"
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt().with_env_filter(EnvFilter::from_default_env()).json().init();

    dotenvy::dotenv().ok();

    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(5)
        .connect(config::DATABASE_URL.as_str())
        .await?;
    let store = RepositoryStore::new(pool);

    if let Err(error) = store.migrate().await {
        if *config::ALLOW_MIGRATION_FAILURE {
            tracing::warn!(?error, "database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE");
        } else {
            return Err(Box::new(error) as Box<dyn std::error::Error>);
        }
    }

    let docker = Arc::new(docker::connect()?);
    let images = Arc::new(ImageCache::new(docker.clone()));
    let sandboxes = Arc::new(SandboxManager::new(docker.clone()));
    let proxy_registry = ProxyRegistry::new();
    let engine = Arc::new(ExecutionEngine::new(docker.clone(), images.clone(), sandboxes.clone(), proxy_registry.clone()));
    let vault = Arc::new(SecretsVault::new(store.clone()).await?);
    let cron = Arc::new(CronScheduler::new(store.clone(), engine.clone()));
    let webhooks = Arc::new(WebhookRouter::new(store.clone(), engine.clone()));
    let services = Arc::new(ServiceSupervisor::new(store.clone(), images.clone(), sandboxes.clone()));
    let http_client = reqwest::Client::new();

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cron = cron.clone();
        let cancel = cancel.clone();
        async move { cron.run(cancel).await }
    });

    if let Err(error) = services.auto_start_all().await {
        tracing::warn!(?error, "one or more services failed to auto-start");
    }

    let state = AppState {
        store,
        docker,
        images,
        sandboxes,
        engine,
        vault,
        cron,
        webhooks,
        services: services.clone(),
        proxy_registry,
        http_client,
    };

    let cors = if config::ALLOWED_ORIGINS.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<_> = config::ALLOWED_ORIGINS
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(AllowOrigin::list(origins)).allow_methods(tower_http::cors::Any)
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route("/", get(root))
        .route("/metrics", get(move || async move { metrics_handle.render() }))
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT).parse()?;
    tracing::info!(%addr, "listening for incoming connections");

    let shutdown_signal = async move {
        let _ = tokio::signal::ctrl_c().await;
        services.shutdown(cancel).await;
    };

    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    Ok(())
}

