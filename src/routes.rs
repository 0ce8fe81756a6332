use axum::{
    routing::{get, post},
    Router,
};

use crate::handlers::{containers, env, execute, health, jobs, logs, proxy_api, services_api, webhook_jobs};
use crate::state::AppState;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .route(
            "/containers",
            get(containers::list_containers).post(containers::create_container).delete(containers::delete_all_containers),
        )
        .route(
            "/containers/:id",
            get(containers::get_container).delete(containers::delete_container),
        )
        .route("/execute", post(execute::execute))
        .route("/jobs", get(jobs::list_jobs).post(jobs::create_job))
        .route("/jobs/:id", get(jobs::get_job).delete(jobs::delete_job))
        .route(
            "/webhook-jobs",
            get(webhook_jobs::list_webhook_jobs).post(webhook_jobs::create_webhook_job),
        )
        .route(
            "/webhook-jobs/:id",
            get(webhook_jobs::get_webhook_job).delete(webhook_jobs::delete_webhook_job),
        )
        .route(
            "/webhook/*path",
            get(webhook_jobs::invoke_webhook)
                .post(webhook_jobs::invoke_webhook)
                .put(webhook_jobs::invoke_webhook)
                .patch(webhook_jobs::invoke_webhook)
                .delete(webhook_jobs::invoke_webhook),
        )
        .route(
            "/services",
            get(services_api::list_services).post(services_api::create_service),
        )
        .route(
            "/services/:id",
            get(services_api::get_service).delete(services_api::delete_service),
        )
        .route("/services/:id/start", post(services_api::start_service))
        .route("/services/:id/stop", post(services_api::stop_service))
        .route("/services/:id/restart", post(services_api::restart_service))
        .route("/services/:id/logs", get(services_api::service_logs))
        .route("/env", post(env::set_env).get(env::list_env_names))
        .route("/env/metadata", get(env::list_env_metadata))
        .route("/env/metadata/:name", get(env::get_env_metadata))
        .route("/env/:name", get(env::get_env_value).delete(env::delete_env))
        .route("/logs", get(logs::list_logs))
        .route("/logs/:id", get(logs::get_log))
        .route("/proxy", get(proxy_api::list_proxies))
        .route(
            "/proxy/:short_id/*rest",
            get(proxy_api::proxy_any)
                .post(proxy_api::proxy_any)
                .put(proxy_api::proxy_any)
                .patch(proxy_api::proxy_any)
                .delete(proxy_api::proxy_any),
        )
}
