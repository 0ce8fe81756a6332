//! Shared application state threaded through every axum handler.

use crate::cron_scheduler::CronScheduler;
use crate::db::RepositoryStore;
use crate::execution::ExecutionEngine;
use crate::image_cache::ImageCache;
use crate::proxy::ProxyRegistry;
use crate::sandbox::SandboxManager;
use crate::secrets::SecretsVault;
use crate::service_supervisor::ServiceSupervisor;
use crate::webhook_router::WebhookRouter;
use bollard::Docker;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: RepositoryStore,
    pub docker: Arc<Docker>,
    pub images: Arc<ImageCache>,
    pub sandboxes: Arc<SandboxManager>,
    pub engine: Arc<ExecutionEngine>,
    pub vault: Arc<SecretsVault>,
    pub cron: Arc<CronScheduler>,
    pub webhooks: Arc<WebhookRouter>,
    pub services: Arc<ServiceSupervisor>,
    pub proxy_registry: ProxyRegistry,
    pub http_client: reqwest::Client,
}
