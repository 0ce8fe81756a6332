use crate::error::{AppError, AppResult};
use crate::proxy;
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct CreateContainerRequest {
    pub name: String,
    #[serde(default)]
    pub packages: Vec<String>,
}

#[derive(Serialize)]
pub struct ContainerView {
    pub id: String,
    pub name: Option<String>,
    pub image_digest: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub status: crate::sandbox::SandboxStatus,
    pub memory_limit_mb: u64,
    pub cpu_quota: f64,
}

impl From<crate::sandbox::Sandbox> for ContainerView {
    fn from(s: crate::sandbox::Sandbox) -> Self {
        Self {
            id: s.id,
            name: s.name,
            image_digest: s.image_digest,
            created_at: s.created_at,
            status: s.status,
            memory_limit_mb: s.memory_limit_mb,
            cpu_quota: s.cpu_quota,
        }
    }
}

pub async fn create_container(
    State(state): State<AppState>,
    Json(req): Json<CreateContainerRequest>,
) -> AppResult<Json<ContainerView>> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    if let Some(existing) = state.sandboxes.find_by_name(&req.name) {
        return Ok(Json(existing.into()));
    }

    let tag = state.images.build(&req.packages).await?;
    let digest = crate::image_cache::digest(&req.packages);
    let sandbox = state.sandboxes.get_or_create_reusable(&digest, &tag).await?;
    state.sandboxes.set_name(&sandbox.id, req.name.clone());
    let mut view: ContainerView = sandbox.into();
    view.name = Some(req.name);
    Ok(Json(view))
}

pub async fn list_containers(State(state): State<AppState>) -> Json<Vec<ContainerView>> {
    Json(state.sandboxes.list().into_iter().map(Into::into).collect())
}

pub async fn get_container(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> AppResult<Json<ContainerView>> {
    state.sandboxes.get(&id).map(|s| Json(s.into())).ok_or(AppError::NotFound)
}

pub async fn delete_container(State(state): State<AppState>, Path(id): Path<String>) -> AppResult<()> {
    state.sandboxes.destroy(&id).await?;
    proxy::unregister_for_sandbox(&state.proxy_registry, &id);
    Ok(())
}

pub async fn delete_all_containers(State(state): State<AppState>) -> AppResult<()> {
    let ids: Vec<String> = state.sandboxes.list().into_iter().map(|s| s.id).collect();
    state.sandboxes.cleanup_all().await?;
    for id in ids {
        proxy::unregister_for_sandbox(&state.proxy_registry, &id);
    }
    Ok(())
}
