use crate::db::models::{CreatePersistentService, PersistentService};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::webservice;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};

pub async fn create_service(
    State(state): State<AppState>,
    Json(input): Json<CreatePersistentService>,
) -> AppResult<Json<PersistentService>> {
    let auto_start = input.auto_start;
    let service = state.store.create_persistent_service(&input).await?;
    if auto_start {
        let services = state.services.clone();
        let id = service.id;
        tokio::spawn(async move {
            if let Err(e) = services.start(id).await {
                tracing::error!(service_id = id, error = %e, "failed to start service after create");
            }
        });
    }
    Ok(Json(service))
}

pub async fn list_services(State(state): State<AppState>) -> AppResult<Json<Vec<PersistentService>>> {
    Ok(Json(state.services.list().await?))
}

pub async fn get_service(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<PersistentService>> {
    state.services.get(id).await?.map(Json).ok_or(AppError::NotFound)
}

pub async fn delete_service(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    let _ = state.services.stop(id).await;
    if !state.store.delete_persistent_service(id).await? {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn start_service(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    state.services.start(id).await
}

pub async fn stop_service(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    state.services.stop(id).await
}

pub async fn restart_service(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    state.services.restart(id).await
}

#[derive(Deserialize)]
pub struct LogsQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    100
}

pub async fn service_logs(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<LogsQuery>,
) -> AppResult<Json<Value>> {
    let service = state.services.get(id).await?.ok_or(AppError::NotFound)?;
    let Some(sandbox_id) = service.bound_sandbox else {
        return Ok(Json(json!({ "status": "stopped" })));
    };
    if service.status != crate::db::models::ServiceStatus::Running {
        return Ok(Json(json!({ "status": "stopped" })));
    }
    let log = webservice::tail_log(&state.docker, &sandbox_id, query.limit).await?;
    Ok(Json(json!({ "status": "running", "log": log })))
}
