use crate::db::models::ExecutionLog;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use axum::extract::{Path, Query, State};
use axum::Json;
use serde::Deserialize;

#[derive(Deserialize)]
pub struct ListLogsQuery {
    pub job_id: Option<i64>,
    pub webhook_job_id: Option<i64>,
    #[serde(default = "default_limit")]
    pub limit: i64,
    #[serde(default)]
    pub offset: i64,
}

fn default_limit() -> i64 {
    50
}

pub async fn list_logs(
    State(state): State<AppState>,
    Query(query): Query<ListLogsQuery>,
) -> AppResult<Json<Vec<ExecutionLog>>> {
    Ok(Json(
        state.store.list_logs(query.job_id, query.webhook_job_id, query.limit, query.offset).await?,
    ))
}

pub async fn get_log(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<ExecutionLog>> {
    state.store.get_log(id).await?.map(Json).ok_or(AppError::NotFound)
}
