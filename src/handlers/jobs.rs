use crate::db::models::{CreateScheduledJob, ScheduledJob};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;

pub async fn create_job(
    State(state): State<AppState>,
    Json(input): Json<CreateScheduledJob>,
) -> AppResult<Json<ScheduledJob>> {
    let job = state.store.create_scheduled_job(&input).await?;
    state.cron.reload().await?;
    Ok(Json(job))
}

pub async fn list_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<ScheduledJob>>> {
    Ok(Json(state.store.list_scheduled_jobs().await?))
}

pub async fn get_job(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<ScheduledJob>> {
    state.store.get_scheduled_job(id).await?.map(Json).ok_or(AppError::NotFound)
}

pub async fn delete_job(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    if !state.store.delete_scheduled_job(id).await? {
        return Err(AppError::NotFound);
    }
    state.cron.reload().await
}
