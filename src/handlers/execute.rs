use crate::error::{AppError, AppResult};
use crate::execution::ExecutionResult;
use crate::state::AppState;
use axum::extract::State;
use axum::Json;
use serde::Deserialize;

const DEFAULT_TIMEOUT_S: u64 = 30;

#[derive(Deserialize)]
pub struct ExecuteRequest {
    pub code: Option<String>,
    #[serde(default)]
    pub packages: Vec<String>,
    pub timeout: Option<u64>,
    pub container_id: Option<String>,
    pub job_id: Option<i64>,
}

pub async fn execute(
    State(state): State<AppState>,
    Json(req): Json<ExecuteRequest>,
) -> AppResult<Json<ExecutionResult>> {
    let (code, packages, timeout) = match (req.code, req.job_id) {
        (Some(code), _) => (code, req.packages, req.timeout.unwrap_or(DEFAULT_TIMEOUT_S)),
        (None, Some(job_id)) => {
            let job = state.store.get_scheduled_job(job_id).await?.ok_or(AppError::NotFound)?;
            (job.code, job.package_set, req.timeout.unwrap_or(job.timeout_s.max(1) as u64))
        }
        (None, None) => {
            return Err(AppError::Validation("either code or job_id must be provided".into()));
        }
    };

    let result = state.engine.execute(&code, &packages, timeout, req.container_id.as_deref()).await?;
    Ok(Json(result))
}
