use crate::db::models::{CreateWebhookJob, WebhookJob};
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use crate::webhook_router::WebhookRequest;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method};
use axum::Json;
use serde_json::Value;
use std::collections::HashMap;

pub async fn create_webhook_job(
    State(state): State<AppState>,
    Json(input): Json<CreateWebhookJob>,
) -> AppResult<Json<WebhookJob>> {
    Ok(Json(state.store.create_webhook_job(&input).await?))
}

pub async fn list_webhook_jobs(State(state): State<AppState>) -> AppResult<Json<Vec<WebhookJob>>> {
    Ok(Json(state.store.list_webhook_jobs().await?))
}

pub async fn get_webhook_job(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<Json<WebhookJob>> {
    state.store.get_webhook_job(id).await?.map(Json).ok_or(AppError::NotFound)
}

pub async fn delete_webhook_job(State(state): State<AppState>, Path(id): Path<i64>) -> AppResult<()> {
    if !state.store.delete_webhook_job(id).await? {
        return Err(AppError::NotFound);
    }
    Ok(())
}

/// Invocation surface: `ALL /webhook/{path...}`.
pub async fn invoke_webhook(
    State(state): State<AppState>,
    Path(path): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(query_params): Query<HashMap<String, String>>,
    body: Bytes,
) -> AppResult<Json<Value>> {
    let content_type = headers.get("content-type").and_then(|v| v.to_str().ok()).map(|s| s.to_string());
    let header_pairs = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), v.to_string())))
        .collect();

    let request = WebhookRequest {
        method: method.to_string(),
        headers: header_pairs,
        query_params: query_params.into_iter().collect(),
        content_type,
        body: body.to_vec(),
    };

    let response = state.webhooks.dispatch(&path, request).await?;
    Ok(Json(response))
}
