use crate::db::models::SecretMetadata;
use crate::error::{AppError, AppResult};
use crate::state::AppState;
use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub struct SetEnvRequest {
    pub name: String,
    pub value: String,
    pub description: Option<String>,
}

#[derive(Serialize)]
pub struct EnvValueResponse {
    pub name: String,
    pub value: String,
}

pub async fn set_env(State(state): State<AppState>, Json(req): Json<SetEnvRequest>) -> AppResult<()> {
    if req.name.trim().is_empty() {
        return Err(AppError::Validation("name must not be empty".into()));
    }
    state.vault.set(&req.name, &req.value, req.description.as_deref()).await
}

pub async fn list_env_names(State(state): State<AppState>) -> AppResult<Json<Vec<String>>> {
    Ok(Json(state.vault.list_names().await?))
}

pub async fn get_env_value(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<EnvValueResponse>> {
    let value = state.vault.get(&name).await?.ok_or(AppError::NotFound)?;
    Ok(Json(EnvValueResponse { name, value }))
}

pub async fn delete_env(State(state): State<AppState>, Path(name): Path<String>) -> AppResult<()> {
    if !state.vault.delete(&name).await? {
        return Err(AppError::NotFound);
    }
    Ok(())
}

pub async fn list_env_metadata(State(state): State<AppState>) -> AppResult<Json<Vec<SecretMetadata>>> {
    Ok(Json(state.vault.list_metadata().await?))
}

pub async fn get_env_metadata(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> AppResult<Json<SecretMetadata>> {
    state
        .vault
        .list_metadata()
        .await?
        .into_iter()
        .find(|m| m.name == name)
        .map(Json)
        .ok_or(AppError::NotFound)
}

