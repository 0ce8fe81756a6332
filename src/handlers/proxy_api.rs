use crate::error::AppResult;
use crate::proxy;
use crate::state::AppState;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Single entry point for both plain HTTP and WebSocket-upgrade requests under
/// `/proxy/<short_id>/<rest>` — axum can't register two handlers on the same
/// method+path, so an upgrade request is detected by its extractor and routed
/// to the WebSocket relay before falling through to the HTTP forwarder.
pub async fn proxy_any(
    ws: Option<WebSocketUpgrade>,
    state: State<AppState>,
    path: Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    if let Some(ws) = ws {
        let Path((short_id, rest)) = path;
        let registry = state.0.proxy_registry.clone();
        return Ok(ws.on_upgrade(move |socket| proxy::relay_websocket(socket, registry, short_id, rest)).into_response());
    }
    proxy_http(state, path, method, headers, body).await
}

#[derive(Serialize)]
pub struct ActiveProxyEntry {
    pub short_id: String,
    pub framework: String,
    pub url: String,
}

pub async fn list_proxies(State(state): State<AppState>) -> Json<Vec<ActiveProxyEntry>> {
    let backend_url = crate::config::BACKEND_URL.as_str();
    let entries = state
        .sandboxes
        .list()
        .into_iter()
        .filter_map(|s| {
            let short_id = s.id.get(..12)?.to_string();
            let target = state.proxy_registry.get(&short_id)?;
            Some(ActiveProxyEntry {
                url: format!("{backend_url}/proxy/{short_id}/"),
                short_id,
                framework: target.framework.as_str().to_string(),
            })
        })
        .collect();
    Json(entries)
}

pub async fn proxy_http(
    State(state): State<AppState>,
    Path((short_id, rest)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> AppResult<Response> {
    let (status, resp_headers, resp_body) =
        proxy::forward_http(&state.proxy_registry, &state.http_client, &short_id, &rest, method, headers, body)
            .await?;
    let mut response = (StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY), resp_body)
        .into_response();
    *response.headers_mut() = resp_headers;
    Ok(response)
}


