//! In-process reverse proxy for web-service sandboxes (§4.5). Routes
//! `/proxy/<short_id>/<rest>` to the matching container's published port, with
//! per-framework path rewriting and a WebSocket relay.

use crate::error::{AppError, AppResult};
use crate::webservice::Framework;
use axum::extract::ws::{Message as AxumMessage, WebSocket};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message as TtMessage;

const RETRY_ATTEMPTS: u32 = 3;
const RETRY_INITIAL_DELAY: Duration = Duration::from_millis(1000);
const RETRY_BACKOFF: f64 = 1.5;
const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

const STATIC_PATTERNS: &[&str] = &["static", "_stcore", "_dash-component-suites", "favicon.ico", "manifest.json"];

/// Tracks which running web service owns each short id, so the proxy can resolve both
/// `/proxy/<id>/...` and unprefixed static-asset fallbacks.
#[derive(Clone)]
pub struct ProxyRegistry {
    services: Arc<DashMap<String, ProxyTarget>>,
}

#[derive(Clone)]
pub struct ProxyTarget {
    pub short_id: String,
    pub framework: Framework,
    pub external_port: u16,
    pub last_active: std::time::Instant,
}

impl ProxyRegistry {
    pub fn new() -> Self {
        Self { services: Arc::new(DashMap::new()) }
    }

    pub fn register(&self, short_id: &str, framework: Framework, external_port: u16) {
        self.services.insert(
            short_id.to_string(),
            ProxyTarget { short_id: short_id.to_string(), framework, external_port, last_active: std::time::Instant::now() },
        );
    }

    pub fn unregister(&self, short_id: &str) {
        self.services.remove(short_id);
    }

    pub fn get(&self, short_id: &str) -> Option<ProxyTarget> {
        self.services.get(short_id).map(|e| {
            let mut v = e.value().clone();
            v.last_active = std::time::Instant::now();
            v
        })
    }

    /// Most recently active service whose framework claims `first_segment` as a static
    /// asset pattern it owns.
    pub fn resolve_static_fallback(&self, first_segment: &str) -> Option<ProxyTarget> {
        if !STATIC_PATTERNS.iter().any(|p| first_segment.starts_with(p)) {
            return None;
        }
        self.services
            .iter()
            .filter(|e| claims_static(e.value().framework, first_segment))
            .max_by_key(|e| e.value().last_active)
            .map(|e| e.value().clone())
    }
}

fn claims_static(framework: Framework, segment: &str) -> bool {
    match framework {
        Framework::Streamlit => matches!(segment, "_stcore" | "static" | "favicon.ico" | "manifest.json"),
        Framework::Dash => segment.starts_with("_dash-"),
        _ => false,
    }
}

/// Strips or preserves the `/proxy/<short_id>` prefix per framework, per §4.5's table.
fn rewrite_http_path(framework: Framework, short_id: &str, rest: &str) -> String {
    match framework {
        Framework::Dash => {
            let prefix = format!("/proxy/{short_id}");
            let full = format!("{prefix}/{rest}");
            if full == prefix {
                format!("{prefix}/")
            } else {
                full
            }
        }
        _ => format!("/{rest}"),
    }
}

fn rewrite_ws_paths(framework: Framework, short_id: &str, rest: &str) -> (String, Option<String>) {
    match framework {
        Framework::Dash => (rewrite_http_path(framework, short_id, rest), None),
        Framework::Streamlit => (format!("/{rest}"), Some(format!("/proxy/{short_id}/{rest}"))),
        _ => (format!("/{rest}"), None),
    }
}

fn host_alias_candidates(external_port: u16) -> Vec<String> {
    let mut candidates = Vec::new();
    if let Some(host) = crate::config::DOCKER_HOST.as_ref() {
        if let Some(stripped) = host.strip_prefix("tcp://").or_else(|| host.strip_prefix("http://")) {
            if let Some(hostname) = stripped.split(':').next() {
                candidates.push(format!("{hostname}:{external_port}"));
            }
        }
    }
    candidates.push(format!("172.17.0.1:{external_port}"));
    candidates.push(format!("localhost:{external_port}"));
    candidates.push(format!("127.0.0.1:{external_port}"));
    candidates
}

const DROP_REQUEST_HEADERS: &[&str] = &["host", "proxy-connection", "accept-encoding"];
const DROP_RESPONSE_HEADERS: &[&str] = &["content-encoding", "transfer-encoding"];

/// Forwards an HTTP request to the web service registered under `short_id`, retrying each
/// host alias up to `RETRY_ATTEMPTS` times with exponential backoff before moving to the
/// next candidate.
pub async fn forward_http(
    registry: &ProxyRegistry,
    client: &reqwest::Client,
    short_id: &str,
    rest: &str,
    method: Method,
    mut headers: HeaderMap,
    body: bytes::Bytes,
) -> AppResult<(StatusCode, HeaderMap, bytes::Bytes)> {
    let target = registry.get(short_id).ok_or(AppError::NotFound)?;
    let path = rewrite_http_path(target.framework, short_id, rest);

    for name in DROP_REQUEST_HEADERS {
        headers.remove(*name);
    }
    headers.insert(
        HeaderName::from_static("x-real-ip"),
        HeaderValue::from_static("127.0.0.1"),
    );
    headers.insert(
        HeaderName::from_static("x-forwarded-for"),
        HeaderValue::from_static("127.0.0.1"),
    );
    headers.insert(
        HeaderName::from_static("x-forwarded-proto"),
        HeaderValue::from_static("http"),
    );

    let mut last_err: Option<AppError> = None;
    for alias in host_alias_candidates(target.external_port) {
        let url = format!("http://{alias}{path}");
        let mut delay = RETRY_INITIAL_DELAY;
        for attempt in 0..RETRY_ATTEMPTS {
            let mut req = client.request(method.clone(), &url).headers(headers.clone());
            if !body.is_empty() {
                req = req.body(body.clone());
            }
            match tokio::time::timeout(Duration::from_secs(10), req.send()).await {
                Ok(Ok(resp)) => {
                    let status = resp.status();
                    let mut resp_headers = resp.headers().clone();
                    for name in DROP_RESPONSE_HEADERS {
                        resp_headers.remove(*name);
                    }
                    let resp_body = resp.bytes().await.unwrap_or_default();
                    return Ok((status, resp_headers, resp_body));
                }
                Ok(Err(e)) => {
                    last_err = Some(AppError::ServiceUnreachable(e.to_string()));
                }
                Err(_) => {
                    last_err = Some(AppError::UpstreamTimeout);
                }
            }
            if attempt + 1 < RETRY_ATTEMPTS {
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(delay.as_secs_f64() * RETRY_BACKOFF);
            }
        }
    }

    Err(last_err.unwrap_or(AppError::ServiceUnreachable("no host alias reachable".into())))
}

/// Accepts the client WebSocket upgrade, connects to the upstream service, and relays
/// frames bidirectionally until either side closes.
pub async fn relay_websocket(client_socket: WebSocket, registry: ProxyRegistry, short_id: String, rest: String) {
    let Some(target) = registry.get(&short_id) else {
        let _ = client_socket.close().await;
        return;
    };

    let (primary, fallback) = rewrite_ws_paths(target.framework, &short_id, &rest);
    let mut upstream = None;
    for path in std::iter::once(primary).chain(fallback) {
        for alias in host_alias_candidates(target.external_port) {
            let url = format!("ws://{alias}{path}");
            let mut request = match url.into_client_request() {
                Ok(r) => r,
                Err(_) => continue,
            };
            let req_headers = request.headers_mut();
            req_headers.insert("Origin", HeaderValue::from_static("http://localhost"));
            req_headers.insert("X-Real-IP", HeaderValue::from_static("127.0.0.1"));
            req_headers.insert("X-Forwarded-For", HeaderValue::from_static("127.0.0.1"));
            req_headers.insert("X-Forwarded-Proto", HeaderValue::from_static("http"));
            req_headers.insert("User-Agent", HeaderValue::from_static("code-exec-engine-proxy/1.0"));

            match tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, tokio_tungstenite::connect_async(request)).await {
                Ok(Ok((stream, _resp))) => {
                    upstream = Some(stream);
                    break;
                }
                _ => continue,
            }
        }
        if upstream.is_some() {
            break;
        }
    }

    let Some(upstream) = upstream else {
        let _ = client_socket.close().await;
        return;
    };

    let (mut up_tx, mut up_rx) = upstream.split();
    let (mut client_tx, mut client_rx) = client_socket.split();

    let client_to_upstream = async {
        while let Some(Ok(msg)) = client_rx.next().await {
            let forwarded = match msg {
                AxumMessage::Text(t) => Some(TtMessage::Text(t)),
                AxumMessage::Binary(b) => Some(TtMessage::Binary(b)),
                AxumMessage::Close(_) => None,
                _ => continue,
            };
            match forwarded {
                Some(m) => {
                    if up_tx.send(m).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = up_tx.close().await;
    };

    let upstream_to_client = async {
        while let Some(Ok(msg)) = up_rx.next().await {
            let forwarded = match msg {
                TtMessage::Text(t) => Some(AxumMessage::Text(t)),
                TtMessage::Binary(b) => Some(AxumMessage::Binary(b)),
                TtMessage::Close(_) => None,
                _ => continue,
            };
            match forwarded {
                Some(m) => {
                    if client_tx.send(m).await.is_err() {
                        break;
                    }
                }
                None => break,
            }
        }
        let _ = client_tx.close().await;
    };

    tokio::join!(client_to_upstream, upstream_to_client);
}

use tokio_tungstenite::tungstenite::client::IntoClientRequest;

/// Drops a sandbox's published port registration once its container is gone; called by
/// `SandboxManager::destroy` callers so the static-asset fallback never routes to a dead
/// container. `short_id` is a pure truncation of `sandbox_id`, so this needs no live sandbox
/// lookup — calling it after the sandbox is already removed still unregisters correctly, and
/// unregistering an id that was never registered is a no-op.
pub fn unregister_for_sandbox(registry: &ProxyRegistry, sandbox_id: &str) {
    let short_id = &sandbox_id[..12.min(sandbox_id.len())];
    registry.unregister(short_id);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dash_preserves_prefix_and_enforces_trailing_slash() {
        assert_eq!(rewrite_http_path(Framework::Dash, "abc123", ""), "/proxy/abc123/");
        assert_eq!(rewrite_http_path(Framework::Dash, "abc123", "_dash-layout"), "/proxy/abc123/_dash-layout");
    }

    #[test]
    fn streamlit_strips_prefix() {
        assert_eq!(rewrite_http_path(Framework::Streamlit, "abc123", "_stcore/health"), "/_stcore/health");
    }

    #[test]
    fn streamlit_claims_stcore_static_pattern() {
        assert!(claims_static(Framework::Streamlit, "_stcore"));
        assert!(!claims_static(Framework::Fastapi, "_stcore"));
    }

    #[test]
    fn dash_claims_dash_component_suites() {
        assert!(claims_static(Framework::Dash, "_dash-component-suites"));
    }
}
