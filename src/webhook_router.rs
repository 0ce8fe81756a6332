//! Dynamic webhook dispatch (§4.8): matches `/webhook/<rest>` to an active
//! `WebhookJob` and runs its code with the inbound request wrapped as `request_data`.

use crate::db::models::{LogParent, LogStatus, WebhookJob};
use crate::db::{NewExecutionLog, RepositoryStore};
use crate::error::{AppError, AppResult};
use crate::execution::ExecutionEngine;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;

pub struct WebhookRouter {
    store: RepositoryStore,
    engine: Arc<ExecutionEngine>,
}

pub struct WebhookRequest {
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub query_params: Vec<(String, String)>,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl WebhookRouter {
    pub fn new(store: RepositoryStore, engine: Arc<ExecutionEngine>) -> Self {
        Self { store, engine }
    }

    /// Runs the job's code through the same sandbox-selection and web-service classification
    /// rules as any other execution path (§4.8 step 5), then extracts the JSON response a
    /// plain webhook wrapper prints on its last stdout line.
    pub async fn dispatch(&self, path: &str, request: WebhookRequest) -> AppResult<Value> {
        let endpoint = format!("/{}", path.trim_start_matches('/'));
        let job = self
            .store
            .get_webhook_job_by_endpoint(&endpoint)
            .await?
            .ok_or(AppError::NotFound)?;

        let request_data = build_request_data(&request);
        let started_at = Utc::now();

        let wrapper = build_wrapper_script(&job.code, &request_data);
        // -1 means "no timeout"; the engine only takes a u64 bound, so map it to the largest
        // representable one rather than special-casing an unbounded exec path.
        let timeout_s: u64 = if job.timeout_s < 0 { u64::MAX } else { job.timeout_s as u64 };

        let exec_result = self
            .engine
            .execute(&wrapper, &job.package_set, timeout_s, job.bound_sandbox.as_deref())
            .await;

        let execution_time_s = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;

        let (status, response_data, log_error, sandbox_id) = match exec_result {
            Ok(result) => match &result.web_service {
                Some(handle) if result.success => (
                    LogStatus::Success,
                    json!({ "message": "webhook launched a web service", "web_service": handle }),
                    None,
                    Some(result.sandbox_id.clone()),
                ),
                Some(_) => {
                    let err = result.error.clone().unwrap_or_else(|| "web service failed to start".into());
                    (LogStatus::Error, json!({ "error": err.clone() }), Some(err), Some(result.sandbox_id.clone()))
                }
                None => match extract_last_json_object(&result.output) {
                    Some(parsed) if result.success => (LogStatus::Success, parsed, None, Some(result.sandbox_id.clone())),
                    Some(parsed) => {
                        let err = parsed.get("error").and_then(|v| v.as_str()).map(|s| s.to_string());
                        (LogStatus::Error, parsed.clone(), err, Some(result.sandbox_id.clone()))
                    }
                    None => {
                        let err = format!("webhook exited {:?} with no parsable JSON response", result.exit_code);
                        (LogStatus::Error, json!({ "error": err.clone() }), Some(err), Some(result.sandbox_id.clone()))
                    }
                },
            },
            Err(e) => {
                let err = e.to_string();
                (LogStatus::Error, json!({ "error": err.clone() }), Some(err), None)
            }
        };

        if let Err(e) = self
            .store
            .insert_log(NewExecutionLog {
                parent: LogParent::Webhook(job.id),
                code: &job.code,
                output: None,
                error: log_error.as_deref(),
                sandbox_id: sandbox_id.as_deref(),
                execution_time_s,
                started_at,
                status,
                request_data: Some(request_data),
                response_data: Some(response_data.clone()),
                metrics: None,
            })
            .await
        {
            tracing::error!(job_id = job.id, error = %e, "failed to record webhook execution log");
        }

        if let Err(e) = self.store.touch_webhook_last_triggered(job.id).await {
            tracing::error!(job_id = job.id, error = %e, "failed to update last_triggered");
        }

        if status == LogStatus::Success {
            Ok(response_data)
        } else {
            Err(AppError::Internal(
                response_data.get("error").and_then(|v| v.as_str()).unwrap_or("webhook execution failed").to_string(),
            ))
        }
    }

    pub async fn get_job(&self, id: i64) -> AppResult<Option<WebhookJob>> {
        self.store.get_webhook_job(id).await
    }
}

fn build_request_data(request: &WebhookRequest) -> Value {
    let body = match request.content_type.as_deref() {
        Some(ct) if ct.contains("application/json") => {
            serde_json::from_slice(&request.body).unwrap_or(Value::Null)
        }
        Some(ct) if ct.contains("application/x-www-form-urlencoded") => {
            let pairs: Vec<(String, String)> = url::form_urlencoded::parse(&request.body)
                .into_owned()
                .collect();
            json!(pairs.into_iter().collect::<std::collections::HashMap<_, _>>())
        }
        _ => json!(String::from_utf8_lossy(&request.body)),
    };

    json!({
        "method": request.method,
        "headers": request.headers.iter().cloned().collect::<std::collections::HashMap<_, _>>(),
        "query_params": request.query_params.iter().cloned().collect::<std::collections::HashMap<_, _>>(),
        "body": body,
    })
}

/// Wraps the user code so `request_data` is pre-populated and `response_data` defaults to a
/// success object; the wrapper prints `response_data` as JSON on the final stdout line.
fn build_wrapper_script(user_code: &str, request_data: &Value) -> String {
    let request_b64 = STANDARD.encode(request_data.to_string());
    let user_code_b64 = STANDARD.encode(user_code);
    format!(
        "import base64, json, sys, traceback\n\
         from datetime import datetime, timezone\n\n\
         request_data = json.loads(base64.b64decode('{request_b64}').decode('utf-8'))\n\
         response_data = {{\"message\": \"Webhook executed successfully\", \"timestamp\": datetime.now(timezone.utc).isoformat()}}\n\n\
         _user_code = base64.b64decode('{user_code_b64}').decode('utf-8')\n\
         try:\n\
         \x20\x20exec(compile(_user_code, '<webhook>', 'exec'), {{'request_data': request_data, 'response_data': response_data}})\n\
         except Exception as exc:\n\
         \x20\x20response_data = {{\"error\": str(exc), \"timestamp\": datetime.now(timezone.utc).isoformat()}}\n\
         \x20\x20traceback.print_exc(file=sys.stderr)\n\n\
         print(json.dumps(response_data))\n"
    )
}

/// Scans stdout from the end for the last line matching `^\{.*\}$` and parses it as JSON.
fn extract_last_json_object(stdout: &str) -> Option<Value> {
    stdout
        .lines()
        .rev()
        .find_map(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with('{') && trimmed.ends_with('}') {
                serde_json::from_str(trimmed).ok()
            } else {
                None
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_last_json_line_ignoring_earlier_log_noise() {
        let stdout = "starting up\n{\"partial\": true}\nsome traceback line\n{\"message\": \"ok\"}\n";
        let parsed = extract_last_json_object(stdout).unwrap();
        assert_eq!(parsed["message"], "ok");
    }

    #[test]
    fn no_json_line_returns_none() {
        assert!(extract_last_json_object("just text\nmore text\n").is_none());
    }

    #[test]
    fn request_data_parses_json_body() {
        let req = WebhookRequest {
            method: "POST".into(),
            headers: vec![],
            query_params: vec![],
            content_type: Some("application/json".into()),
            body: br#"{"a":1}"#.to_vec(),
        };
        let data = build_request_data(&req);
        assert_eq!(data["body"]["a"], 1);
    }
}
