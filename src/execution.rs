//! Code execution orchestration (§4.3): one-shot runs and web-service launches,
//! both going through the same sandboxed, metered, timeout-bounded path.

use crate::docker;
use crate::error::{AppError, AppResult};
use crate::image_cache::ImageCache;
use crate::proxy::ProxyRegistry;
use crate::sandbox::{Sandbox, SandboxManager};
use crate::webservice::{self, Framework};
use bollard::Docker;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cumulative cgroup/docker-stats counters: reported as the delta between the
/// pre-execution and post-execution reads, not the raw snapshot.
const CUMULATIVE_METRIC_KEYS: &[&str] = &["cpu_usage_usec", "io_read_bytes", "io_write_bytes"];
/// Point-in-time readings: reported as-is from the post-execution snapshot.
const INSTANTANEOUS_METRIC_KEYS: &[&str] = &["memory_peak_bytes", "pids_current"];

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub sandbox_id: String,
    pub execution_time_s: f64,
    pub timed_out: bool,
    pub metrics: HashMap<String, f64>,
    pub exit_code: Option<i64>,
    /// Present only when the run was classified and launched as a web service.
    pub web_service: Option<WebServiceHandle>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WebServiceHandle {
    pub framework: String,
    pub internal_port: u16,
    pub external_port: u16,
}

pub struct ExecutionEngine {
    docker: Arc<Docker>,
    images: Arc<ImageCache>,
    sandboxes: Arc<SandboxManager>,
    proxy_registry: ProxyRegistry,
}

impl ExecutionEngine {
    pub fn new(
        docker: Arc<Docker>,
        images: Arc<ImageCache>,
        sandboxes: Arc<SandboxManager>,
        proxy_registry: ProxyRegistry,
    ) -> Self {
        Self { docker, images, sandboxes, proxy_registry }
    }

    /// Runs `code` with `package_set` installed, subject to `timeout_s`. When `bound_sandbox`
    /// is given, reuses that sandbox instead of the shared reusable-by-digest one — used by
    /// the cron scheduler, webhook router and service supervisor, which each pin a sandbox to
    /// one logical job. Classification happens before sandbox selection: a detected web
    /// service always gets a fresh, port-published sandbox regardless of `bound_sandbox`
    /// (§3 — web services never share the reusable, network-isolated sandbox).
    pub async fn execute(
        &self,
        code: &str,
        package_set: &[String],
        timeout_s: u64,
        bound_sandbox: Option<&str>,
    ) -> AppResult<ExecutionResult> {
        let tag = self.images.build(package_set).await?;
        let digest = crate::image_cache::digest(package_set);

        if let Some(framework) = webservice::detect(code, package_set) {
            let external_port = webservice::allocate_port()?;
            let sandbox = self
                .sandboxes
                .create_web_sandbox(&tag, &digest, (webservice::INTERNAL_PORT, external_port))
                .await?;
            return self.execute_web_service(&sandbox, code, framework).await;
        }

        let sandbox = match bound_sandbox {
            Some(id) => self.sandboxes.get(id).ok_or(AppError::NotFound)?,
            None => self.sandboxes.get_or_create_reusable(&digest, &tag).await?,
        };
        self.execute_one_shot(&sandbox, code, timeout_s).await
    }

    async fn execute_one_shot(
        &self,
        sandbox: &Sandbox,
        code: &str,
        timeout_s: u64,
    ) -> AppResult<ExecutionResult> {
        let lock = self.sandboxes.lock_for(&sandbox.id);
        let _guard = lock.lock().await;

        docker::write_file_b64(&self.docker, &sandbox.id, "/tmp/snippet.py", code).await?;

        let before = self.read_metrics(&sandbox.id).await;
        let started = Instant::now();

        let run = tokio::time::timeout(
            Duration::from_secs(timeout_s),
            docker::exec_capture(&self.docker, &sandbox.id, &["python3", "/tmp/snippet.py"], &[]),
        )
        .await;

        let elapsed = started.elapsed().as_secs_f64();
        let after = self.read_metrics(&sandbox.id).await;
        let metrics = diff_metrics(&before, &after);

        match run {
            Ok(Ok((exit_code, output))) => Ok(ExecutionResult {
                success: exit_code == 0,
                error: if exit_code == 0 { None } else { Some(output.clone()) },
                output,
                sandbox_id: sandbox.id.clone(),
                execution_time_s: elapsed,
                timed_out: false,
                metrics,
                exit_code: Some(exit_code),
                web_service: None,
            }),
            Ok(Err(e)) => Err(AppError::Docker(e)),
            Err(_elapsed) => {
                let _ = docker::exec_capture(
                    &self.docker,
                    &sandbox.id,
                    &["pkill", "-9", "-f", "/tmp/snippet.py"],
                    &[],
                )
                .await;
                Ok(ExecutionResult {
                    success: false,
                    output: String::new(),
                    error: Some(format!("execution exceeded {timeout_s}s timeout")),
                    sandbox_id: sandbox.id.clone(),
                    execution_time_s: elapsed,
                    timed_out: true,
                    metrics,
                    exit_code: None,
                    web_service: None,
                })
            }
        }
    }

    async fn execute_web_service(
        &self,
        sandbox: &Sandbox,
        code: &str,
        framework: Framework,
    ) -> AppResult<ExecutionResult> {
        let (internal_port, external_port) = sandbox
            .port_map
            .ok_or_else(|| AppError::Internal("web-service sandbox missing port map".into()))?;
        let short_id = &sandbox.id[..12.min(sandbox.id.len())];

        let started = Instant::now();
        webservice::launch(&self.docker, &sandbox.id, code, framework, internal_port, short_id).await?;

        let grace = *crate::config::WEB_SERVICE_GRACE_SECONDS;
        let deadline = Instant::now() + Duration::from_secs(grace);
        let mut ready = false;
        while Instant::now() < deadline {
            if webservice::probe_ready(&self.docker, &sandbox.id, internal_port).await.unwrap_or(false) {
                ready = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }

        let elapsed = started.elapsed().as_secs_f64();
        if !ready {
            let log_tail = webservice::tail_log(&self.docker, &sandbox.id, 50).await.unwrap_or_default();
            return Ok(ExecutionResult {
                success: false,
                output: log_tail,
                error: Some(format!("web service did not become ready within {grace}s")),
                sandbox_id: sandbox.id.clone(),
                execution_time_s: elapsed,
                timed_out: true,
                metrics: HashMap::new(),
                exit_code: None,
                web_service: None,
            });
        }

        self.proxy_registry.register(short_id, framework, external_port);

        Ok(ExecutionResult {
            success: true,
            output: format!("{} service listening on internal port {internal_port}", framework.as_str()),
            error: None,
            sandbox_id: sandbox.id.clone(),
            execution_time_s: elapsed,
            timed_out: false,
            metrics: HashMap::new(),
            exit_code: None,
            web_service: Some(WebServiceHandle {
                framework: framework.as_str().to_string(),
                internal_port,
                external_port,
            }),
        })
    }

    /// Reads cgroup v2 `cpu.stat`/`memory.peak` and docker-stats-equivalent counters for a
    /// running sandbox. Missing files (cgroup v1 hosts, or a sandbox that just exited) yield
    /// an empty map rather than an error — metrics are best-effort.
    async fn read_metrics(&self, container_id: &str) -> HashMap<String, f64> {
        let mut metrics = HashMap::new();
        let cmd = "cat /sys/fs/cgroup/cpu.stat 2>/dev/null; echo ---; \
                   cat /sys/fs/cgroup/memory.peak 2>/dev/null; echo ---; \
                   cat /sys/fs/cgroup/io.stat 2>/dev/null; echo ---; \
                   cat /sys/fs/cgroup/pids.current 2>/dev/null";
        let Ok((_exit, out)) =
            docker::exec_capture(&self.docker, container_id, &["sh", "-c", cmd], &[]).await
        else {
            return metrics;
        };

        let mut sections = out.split("---");
        if let Some(cpu_stat) = sections.next() {
            for line in cpu_stat.lines() {
                if let Some(value) = line.strip_prefix("usage_usec ") {
                    if let Ok(v) = value.trim().parse::<f64>() {
                        metrics.insert("cpu_usage_usec".into(), v);
                    }
                }
            }
        }
        if let Some(mem_peak) = sections.next() {
            if let Ok(v) = mem_peak.trim().parse::<f64>() {
                metrics.insert("memory_peak_bytes".into(), v);
            }
        }
        if let Some(io_stat) = sections.next() {
            let mut read_bytes = 0.0;
            let mut write_bytes = 0.0;
            for line in io_stat.lines() {
                for field in line.split_whitespace() {
                    if let Some(v) = field.strip_prefix("rbytes=") {
                        read_bytes += v.parse::<f64>().unwrap_or(0.0);
                    }
                    if let Some(v) = field.strip_prefix("wbytes=") {
                        write_bytes += v.parse::<f64>().unwrap_or(0.0);
                    }
                }
            }
            metrics.insert("io_read_bytes".into(), read_bytes);
            metrics.insert("io_write_bytes".into(), write_bytes);
        }
        if let Some(pids) = sections.next() {
            if let Ok(v) = pids.trim().parse::<f64>() {
                metrics.insert("pids_current".into(), v);
            }
        }
        metrics
    }
}

/// Cumulative keys are reported as `after - before`; instantaneous keys pass through
/// unchanged from the post-execution snapshot.
fn diff_metrics(before: &HashMap<String, f64>, after: &HashMap<String, f64>) -> HashMap<String, f64> {
    let mut result = HashMap::new();
    for key in CUMULATIVE_METRIC_KEYS {
        if let Some(after_v) = after.get(*key) {
            let before_v = before.get(*key).copied().unwrap_or(0.0);
            result.insert(key.to_string(), (after_v - before_v).max(0.0));
        }
    }
    for key in INSTANTANEOUS_METRIC_KEYS {
        if let Some(v) = after.get(*key) {
            result.insert(key.to_string(), *v);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diff_metrics_subtracts_cumulative_and_passes_through_instantaneous() {
        let mut before = HashMap::new();
        before.insert("cpu_usage_usec".to_string(), 1000.0);
        let mut after = HashMap::new();
        after.insert("cpu_usage_usec".to_string(), 1500.0);
        after.insert("memory_peak_bytes".to_string(), 4096.0);

        let diff = diff_metrics(&before, &after);
        assert_eq!(diff.get("cpu_usage_usec"), Some(&500.0));
        assert_eq!(diff.get("memory_peak_bytes"), Some(&4096.0));
    }

    #[test]
    fn diff_metrics_never_goes_negative() {
        let mut before = HashMap::new();
        before.insert("io_read_bytes".to_string(), 900.0);
        let mut after = HashMap::new();
        after.insert("io_read_bytes".to_string(), 100.0);

        let diff = diff_metrics(&before, &after);
        assert_eq!(diff.get("io_read_bytes"), Some(&0.0));
    }
}
