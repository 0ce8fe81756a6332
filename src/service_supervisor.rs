//! Long-running persistent services (§4.9): a start/monitor/restart state machine layered
//! on top of the same sandboxed execution primitives as one-shot runs and web services.

use crate::db::models::{PersistentService, RestartPolicy, ServiceStatus};
use crate::db::RepositoryStore;
use crate::docker;
use crate::error::AppResult;
use crate::image_cache::ImageCache;
use crate::sandbox::{SandboxManager, SandboxProfile};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use dashmap::DashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const MONITOR_POLL_INTERVAL: Duration = Duration::from_secs(5);
const RESTART_COOL_DOWN: Duration = Duration::from_secs(5);

#[derive(Clone)]
struct RunningHandle {
    sandbox_id: String,
    /// Unique per-launch marker used to target `pkill -f` without relying on a stable exec id.
    marker: String,
}

pub struct ServiceSupervisor {
    store: RepositoryStore,
    images: Arc<ImageCache>,
    sandboxes: Arc<SandboxManager>,
    running: DashMap<i64, RunningHandle>,
    /// External stop requests observed by the monitor loop for each service.
    stop_flags: DashMap<i64, ()>,
}

impl ServiceSupervisor {
    pub fn new(store: RepositoryStore, images: Arc<ImageCache>, sandboxes: Arc<SandboxManager>) -> Self {
        Self { store, images, sandboxes, running: DashMap::new(), stop_flags: DashMap::new() }
    }

    /// Starts every service with `auto_start=true` and `is_active=true`; a failure for one
    /// service is logged and does not block the others or the engine's startup.
    pub async fn auto_start_all(self: &Arc<Self>) -> AppResult<()> {
        let services = self.store.list_auto_start_services().await?;
        for service in services {
            let this = self.clone();
            let id = service.id;
            tokio::spawn(async move {
                if let Err(e) = this.start(id).await {
                    tracing::error!(service_id = id, error = %e, "auto-start failed");
                }
            });
        }
        Ok(())
    }

    pub async fn start(self: &Arc<Self>, id: i64) -> AppResult<()> {
        let service = self.store.get_persistent_service(id).await?.ok_or(crate::error::AppError::NotFound)?;
        self.store.set_service_status(id, ServiceStatus::Starting).await?;

        let tag = self.images.build(&service.package_set).await?;
        let digest = crate::image_cache::digest(&service.package_set);
        let sandbox = match service.bound_sandbox.as_deref() {
            Some(existing) if self.sandboxes.get(existing).is_some() => self.sandboxes.get(existing).unwrap(),
            _ => {
                self.sandboxes
                    .create_with_profile(&tag, &digest, SandboxProfile::service())
                    .await?
            }
        };

        let marker = format!("svc-{id}-{}", &sandbox.id[..8.min(sandbox.id.len())]);
        let script = launch_script(&service.code, &marker);
        docker::write_file_b64(self.sandboxes.docker(), &sandbox.id, "/tmp/service_entry.py", &script).await?;
        docker::exec_detached(self.sandboxes.docker(), &sandbox.id, &["python3", "/tmp/service_entry.py"], &[])
            .await?;

        self.store.mark_service_started(id, &sandbox.id, &marker).await?;
        self.running.insert(id, RunningHandle { sandbox_id: sandbox.id.clone(), marker });
        self.stop_flags.remove(&id);

        let this = self.clone();
        tokio::spawn(async move {
            this.monitor(id).await;
        });
        Ok(())
    }

    pub async fn stop(&self, id: i64) -> AppResult<()> {
        self.stop_flags.insert(id, ());
        if let Some((_, handle)) = self.running.remove(&id) {
            let kill_cmd = format!("pkill -f '{}' || true", handle.marker);
            let _ = docker::exec_capture(
                self.sandboxes.docker(),
                &handle.sandbox_id,
                &["sh", "-c", &kill_cmd],
                &[],
            )
            .await;
        }
        self.store.set_service_status(id, ServiceStatus::Stopped).await?;
        Ok(())
    }

    pub async fn restart(self: &Arc<Self>, id: i64) -> AppResult<()> {
        self.stop(id).await?;
        self.store.mark_service_restarted(id).await?;
        self.start(id).await
    }

    /// Polls sandbox/process liveness until the service stops being `running` for a reason
    /// other than an external stop, then applies the restart policy.
    async fn monitor(self: Arc<Self>, id: i64) {
        loop {
            tokio::time::sleep(MONITOR_POLL_INTERVAL).await;

            if self.stop_flags.contains_key(&id) {
                return;
            }
            let Some(handle) = self.running.get(&id).map(|h| h.clone()) else {
                return;
            };

            let alive = self
                .sandboxes
                .docker()
                .inspect_container(
                    &handle.sandbox_id,
                    None::<bollard::query_parameters::InspectContainerOptions>,
                )
                .await
                .map(|info| info.state.and_then(|s| s.running).unwrap_or(false))
                .unwrap_or(false);
            let process_alive = if alive {
                let check_cmd = format!("pgrep -f '{}' > /dev/null", handle.marker);
                docker::exec_capture(self.sandboxes.docker(), &handle.sandbox_id, &["sh", "-c", &check_cmd], &[])
                    .await
                    .map(|(code, _)| code == 0)
                    .unwrap_or(false)
            } else {
                false
            };

            if alive && process_alive {
                continue;
            }

            if self.stop_flags.contains_key(&id) {
                return;
            }

            self.running.remove(&id);
            let exit_code = if process_alive { 0 } else { 1 };
            let Ok(Some(service)) = self.store.get_persistent_service(id).await else {
                return;
            };
            if let Err(e) = self.store.set_service_status(id, ServiceStatus::Error).await {
                tracing::error!(service_id = id, error = %e, "failed to record service exit");
            }

            let should_restart = match service.restart_policy {
                RestartPolicy::Always => service.is_active,
                RestartPolicy::OnFailure => service.is_active && exit_code != 0,
                RestartPolicy::Never => false,
            };

            if should_restart {
                tokio::time::sleep(RESTART_COOL_DOWN).await;
                if let Err(e) = self.restart(id).await {
                    tracing::error!(service_id = id, error = %e, "restart failed");
                }
            }
            return;
        }
    }

    pub async fn list(&self) -> AppResult<Vec<PersistentService>> {
        self.store.list_persistent_services().await
    }

    pub async fn get(&self, id: i64) -> AppResult<Option<PersistentService>> {
        self.store.get_persistent_service(id).await
    }

    pub async fn shutdown(&self, cancel: CancellationToken) {
        cancel.cancel();
        let ids: Vec<i64> = self.running.iter().map(|e| *e.key()).collect();
        for id in ids {
            let _ = self.stop(id).await;
        }
    }
}

fn launch_script(user_code: &str, marker: &str) -> String {
    let code_b64 = STANDARD.encode(user_code);
    format!(
        "import base64, os, sys\n\
         # {marker}\n\
         os.environ['SERVICE_MARKER'] = '{marker}'\n\
         exec(compile(base64.b64decode('{code_b64}').decode('utf-8'), '<service>', 'exec'))\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_script_embeds_the_marker_for_pkill_targeting() {
        let script = launch_script("print('hi')", "svc-1-abcdef12");
        assert!(script.contains("svc-1-abcdef12"));
    }
}
