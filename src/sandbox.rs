//! Hardened sandbox lifecycle (§4.2).

use crate::error::{AppError, AppResult};
use bollard::container::{Config as ContainerConfig, CreateContainerOptions, RemoveContainerOptions};
use bollard::models::{HostConfig, PortBinding};
use bollard::Docker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Running,
    Stopped,
    Gone,
}

#[derive(Debug, Clone, Serialize)]
pub struct Sandbox {
    pub id: String,
    pub image_digest: String,
    pub created_at: DateTime<Utc>,
    pub status: SandboxStatus,
    pub memory_limit_mb: u64,
    pub cpu_quota: f64,
    /// internal -> external port, present only for web-service sandboxes.
    pub port_map: Option<(u16, u16)>,
    /// User-facing label set via `POST /containers`; absent for sandboxes created implicitly
    /// (reusable-by-digest, job-bound, service-bound).
    pub name: Option<String>,
}

/// Resource profile applied at container creation. Defaults sit at the upper end of the
/// 256-512 MiB / 0.25-0.5 CPU range specified for one-shot and web-service sandboxes;
/// persistent services use the lighter profile (see `SandboxProfile::service`).
#[derive(Debug, Clone, Copy)]
pub struct SandboxProfile {
    pub memory_mb: u64,
    pub cpu_quota: f64,
    pub pids_limit: i64,
    pub nofile: u64,
    pub nproc: u64,
}

impl SandboxProfile {
    pub fn default_profile() -> Self {
        Self { memory_mb: 512, cpu_quota: 0.5, pids_limit: 50, nofile: 512, nproc: 25 }
    }

    pub fn service() -> Self {
        Self { memory_mb: 256, cpu_quota: 0.25, pids_limit: 50, nofile: 512, nproc: 25 }
    }
}

pub struct SandboxManager {
    docker: Arc<Docker>,
    /// digest -> sandbox id, for non-web reuse.
    reusable: DashMap<String, String>,
    /// all sandboxes this manager has created, by id.
    sandboxes: DashMap<String, Sandbox>,
    /// serialises executions against the same reusable sandbox (§5 ordering guarantee).
    exec_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SandboxManager {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            reusable: DashMap::new(),
            sandboxes: DashMap::new(),
            exec_locks: DashMap::new(),
        }
    }

    pub fn get(&self, id: &str) -> Option<Sandbox> {
        self.sandboxes.get(id).map(|s| s.clone())
    }

    pub fn list(&self) -> Vec<Sandbox> {
        self.sandboxes.iter().map(|e| e.value().clone()).collect()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Sandbox> {
        self.sandboxes.iter().find(|e| e.value().name.as_deref() == Some(name)).map(|e| e.value().clone())
    }

    pub fn set_name(&self, id: &str, name: String) {
        if let Some(mut entry) = self.sandboxes.get_mut(id) {
            entry.name = Some(name);
        }
    }

    pub fn lock_for(&self, sandbox_id: &str) -> Arc<Mutex<()>> {
        self.exec_locks
            .entry(sandbox_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// One persistent, tail-sleeping sandbox per digest, created on first use and reused
    /// thereafter.
    pub async fn get_or_create_reusable(&self, digest: &str, image_tag: &str) -> AppResult<Sandbox> {
        if let Some(id) = self.reusable.get(digest) {
            if let Some(sandbox) = self.sandboxes.get(id.as_str()) {
                if self
                    .docker
                    .inspect_container(
                        &sandbox.id,
                        None::<bollard::query_parameters::InspectContainerOptions>,
                    )
                    .await
                    .is_ok()
                {
                    return Ok(sandbox.clone());
                }
            }
        }
        let sandbox = self
            .create(image_tag, digest, SandboxProfile::default_profile(), None)
            .await?;
        self.reusable.insert(digest.to_string(), sandbox.id.clone());
        Ok(sandbox)
    }

    /// Always allocates a fresh sandbox, published on `internal:external`.
    pub async fn create_web_sandbox(
        &self,
        image_tag: &str,
        digest: &str,
        port_map: (u16, u16),
    ) -> AppResult<Sandbox> {
        self.create(image_tag, digest, SandboxProfile::default_profile(), Some(port_map))
            .await
    }

    pub async fn create_with_profile(
        &self,
        image_tag: &str,
        digest: &str,
        profile: SandboxProfile,
    ) -> AppResult<Sandbox> {
        self.create(image_tag, digest, profile, None).await
    }

    async fn create(
        &self,
        image_tag: &str,
        digest: &str,
        profile: SandboxProfile,
        port_map: Option<(u16, u16)>,
    ) -> AppResult<Sandbox> {
        let mut port_bindings = HashMap::new();
        let mut exposed_ports = HashMap::new();
        let network_mode = if let Some((internal, external)) = port_map {
            let key = format!("{internal}/tcp");
            exposed_ports.insert(key.clone(), HashMap::new());
            port_bindings.insert(
                key,
                Some(vec![PortBinding {
                    host_ip: Some("0.0.0.0".into()),
                    host_port: Some(external.to_string()),
                }]),
            );
            "bridge"
        } else {
            "none"
        };

        let seccomp_opt = crate::config::SECCOMP_PROFILE_PATH.as_ref().and_then(|path| {
            match std::fs::read_to_string(path) {
                Ok(profile_json) => Some(format!("seccomp={profile_json}")),
                Err(e) => {
                    tracing::warn!(path, error = %e, "failed to read seccomp profile, falling back to the docker daemon default");
                    None
                }
            }
        });
        let apparmor_opt = crate::config::APPARMOR_PROFILE.as_ref().map(|p| format!("apparmor={p}"));

        let build_config = |apparmor: Option<&str>| {
            let mut security_opt = vec!["no-new-privileges:true".to_string()];
            security_opt.extend(seccomp_opt.clone());
            security_opt.extend(apparmor.map(|a| a.to_string()));

            let host_config = HostConfig {
                memory: Some((profile.memory_mb * 1024 * 1024) as i64),
                nano_cpus: Some((profile.cpu_quota * 1_000_000_000.0) as i64),
                pids_limit: Some(profile.pids_limit),
                cap_drop: Some(vec!["ALL".into()]),
                cap_add: Some(vec!["SETUID".into(), "SETGID".into()]),
                security_opt: Some(security_opt),
                readonly_rootfs: Some(true),
                tmpfs: Some(HashMap::from([
                    ("/tmp".to_string(), "rw,noexec,nosuid,size=100m".to_string()),
                    ("/var/tmp".to_string(), "rw,noexec,nosuid,size=50m".to_string()),
                ])),
                network_mode: Some(network_mode.into()),
                port_bindings: if port_map.is_some() { Some(port_bindings.clone()) } else { None },
                ulimits: Some(vec![
                    bollard::models::ResourcesUlimits {
                        name: Some("nofile".into()),
                        soft: Some(profile.nofile as i64),
                        hard: Some(profile.nofile as i64),
                    },
                    bollard::models::ResourcesUlimits {
                        name: Some("nproc".into()),
                        soft: Some(profile.nproc as i64),
                        hard: Some(profile.nproc as i64),
                    },
                ]),
                ..Default::default()
            };

            ContainerConfig::<String> {
                image: Some(image_tag.to_string()),
                cmd: Some(vec!["tail".into(), "-f".into(), "/dev/null".into()]),
                user: Some("1000:1000".into()),
                exposed_ports: if port_map.is_some() { Some(exposed_ports.clone()) } else { None },
                host_config: Some(host_config),
                ..Default::default()
            }
        };

        // AppArmor support varies by host distro; if the daemon rejects the profile, retry
        // once with it dropped rather than failing the whole sandbox.
        let container = match self
            .docker
            .create_container(None::<CreateContainerOptions<String>>, build_config(apparmor_opt.as_deref()))
            .await
        {
            Ok(c) => c,
            Err(e) if apparmor_opt.is_some() && e.to_string().to_lowercase().contains("apparmor") => {
                tracing::warn!(error = %e, "apparmor profile unavailable on this host, retrying without it");
                self.docker
                    .create_container(None::<CreateContainerOptions<String>>, build_config(None))
                    .await
                    .map_err(|e| AppError::SandboxCreateFailed(e.to_string()))?
            }
            Err(e) => return Err(AppError::SandboxCreateFailed(e.to_string())),
        };

        self.docker
            .start_container(&container.id, None::<bollard::container::StartContainerOptions<String>>)
            .await
            .map_err(|e| AppError::SandboxCreateFailed(e.to_string()))?;

        let sandbox = Sandbox {
            id: container.id.clone(),
            image_digest: digest.to_string(),
            created_at: Utc::now(),
            status: SandboxStatus::Running,
            memory_limit_mb: profile.memory_mb,
            cpu_quota: profile.cpu_quota,
            port_map,
            name: None,
        };
        self.sandboxes.insert(container.id, sandbox.clone());
        Ok(sandbox)
    }

    /// Stops, removes, and evicts `sandbox_id` from both caches. Idempotent: destroying an
    /// already-gone sandbox is a no-op success.
    pub async fn destroy(&self, sandbox_id: &str) -> AppResult<()> {
        match self
            .docker
            .remove_container(
                sandbox_id,
                Some(RemoveContainerOptions { force: true, ..Default::default() }),
            )
            .await
        {
            Ok(()) => {}
            Err(bollard::errors::Error::DockerResponseServerError { status_code: 404, .. }) => {}
            Err(e) => return Err(AppError::Docker(e)),
        }
        self.sandboxes.remove(sandbox_id);
        self.reusable.retain(|_, v| v != sandbox_id);
        self.exec_locks.remove(sandbox_id);
        Ok(())
    }

    pub async fn cleanup_all(&self) -> AppResult<()> {
        let ids: Vec<String> = self.sandboxes.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.destroy(&id).await?;
        }
        Ok(())
    }

    pub fn docker(&self) -> &Arc<Docker> {
        &self.docker
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_profile_matches_upper_bound() {
        let p = SandboxProfile::default_profile();
        assert_eq!(p.memory_mb, 512);
        assert_eq!(p.cpu_quota, 0.5);
    }

    #[test]
    fn service_profile_is_lighter() {
        let p = SandboxProfile::service();
        assert!(p.memory_mb < SandboxProfile::default_profile().memory_mb);
    }
}
