//! Content-addressed cache of sandbox images (§4.1).

use crate::error::{AppError, AppResult};
use bollard::image::BuildImageOptions;
use bollard::Docker;
use dashmap::DashMap;
use futures_util::StreamExt;
use md5::{Digest, Md5};
use std::sync::Arc;
use tokio::sync::Mutex;

pub const BASE_TAG: &str = "base";

/// Computes the image digest for a sorted-deduped package set: the first 12 hex characters
/// of the MD5 hash over the packages joined by `-`. An empty set maps to the reserved `"base"` tag.
pub fn digest(packages: &[String]) -> String {
    let mut unique: Vec<&str> = packages.iter().map(|s| s.as_str()).collect();
    unique.sort_unstable();
    unique.dedup();
    if unique.is_empty() {
        return BASE_TAG.to_string();
    }
    let joined = unique.join("-");
    let mut hasher = Md5::new();
    hasher.update(joined.as_bytes());
    let full = hex::encode(hasher.finalize());
    full[..12].to_string()
}

pub struct ImageCache {
    docker: Arc<Docker>,
    image_prefix: String,
    /// One mutex per in-flight digest build; callers block on the same build instead of
    /// re-issuing it (§4.1 coalescing requirement).
    build_locks: DashMap<String, Arc<Mutex<()>>>,
    /// Tags already confirmed present, so a repeat `build` for the same digest is a no-op.
    built: DashMap<String, ()>,
}

impl ImageCache {
    pub fn new(docker: Arc<Docker>) -> Self {
        Self {
            docker,
            image_prefix: crate::config::SANDBOX_IMAGE_PREFIX.clone(),
            build_locks: DashMap::new(),
            built: DashMap::new(),
        }
    }

    pub fn tag_for(&self, digest: &str) -> String {
        format!("{}:{}", self.image_prefix, digest)
    }

    /// Builds the canonical base image if it is not already present. Called lazily before
    /// any package-layer build.
    pub async fn ensure_base(&self) -> AppResult<()> {
        let base_tag = self.tag_for(BASE_TAG);
        if self.built.contains_key(BASE_TAG) {
            return Ok(());
        }
        if self.docker.inspect_image(&base_tag).await.is_ok() {
            self.built.insert(BASE_TAG.to_string(), ());
            return Ok(());
        }
        let dockerfile = "FROM python:3.11-slim\n\
            RUN useradd -m -u 1000 codeuser\n\
            WORKDIR /tmp\n\
            USER codeuser\n";
        self.build_image(&base_tag, dockerfile).await?;
        self.built.insert(BASE_TAG.to_string(), ());
        Ok(())
    }

    /// Returns the image tag for `packages`, building it on miss. Idempotent and safe under
    /// concurrent callers for the same digest.
    pub async fn build(&self, packages: &[String]) -> AppResult<String> {
        self.ensure_base().await?;
        let digest = digest(packages);
        if digest == BASE_TAG {
            return Ok(self.tag_for(BASE_TAG));
        }

        let lock = self
            .build_locks
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        let tag = self.tag_for(&digest);
        if self.built.contains_key(&digest) || self.docker.inspect_image(&tag).await.is_ok() {
            self.built.insert(digest.clone(), ());
            return Ok(tag);
        }

        let mut unique: Vec<&str> = packages.iter().map(|s| s.as_str()).collect();
        unique.sort_unstable();
        unique.dedup();
        let dockerfile = format!(
            "FROM {}\nUSER root\nRUN pip install --no-cache-dir {}\nUSER codeuser\n",
            self.tag_for(BASE_TAG),
            unique.join(" ")
        );

        self.build_image(&tag, &dockerfile).await?;
        self.built.insert(digest, ());
        Ok(tag)
    }

    async fn build_image(&self, tag: &str, dockerfile: &str) -> AppResult<()> {
        let tar_data = build_tar_context(dockerfile)
            .map_err(|e| AppError::ImageBuildFailed(format!("failed to build tar context: {e}")))?;

        let options = BuildImageOptions::<String> {
            dockerfile: "Dockerfile".into(),
            t: tag.into(),
            pull: true,
            rm: true,
            forcerm: true,
            ..Default::default()
        };

        let mut stream = self.docker.build_image(
            options,
            None,
            Some(bollard::body_full(bytes::Bytes::from(tar_data))),
        );
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(info) => {
                    if let Some(error) = info.error {
                        return Err(AppError::ImageBuildFailed(error));
                    }
                    if let Some(stream_line) = info.stream {
                        tracing::debug!(tag, "{}", stream_line.trim_end());
                    }
                }
                Err(e) => return Err(AppError::ImageBuildFailed(e.to_string())),
            }
        }
        Ok(())
    }
}

fn build_tar_context(dockerfile: &str) -> std::io::Result<Vec<u8>> {
    let mut builder = tar::Builder::new(Vec::new());
    let bytes = dockerfile.as_bytes();
    let mut header = tar::Header::new_gnu();
    header.set_size(bytes.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, "Dockerfile", bytes)?;
    builder.into_inner()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_order_independent() {
        let a = digest(&["numpy".into(), "pandas".into()]);
        let b = digest(&["pandas".into(), "numpy".into()]);
        assert_eq!(a, b);
        assert_eq!(a.len(), 12);
    }

    #[test]
    fn digest_dedupes() {
        let a = digest(&["numpy".into(), "numpy".into()]);
        let b = digest(&["numpy".into()]);
        assert_eq!(a, b);
    }

    #[test]
    fn empty_package_set_is_base() {
        assert_eq!(digest(&[]), BASE_TAG);
    }
}
