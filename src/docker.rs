//! Thin helpers around `bollard` shared by the image cache, sandbox manager,
//! execution engine, web-service supervisor and service supervisor.
//!
//! User code never touches a shell string directly: every helper here either
//! takes already-base64-encoded payloads or base64-encodes them itself before
//! composing the exec command, per the code-injection hygiene rule.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::Docker;
use futures_util::StreamExt;

pub fn connect() -> Result<Docker, bollard::errors::Error> {
    match crate::config::DOCKER_HOST.as_ref() {
        Some(host) => Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION),
        None => Docker::connect_with_local_defaults(),
    }
}

/// Base64-encodes `payload` and writes it to `path` inside the container via a decode pipe,
/// never interpolating the raw bytes into the shell command line.
pub async fn write_file_b64(
    docker: &Docker,
    container_id: &str,
    path: &str,
    payload: &str,
) -> Result<(), bollard::errors::Error> {
    let encoded = STANDARD.encode(payload);
    let cmd = format!("echo '{encoded}' | base64 -d > {path}");
    let (exit_code, _out) = exec_capture(docker, container_id, &["sh", "-c", &cmd], &[]).await?;
    if exit_code != 0 {
        tracing::warn!(container_id, path, exit_code, "writing file into sandbox failed");
    }
    Ok(())
}

/// Runs a command to completion and returns `(exit_code, combined stdout+stderr)`.
pub async fn exec_capture(
    docker: &Docker,
    container_id: &str,
    cmd: &[&str],
    env: &[String],
) -> Result<(i64, String), bollard::errors::Error> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd.to_vec()),
                env: Some(env.iter().map(|s| s.as_str()).collect()),
                attach_stdout: Some(true),
                attach_stderr: Some(true),
                ..Default::default()
            },
        )
        .await?;

    let mut output = String::new();
    if let StartExecResults::Attached { output: mut stream, .. } =
        docker.start_exec(&exec.id, None::<StartExecOptions>).await?
    {
        while let Some(Ok(chunk)) = stream.next().await {
            output.push_str(&chunk.to_string());
        }
    }

    let inspect = docker.inspect_exec(&exec.id).await?;
    Ok((inspect.exit_code.unwrap_or(-1), output))
}

/// Starts a command detached (fire-and-forget) inside the container, returning the exec id
/// so callers can later `pkill` a tagged marker or inspect the exec for completion.
pub async fn exec_detached(
    docker: &Docker,
    container_id: &str,
    cmd: &[&str],
    env: &[String],
) -> Result<String, bollard::errors::Error> {
    let exec = docker
        .create_exec(
            container_id,
            CreateExecOptions {
                cmd: Some(cmd.to_vec()),
                env: Some(env.iter().map(|s| s.as_str()).collect()),
                attach_stdout: Some(false),
                attach_stderr: Some(false),
                ..Default::default()
            },
        )
        .await?;
    docker
        .start_exec(&exec.id, Some(StartExecOptions { detach: true, ..Default::default() }))
        .await?;
    Ok(exec.id)
}

/// Parses a Docker-style memory string (`"512MiB"`, `"1.2GB"`, `"900kB"`) into bytes.
pub fn parse_memory_string(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    let split_at = raw.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (number, unit) = raw.split_at(split_at);
    let value: f64 = number.parse().ok()?;
    let multiplier = match unit.trim() {
        "B" => 1.0,
        "KiB" => 1024.0,
        "MiB" => 1024.0 * 1024.0,
        "GiB" => 1024.0 * 1024.0 * 1024.0,
        "KB" | "kB" => 1000.0,
        "MB" | "mB" => 1000.0 * 1000.0,
        "GB" | "gB" => 1000.0 * 1000.0 * 1000.0,
        _ => return None,
    };
    Some(value * multiplier)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_binary_and_decimal_units() {
        assert_eq!(parse_memory_string("512MiB"), Some(512.0 * 1024.0 * 1024.0));
        assert_eq!(parse_memory_string("1GB"), Some(1_000_000_000.0));
        assert_eq!(parse_memory_string("garbage"), None);
    }
}
