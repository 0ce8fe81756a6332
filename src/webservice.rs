//! Web-service detection and framework-specific launch (§4.4).

use crate::docker;
use crate::error::AppResult;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use bollard::Docker;
use rand::Rng;
use serde::Serialize;
use std::net::TcpListener;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Framework {
    Streamlit,
    Gradio,
    Fastapi,
    Flask,
    Dash,
}

impl Framework {
    pub fn as_str(&self) -> &'static str {
        match self {
            Framework::Streamlit => "streamlit",
            Framework::Gradio => "gradio",
            Framework::Fastapi => "fastapi",
            Framework::Flask => "flask",
            Framework::Dash => "dash",
        }
    }
}

/// Evaluated in order; first match wins (§4.4).
pub fn detect(code: &str, packages: &[String]) -> Option<Framework> {
    let code_lower = code.to_lowercase();
    let has_pkg = |name: &str| packages.iter().any(|p| p.eq_ignore_ascii_case(name));

    if has_pkg("streamlit") || code.contains("st.") {
        return Some(Framework::Streamlit);
    }
    if has_pkg("gradio") || code_lower.contains("import gradio") {
        return Some(Framework::Gradio);
    }
    if has_pkg("fastapi")
        || has_pkg("uvicorn")
        || (code_lower.contains("fastapi") && code_lower.contains("uvicorn"))
    {
        return Some(Framework::Fastapi);
    }
    if has_pkg("flask") || code_lower.contains("flask") {
        return Some(Framework::Flask);
    }
    if has_pkg("dash") || (code_lower.contains("dash") && has_pkg("plotly")) {
        return Some(Framework::Dash);
    }
    None
}

/// In-container port every launcher binds to. Each web-service sandbox gets its own network
/// namespace, so reusing the same internal port across sandboxes never collides; only the
/// externally published side (`allocate_port`) needs host-wide uniqueness.
pub const INTERNAL_PORT: u16 = 8501;

/// Picks a free port in [9000, 9999] by trial bind, retrying up to 100 times.
pub fn allocate_port() -> AppResult<u16> {
    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let candidate = rng.gen_range(9000..=9999);
        if TcpListener::bind(("127.0.0.1", candidate)).is_ok() {
            return Ok(candidate);
        }
    }
    Err(crate::error::AppError::SandboxCreateFailed(
        "could not allocate a free port in [9000, 9999] after 100 attempts".into(),
    ))
}

/// Writes the user code and a framework-specific launcher into the sandbox and starts it
/// detached. Returns the exec id of the launcher process.
pub async fn launch(
    docker: &Docker,
    container_id: &str,
    code: &str,
    framework: Framework,
    internal_port: u16,
    short_id: &str,
) -> AppResult<String> {
    docker::write_file_b64(docker, container_id, "/tmp/app.py", code).await?;

    let (_exit, _out) =
        docker::exec_capture(docker, container_id, &["python3", "-m", "py_compile", "/tmp/app.py"], &[])
            .await?;

    let launcher = match framework {
        Framework::Streamlit => streamlit_launcher(internal_port),
        Framework::Gradio => gradio_launcher(internal_port),
        Framework::Fastapi => asgi_launcher(internal_port),
        Framework::Flask => flask_launcher(internal_port),
        Framework::Dash => dash_launcher_shim(internal_port, short_id),
    };

    if framework == Framework::Streamlit {
        docker::write_file_b64(docker, container_id, "/tmp/.streamlit/config.toml", &streamlit_config(internal_port))
            .await?;
    }

    docker::write_file_b64(docker, container_id, "/tmp/start_service.sh", &launcher).await?;
    docker::exec_capture(docker, container_id, &["chmod", "+x", "/tmp/start_service.sh"], &[]).await?;
    let exec_id =
        docker::exec_detached(docker, container_id, &["/tmp/start_service.sh"], &[]).await?;
    Ok(exec_id)
}

fn streamlit_config(internal_port: u16) -> String {
    format!(
        "[server]\nenableCORS = false\nenableXsrfProtection = false\nmaxUploadSize = 200\n\
         headless = true\nenableStaticServing = true\nenableWebsocketCompression = false\n\
         port = {internal_port}\naddress = \"0.0.0.0\"\n\n\
         [browser]\ngatherUsageStats = false\n\n\
         [global]\nunitTest = false\n\n\
         [client]\ntoolbarMode = \"minimal\"\n\n\
         [logger]\nlevel = \"info\"\n"
    )
}

fn streamlit_launcher(internal_port: u16) -> String {
    format!(
        "#!/bin/sh\n\
         export PYTHONPATH=/tmp:$PYTHONPATH\n\
         export STREAMLIT_SERVER_ENABLE_STATIC_SERVING=true\n\
         export STREAMLIT_SERVER_ENABLE_WEBSOCKET_COMPRESSION=false\n\
         cd /tmp\n\
         streamlit run app.py --server.address=0.0.0.0 --server.port={internal_port} > /tmp/service.log 2>&1\n"
    )
}

/// Gradio ignores user-specified ports unless `launch()` is itself patched; rather than
/// text-rewriting the user's file we prepend a monkeypatch that forces the bind before
/// importing it.
fn gradio_launcher(internal_port: u16) -> String {
    format!(
        "#!/bin/sh\n\
         cat > /tmp/_launcher_shim.py <<'SHIM'\n\
import gradio as gr
_original_launch = gr.Blocks.launch
def _patched_launch(self, *args, **kwargs):
    kwargs[\"server_name\"] = \"0.0.0.0\"
    kwargs[\"server_port\"] = {internal_port}
    return _original_launch(self, *args, **kwargs)
gr.Blocks.launch = _patched_launch
gr.Interface.launch = _patched_launch
import runpy
runpy.run_path(\"/tmp/app.py\", run_name=\"__main__\")
SHIM
         cd /tmp && python3 _launcher_shim.py > /tmp/service.log 2>&1\n"
    )
}

/// Dash needs `url_base_pathname` and a pinned port. Per the launcher-shim redesign this is
/// done by importing the user's module and reconfiguring its `Dash`/`app` object
/// programmatically, never by regex-patching `/tmp/app.py`'s source text.
fn dash_launcher_shim(internal_port: u16, short_id: &str) -> String {
    let base_path = format!("/proxy/{short_id}/");
    format!(
        "#!/bin/sh\n\
         cat > /tmp/_launcher_shim.py <<'SHIM'\n\
import importlib.util
import sys

spec = importlib.util.spec_from_file_location(\"user_app\", \"/tmp/app.py\")
user_app = importlib.util.module_from_spec(spec)
sys.modules[\"user_app\"] = user_app
try:
    spec.loader.exec_module(user_app)
except Exception as exc:
    print(f\"dash launcher shim: failed to import user module: {{exc}}\", file=sys.stderr)
    raise

app = getattr(user_app, \"app\", None)
if app is not None and hasattr(app, \"config\"):
    try:
        app.config.update({{\"url_base_pathname\": \"{base_path}\"}})
    except Exception:
        pass
    app.run(host=\"0.0.0.0\", port={internal_port}, debug=False)
else:
    print(\"dash launcher shim: no recognizable Dash app object, falling back to default bind\", file=sys.stderr)
SHIM
         cd /tmp && python3 _launcher_shim.py > /tmp/service.log 2>&1\n"
    )
}

fn asgi_launcher(internal_port: u16) -> String {
    format!(
        "#!/bin/sh\n\
         cd /tmp\n\
         python3 -m uvicorn app:app --host 0.0.0.0 --port {internal_port} > /tmp/service.log 2>&1\n"
    )
}

fn flask_launcher(internal_port: u16) -> String {
    format!(
        "#!/bin/sh\n\
         cat > /tmp/_launcher_shim.py <<'SHIM'\n\
from app import app
app.run(host=\"0.0.0.0\", port={internal_port})
SHIM
         cd /tmp && python3 _launcher_shim.py > /tmp/service.log 2>&1\n"
    )
}

/// Readiness probe: process listing for the expected command substring, and the port
/// actually listening, within the grace window. Returns `true` if ready.
pub async fn probe_ready(docker: &Docker, container_id: &str, internal_port: u16) -> AppResult<bool> {
    let (_code, ps_out) =
        docker::exec_capture(docker, container_id, &["sh", "-c", "ps aux"], &[]).await?;
    let process_running = ["streamlit", "uvicorn", "flask", "python3 _launcher_shim"]
        .iter()
        .any(|marker| ps_out.contains(marker));

    let listen_cmd = format!(
        "(netstat -tlnp 2>/dev/null | grep ':{internal_port} ') || (ss -tlnp 2>/dev/null | grep ':{internal_port} ')"
    );
    let (_code, listen_out) = docker::exec_capture(docker, container_id, &["sh", "-c", &listen_cmd], &[]).await?;
    let port_listening = !listen_out.trim().is_empty();

    Ok(process_running && port_listening)
}

pub async fn tail_log(docker: &Docker, container_id: &str, lines: u32) -> AppResult<String> {
    let cmd = format!("tail -n {lines} /tmp/service.log 2>/dev/null || true");
    let (_code, out) = docker::exec_capture(docker, container_id, &["sh", "-c", &cmd], &[]).await?;
    Ok(out)
}

/// A small wrapper to decode the base64 payload itself without a shell, used by
/// `docker::write_file_b64`'s callers when they need a raw encode without writing a file.
pub fn encode_b64(payload: &str) -> String {
    STANDARD.encode(payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn streamlit_detected_by_package() {
        assert_eq!(detect("x = 1", &["streamlit".into()]), Some(Framework::Streamlit));
    }

    #[test]
    fn streamlit_detected_by_identifier() {
        assert_eq!(detect("st.write('hi')", &[]), Some(Framework::Streamlit));
    }

    #[test]
    fn gradio_detected_by_import() {
        assert_eq!(detect("import gradio as gr", &[]), Some(Framework::Gradio));
    }

    #[test]
    fn fastapi_requires_both_strings_in_code() {
        assert_eq!(detect("import fastapi", &[]), None);
        assert_eq!(
            detect("import fastapi\nimport uvicorn", &[]),
            Some(Framework::Fastapi)
        );
    }

    #[test]
    fn dash_requires_plotly_alongside_code_mention() {
        assert_eq!(detect("import dash", &[]), None);
        assert_eq!(detect("import dash", &["plotly".into()]), Some(Framework::Dash));
    }

    #[test]
    fn plain_script_is_not_a_web_service() {
        assert_eq!(detect("print('hello')", &["requests".into()]), None);
    }

    #[test]
    fn streamlit_wins_over_later_matches_when_both_present() {
        assert_eq!(
            detect("import gradio as gr\nst.write('x')", &[]),
            Some(Framework::Streamlit)
        );
    }
}
