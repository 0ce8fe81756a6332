use once_cell::sync::Lazy;

/// Sqlite connection string for the repository store.
pub static DATABASE_URL: Lazy<String> =
    Lazy::new(|| std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite://data/engine.db".into()));

/// If migrations fail at startup, log and continue instead of aborting. Development escape hatch.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
});

pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".into()));

pub static BIND_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BIND_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8000)
});

/// Container-runtime endpoint. Optional; bollard falls back to the local Docker socket.
pub static DOCKER_HOST: Lazy<Option<String>> = Lazy::new(|| std::env::var("DOCKER_HOST").ok());

/// Used to construct proxy URLs returned in API responses. VITE_API_URL takes precedence.
pub static BACKEND_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("VITE_API_URL")
        .or_else(|_| std::env::var("BACKEND_URL"))
        .unwrap_or_else(|_| "http://localhost:8000".into())
});

/// Comma-separated allowed CORS origins. Empty means permissive (any origin).
pub static ALLOWED_ORIGINS: Lazy<Vec<String>> = Lazy::new(|| {
    std::env::var("ALLOWED_ORIGINS")
        .map(|v| v.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
});

/// Repository-prefix for synthesized sandbox images.
pub static SANDBOX_IMAGE_PREFIX: Lazy<String> =
    Lazy::new(|| std::env::var("SANDBOX_IMAGE_PREFIX").unwrap_or_else(|_| "code-exec-sandbox".into()));

/// Grace period after launching a web service before the first readiness probe.
pub static WEB_SERVICE_GRACE_SECONDS: Lazy<u64> = Lazy::new(|| {
    std::env::var("WEB_SERVICE_GRACE_SECONDS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8)
});

/// Number of attempts to run pending migrations before giving up (exponential backoff).
pub static MIGRATION_RETRY_ATTEMPTS: Lazy<u32> = Lazy::new(|| {
    std::env::var("MIGRATION_RETRY_ATTEMPTS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(5)
});

/// Path to the symmetric key file backing the SecretsVault.
pub static ENV_KEY_PATH: Lazy<String> =
    Lazy::new(|| std::env::var("ENV_KEY_PATH").unwrap_or_else(|_| ".env_key".into()));

/// Path to a JSON seccomp profile applied to every sandbox. Unset means the docker daemon's
/// own default seccomp profile is used (still enforced, just not pinned by us).
pub static SECCOMP_PROFILE_PATH: Lazy<Option<String>> =
    Lazy::new(|| std::env::var("SECCOMP_PROFILE_PATH").ok());

/// AppArmor profile name applied to every sandbox. Defaults to the profile Docker ships with
/// on Linux; set to an empty string to disable on hosts without AppArmor support.
pub static APPARMOR_PROFILE: Lazy<Option<String>> = Lazy::new(|| match std::env::var("APPARMOR_PROFILE") {
    Ok(v) if v.is_empty() => None,
    Ok(v) => Some(v),
    Err(_) => Some("docker-default".to_string()),
});
