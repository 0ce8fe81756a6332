use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

fn parse_package_set(raw: Option<&str>) -> Vec<String> {
    raw.map(|s| s.split(',').map(|p| p.trim().to_string()).filter(|p| !p.is_empty()).collect())
        .unwrap_or_default()
}

pub fn encode_package_set(packages: &[String]) -> Option<String> {
    if packages.is_empty() {
        None
    } else {
        Some(packages.join(","))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduledJob {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub cron_expr: String,
    pub package_set: Vec<String>,
    pub bound_sandbox: Option<String>,
    pub timeout_s: i64,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_run: Option<DateTime<Utc>>,
}

impl ScheduledJob {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        use sqlx::Row;
        Self {
            id: row.get("id"),
            name: row.get("name"),
            code: row.get("code"),
            cron_expr: row.get("cron_expr"),
            package_set: parse_package_set(row.get::<Option<String>, _>("package_set").as_deref()),
            bound_sandbox: row.get("bound_sandbox"),
            timeout_s: row.get("timeout_s"),
            is_active: row.get::<i64, _>("is_active") != 0,
            created_at: row.get("created_at"),
            last_run: row.get("last_run"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateScheduledJob {
    pub name: String,
    pub code: String,
    pub cron_expr: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub bound_sandbox: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_s: i64,
}

fn default_timeout() -> i64 {
    30
}

#[derive(Debug, Clone, Serialize)]
pub struct WebhookJob {
    pub id: i64,
    pub name: String,
    pub endpoint: String,
    pub code: String,
    pub package_set: Vec<String>,
    pub bound_sandbox: Option<String>,
    pub timeout_s: i64,
    pub is_active: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub description: Option<String>,
}

impl WebhookJob {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        use sqlx::Row;
        Self {
            id: row.get("id"),
            name: row.get("name"),
            endpoint: row.get("endpoint"),
            code: row.get("code"),
            package_set: parse_package_set(row.get::<Option<String>, _>("package_set").as_deref()),
            bound_sandbox: row.get("bound_sandbox"),
            timeout_s: row.get("timeout_s"),
            is_active: row.get::<i64, _>("is_active") != 0,
            last_triggered: row.get("last_triggered"),
            description: row.get("description"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookJob {
    pub name: String,
    pub endpoint: String,
    pub code: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub bound_sandbox: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_s: i64,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RestartPolicy {
    Always,
    Never,
    OnFailure,
}

impl RestartPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestartPolicy::Always => "always",
            RestartPolicy::Never => "never",
            RestartPolicy::OnFailure => "on-failure",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "always" => RestartPolicy::Always,
            "on-failure" => RestartPolicy::OnFailure,
            _ => RestartPolicy::Never,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceStatus {
    Stopped,
    Starting,
    Running,
    Error,
    Restarting,
}

impl ServiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceStatus::Stopped => "stopped",
            ServiceStatus::Starting => "starting",
            ServiceStatus::Running => "running",
            ServiceStatus::Error => "error",
            ServiceStatus::Restarting => "restarting",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "starting" => ServiceStatus::Starting,
            "running" => ServiceStatus::Running,
            "error" => ServiceStatus::Error,
            "restarting" => ServiceStatus::Restarting,
            _ => ServiceStatus::Stopped,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PersistentService {
    pub id: i64,
    pub name: String,
    pub code: String,
    pub package_set: Vec<String>,
    pub bound_sandbox: Option<String>,
    pub restart_policy: RestartPolicy,
    pub auto_start: bool,
    pub is_active: bool,
    pub status: ServiceStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub last_restart: Option<DateTime<Utc>>,
    pub process_handle: Option<String>,
}

impl PersistentService {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        use sqlx::Row;
        Self {
            id: row.get("id"),
            name: row.get("name"),
            code: row.get("code"),
            package_set: parse_package_set(row.get::<Option<String>, _>("package_set").as_deref()),
            bound_sandbox: row.get("bound_sandbox"),
            restart_policy: RestartPolicy::parse(&row.get::<String, _>("restart_policy")),
            auto_start: row.get::<i64, _>("auto_start") != 0,
            is_active: row.get::<i64, _>("is_active") != 0,
            status: ServiceStatus::parse(&row.get::<String, _>("status")),
            started_at: row.get("started_at"),
            last_restart: row.get("last_restart"),
            process_handle: row.get("process_handle"),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct CreatePersistentService {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub packages: Vec<String>,
    pub bound_sandbox: Option<String>,
    #[serde(default = "default_restart_policy")]
    pub restart_policy: RestartPolicy,
    #[serde(default)]
    pub auto_start: bool,
}

fn default_restart_policy() -> RestartPolicy {
    RestartPolicy::Never
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogStatus {
    Success,
    Error,
    Timeout,
}

impl LogStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStatus::Success => "success",
            LogStatus::Error => "error",
            LogStatus::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Default)]
pub enum LogParent {
    #[default]
    None,
    Scheduled(i64),
    Webhook(i64),
    Service(i64),
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionLog {
    pub id: i64,
    pub parent: LogParent,
    pub code: String,
    pub output: Option<String>,
    pub error: Option<String>,
    pub sandbox_id: Option<String>,
    pub execution_time_s: f64,
    pub started_at: DateTime<Utc>,
    pub status: LogStatus,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub metrics: Option<serde_json::Value>,
}

impl ExecutionLog {
    pub fn from_row(row: &sqlx::sqlite::SqliteRow) -> Self {
        use sqlx::Row;
        let parent = if let Some(id) = row.get::<Option<i64>, _>("scheduled_job_id") {
            LogParent::Scheduled(id)
        } else if let Some(id) = row.get::<Option<i64>, _>("webhook_job_id") {
            LogParent::Webhook(id)
        } else if let Some(id) = row.get::<Option<i64>, _>("persistent_service_id") {
            LogParent::Service(id)
        } else {
            LogParent::None
        };
        let status = match row.get::<String, _>("status").as_str() {
            "timeout" => LogStatus::Timeout,
            "success" => LogStatus::Success,
            _ => LogStatus::Error,
        };
        Self {
            id: row.get("id"),
            parent,
            code: row.get("code"),
            output: row.get("output"),
            error: row.get("error"),
            sandbox_id: row.get("sandbox_id"),
            execution_time_s: row.get("execution_time_s"),
            started_at: row.get("started_at"),
            status,
            request_data: row
                .get::<Option<String>, _>("request_data")
                .and_then(|s| serde_json::from_str(&s).ok()),
            response_data: row
                .get::<Option<String>, _>("response_data")
                .and_then(|s| serde_json::from_str(&s).ok()),
            metrics: row
                .get::<Option<String>, _>("metrics")
                .and_then(|s| serde_json::from_str(&s).ok()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SecretMetadata {
    pub name: String,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
