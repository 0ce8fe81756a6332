pub mod models;

use crate::error::{AppError, AppResult};
use chrono::Utc;
use models::*;
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

/// Persists the §3 entities that are not purely in-memory runtime state:
/// secrets, scheduled jobs, webhook jobs, persistent services and their execution logs.
///
/// Image/Sandbox/WebService are owned by the in-memory managers and never touch this store.
#[derive(Clone)]
pub struct RepositoryStore {
    pool: SqlitePool,
}

impl RepositoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Runs embedded migrations with exponential backoff, returning `SchemaMigrationFailed`
    /// only after the configured number of attempts is exhausted.
    pub async fn migrate(&self) -> AppResult<()> {
        let attempts = *crate::config::MIGRATION_RETRY_ATTEMPTS;
        let mut delay = std::time::Duration::from_millis(200);
        let mut last_err = None;
        for attempt in 1..=attempts {
            match sqlx::migrate!().run(&self.pool).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "migration attempt failed");
                    last_err = Some(e);
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
            }
        }
        Err(AppError::SchemaMigrationFailed(
            last_err.map(|e| e.to_string()).unwrap_or_default(),
        ))
    }

    pub async fn schema_version(&self) -> AppResult<Option<i64>> {
        let row = sqlx::query("SELECT value FROM schema_info WHERE key = 'version'")
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.and_then(|r| r.get::<String, _>("value").parse().ok()))
    }

    // ---- secrets ----

    pub async fn upsert_secret(
        &self,
        name: &str,
        ciphertext: &[u8],
        nonce: &[u8],
        description: Option<&str>,
    ) -> AppResult<()> {
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO secrets (name, ciphertext, nonce, description, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(name) DO UPDATE SET ciphertext = ?2, nonce = ?3, description = ?4, updated_at = ?5",
        )
        .bind(name)
        .bind(ciphertext)
        .bind(nonce)
        .bind(description)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_secret(&self, name: &str) -> AppResult<Option<(Vec<u8>, Vec<u8>)>> {
        let row = sqlx::query("SELECT ciphertext, nonce FROM secrets WHERE name = ?1")
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| (r.get("ciphertext"), r.get("nonce"))))
    }

    pub async fn delete_secret(&self, name: &str) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM secrets WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn list_secret_metadata(&self) -> AppResult<Vec<SecretMetadata>> {
        let rows = sqlx::query("SELECT name, description, created_at, updated_at FROM secrets ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| SecretMetadata {
                name: r.get("name"),
                description: r.get("description"),
                created_at: r.get("created_at"),
                updated_at: r.get("updated_at"),
            })
            .collect())
    }

    pub async fn all_secrets(&self) -> AppResult<Vec<(String, Vec<u8>, Vec<u8>)>> {
        let rows = sqlx::query("SELECT name, ciphertext, nonce FROM secrets")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|r| (r.get("name"), r.get("ciphertext"), r.get("nonce")))
            .collect())
    }

    // ---- scheduled jobs ----

    pub async fn create_scheduled_job(&self, input: &CreateScheduledJob) -> AppResult<ScheduledJob> {
        let package_set = encode_package_set(&input.packages);
        let id = sqlx::query(
            "INSERT INTO scheduled_jobs (name, code, cron_expr, package_set, bound_sandbox, timeout_s, is_active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1)",
        )
        .bind(&input.name)
        .bind(&input.code)
        .bind(&input.cron_expr)
        .bind(&package_set)
        .bind(&input.bound_sandbox)
        .bind(input.timeout_s)
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.get_scheduled_job(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_scheduled_job(&self, id: i64) -> AppResult<Option<ScheduledJob>> {
        let row = sqlx::query("SELECT * FROM scheduled_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(ScheduledJob::from_row))
    }

    pub async fn list_scheduled_jobs(&self) -> AppResult<Vec<ScheduledJob>> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs ORDER BY id").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(ScheduledJob::from_row).collect())
    }

    pub async fn list_active_scheduled_jobs(&self) -> AppResult<Vec<ScheduledJob>> {
        let rows = sqlx::query("SELECT * FROM scheduled_jobs WHERE is_active = 1")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(ScheduledJob::from_row).collect())
    }

    pub async fn update_scheduled_job_active(&self, id: i64, is_active: bool) -> AppResult<()> {
        sqlx::query("UPDATE scheduled_jobs SET is_active = ?1 WHERE id = ?2")
            .bind(is_active as i64)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn touch_scheduled_job_last_run(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE scheduled_jobs SET last_run = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_scheduled_job(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM scheduled_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- webhook jobs ----

    pub async fn create_webhook_job(&self, input: &CreateWebhookJob) -> AppResult<WebhookJob> {
        if !input.endpoint.starts_with('/') {
            return Err(AppError::Validation("endpoint must start with '/'".into()));
        }
        let package_set = encode_package_set(&input.packages);
        let id = sqlx::query(
            "INSERT INTO webhook_jobs (name, endpoint, code, package_set, bound_sandbox, timeout_s, is_active, description)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7)",
        )
        .bind(&input.name)
        .bind(&input.endpoint)
        .bind(&input.code)
        .bind(&package_set)
        .bind(&input.bound_sandbox)
        .bind(input.timeout_s)
        .bind(&input.description)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
                AppError::Conflict(format!("endpoint '{}' already exists", input.endpoint))
            }
            _ => AppError::Db(e),
        })?
        .last_insert_rowid();
        self.get_webhook_job(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_webhook_job(&self, id: i64) -> AppResult<Option<WebhookJob>> {
        let row = sqlx::query("SELECT * FROM webhook_jobs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(WebhookJob::from_row))
    }

    pub async fn get_webhook_job_by_endpoint(&self, endpoint: &str) -> AppResult<Option<WebhookJob>> {
        let row = sqlx::query("SELECT * FROM webhook_jobs WHERE endpoint = ?1 AND is_active = 1")
            .bind(endpoint)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(WebhookJob::from_row))
    }

    pub async fn list_webhook_jobs(&self) -> AppResult<Vec<WebhookJob>> {
        let rows = sqlx::query("SELECT * FROM webhook_jobs ORDER BY id").fetch_all(&self.pool).await?;
        Ok(rows.iter().map(WebhookJob::from_row).collect())
    }

    pub async fn touch_webhook_last_triggered(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE webhook_jobs SET last_triggered = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_webhook_job(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM webhook_jobs WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- persistent services ----

    pub async fn create_persistent_service(
        &self,
        input: &CreatePersistentService,
    ) -> AppResult<PersistentService> {
        let package_set = encode_package_set(&input.packages);
        let id = sqlx::query(
            "INSERT INTO persistent_services (name, code, package_set, bound_sandbox, restart_policy, auto_start, is_active, status)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, 'stopped')",
        )
        .bind(&input.name)
        .bind(&input.code)
        .bind(&package_set)
        .bind(&input.bound_sandbox)
        .bind(input.restart_policy.as_str())
        .bind(input.auto_start as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err) if db_err.message().contains("UNIQUE") => {
                AppError::Conflict(format!("service '{}' already exists", input.name))
            }
            _ => AppError::Db(e),
        })?
        .last_insert_rowid();
        self.get_persistent_service(id).await?.ok_or(AppError::NotFound)
    }

    pub async fn get_persistent_service(&self, id: i64) -> AppResult<Option<PersistentService>> {
        let row = sqlx::query("SELECT * FROM persistent_services WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(PersistentService::from_row))
    }

    pub async fn list_persistent_services(&self) -> AppResult<Vec<PersistentService>> {
        let rows = sqlx::query("SELECT * FROM persistent_services ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(PersistentService::from_row).collect())
    }

    pub async fn list_auto_start_services(&self) -> AppResult<Vec<PersistentService>> {
        let rows = sqlx::query(
            "SELECT * FROM persistent_services WHERE auto_start = 1 AND is_active = 1",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(PersistentService::from_row).collect())
    }

    pub async fn set_service_status(&self, id: i64, status: ServiceStatus) -> AppResult<()> {
        sqlx::query("UPDATE persistent_services SET status = ?1 WHERE id = ?2")
            .bind(status.as_str())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_service_started(&self, id: i64, sandbox_id: &str, handle: &str) -> AppResult<()> {
        sqlx::query(
            "UPDATE persistent_services SET status = 'running', started_at = ?1, bound_sandbox = ?2, process_handle = ?3 WHERE id = ?4",
        )
        .bind(Utc::now())
        .bind(sandbox_id)
        .bind(handle)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_service_restarted(&self, id: i64) -> AppResult<()> {
        sqlx::query("UPDATE persistent_services SET last_restart = ?1 WHERE id = ?2")
            .bind(Utc::now())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn delete_persistent_service(&self, id: i64) -> AppResult<bool> {
        let result = sqlx::query("DELETE FROM persistent_services WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    // ---- execution logs ----

    pub async fn insert_log(&self, entry: NewExecutionLog<'_>) -> AppResult<i64> {
        let (scheduled_job_id, webhook_job_id, persistent_service_id) = match entry.parent {
            LogParent::None => (None, None, None),
            LogParent::Scheduled(id) => (Some(id), None, None),
            LogParent::Webhook(id) => (None, Some(id), None),
            LogParent::Service(id) => (None, None, Some(id)),
        };
        let id = sqlx::query(
            "INSERT INTO execution_logs
             (scheduled_job_id, webhook_job_id, persistent_service_id, code, output, error, sandbox_id,
              execution_time_s, started_at, status, request_data, response_data, metrics)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
        )
        .bind(scheduled_job_id)
        .bind(webhook_job_id)
        .bind(persistent_service_id)
        .bind(entry.code)
        .bind(entry.output)
        .bind(entry.error)
        .bind(entry.sandbox_id)
        .bind(entry.execution_time_s)
        .bind(entry.started_at)
        .bind(entry.status.as_str())
        .bind(entry.request_data.map(|v| v.to_string()))
        .bind(entry.response_data.map(|v| v.to_string()))
        .bind(entry.metrics.map(|v| v.to_string()))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        Ok(id)
    }

    pub async fn get_log(&self, id: i64) -> AppResult<Option<ExecutionLog>> {
        let row = sqlx::query("SELECT * FROM execution_logs WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(ExecutionLog::from_row))
    }

    pub async fn list_logs(
        &self,
        job_id: Option<i64>,
        webhook_job_id: Option<i64>,
        limit: i64,
        offset: i64,
    ) -> AppResult<Vec<ExecutionLog>> {
        let mut builder = sqlx::QueryBuilder::new("SELECT * FROM execution_logs WHERE 1 = 1");
        if let Some(job_id) = job_id {
            builder.push(" AND scheduled_job_id = ").push_bind(job_id);
        }
        if let Some(webhook_job_id) = webhook_job_id {
            builder.push(" AND webhook_job_id = ").push_bind(webhook_job_id);
        }
        builder
            .push(" ORDER BY started_at DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);
        let rows = builder.build().fetch_all(&self.pool).await?;
        Ok(rows.iter().map(ExecutionLog::from_row).collect())
    }
}

pub struct NewExecutionLog<'a> {
    pub parent: LogParent,
    pub code: &'a str,
    pub output: Option<&'a str>,
    pub error: Option<&'a str>,
    pub sandbox_id: Option<&'a str>,
    pub execution_time_s: f64,
    pub started_at: chrono::DateTime<Utc>,
    pub status: LogStatus,
    pub request_data: Option<serde_json::Value>,
    pub response_data: Option<serde_json::Value>,
    pub metrics: Option<serde_json::Value>,
}
