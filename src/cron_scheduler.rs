//! Background cron firing loop (§4.7).

use crate::db::models::LogParent;
use crate::db::{NewExecutionLog, RepositoryStore};
use crate::db::models::{LogStatus, ScheduledJob};
use crate::execution::ExecutionEngine;
use chrono::Utc;
use cron::Schedule;
use dashmap::DashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const POLL_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_TIMEOUT_S: u64 = 30;

pub struct CronScheduler {
    store: RepositoryStore,
    engine: Arc<ExecutionEngine>,
    jobs: DashMap<i64, ScheduledJob>,
}

impl CronScheduler {
    pub fn new(store: RepositoryStore, engine: Arc<ExecutionEngine>) -> Self {
        Self { store, engine, jobs: DashMap::new() }
    }

    /// Replaces the in-memory mirror entirely with the store's current active set.
    pub async fn reload(&self) -> crate::error::AppResult<()> {
        let active = self.store.list_active_scheduled_jobs().await?;
        self.jobs.clear();
        for job in active {
            self.jobs.insert(job.id, job);
        }
        Ok(())
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        if let Err(e) = self.reload().await {
            tracing::error!(error = %e, "initial cron reload failed");
        }
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("cron scheduler shutting down");
                    return;
                }
                _ = tokio::time::sleep(POLL_INTERVAL) => {
                    self.tick().await;
                }
            }
        }
    }

    async fn tick(&self) {
        let due: Vec<ScheduledJob> = self
            .jobs
            .iter()
            .filter(|e| is_due(e.value()))
            .map(|e| e.value().clone())
            .collect();

        for job in due {
            let store = self.store.clone();
            let engine = self.engine.clone();
            tokio::spawn(async move {
                fire(store, engine, job).await;
            });
        }
    }
}

/// A 5-field cron expression is adapted to the `cron` crate's 7-field grammar by prefixing a
/// literal seconds field.
fn parse_schedule(expr: &str) -> Option<Schedule> {
    Schedule::from_str(&format!("0 {expr}")).ok()
}

fn is_due(job: &ScheduledJob) -> bool {
    let Some(schedule) = parse_schedule(&job.cron_expr) else {
        tracing::warn!(job_id = job.id, cron_expr = %job.cron_expr, "invalid cron expression");
        return false;
    };
    let now = Utc::now();
    let reference = job.last_run.unwrap_or(job.created_at);
    match schedule.after(&reference).next() {
        Some(next_fire) => next_fire <= now,
        None => false,
    }
}

async fn fire(store: RepositoryStore, engine: Arc<ExecutionEngine>, job: ScheduledJob) {
    let started_at = Utc::now();
    let packages = job.package_set.clone();
    let timeout_s = if job.timeout_s > 0 { job.timeout_s as u64 } else { DEFAULT_TIMEOUT_S };

    let result = engine
        .execute(&job.code, &packages, timeout_s, job.bound_sandbox.as_deref())
        .await;

    let (status, output, error, sandbox_id) = match &result {
        Ok(r) if r.timed_out => (LogStatus::Timeout, None, r.error.clone(), Some(r.sandbox_id.as_str())),
        Ok(r) if r.success => (LogStatus::Success, Some(r.output.as_str()), None, Some(r.sandbox_id.as_str())),
        Ok(r) => (LogStatus::Error, Some(r.output.as_str()), r.error.clone(), Some(r.sandbox_id.as_str())),
        Err(e) => (LogStatus::Error, None, Some(e.to_string()), None),
    };

    let execution_time_s = result.as_ref().map(|r| r.execution_time_s).unwrap_or(0.0);

    if let Err(e) = store
        .insert_log(NewExecutionLog {
            parent: LogParent::Scheduled(job.id),
            code: &job.code,
            output,
            error: error.as_deref(),
            sandbox_id,
            execution_time_s,
            started_at,
            status,
            request_data: None,
            response_data: None,
            metrics: result.as_ref().ok().and_then(|r| serde_json::to_value(&r.metrics).ok()),
        })
        .await
    {
        tracing::error!(job_id = job.id, error = %e, "failed to record scheduled job execution log");
    }

    if let Err(e) = store.touch_scheduled_job_last_run(job.id).await {
        tracing::error!(job_id = job.id, error = %e, "failed to update last_run");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn five_field_expression_parses_after_seconds_prefix() {
        assert!(parse_schedule("*/5 * * * *").is_some());
    }

    #[test]
    fn garbage_expression_fails_to_parse() {
        assert!(parse_schedule("not a cron expr").is_none());
    }
}
