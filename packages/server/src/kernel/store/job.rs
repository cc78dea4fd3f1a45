//! Job model and leasing primitives.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::time::Duration;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Provisioning,
    Succeeded,
    Failed,
    Complete,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Complete
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Provisioning => "provisioning",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Complete => "complete",
        }
    }
}

/// Outcome the webhook (or the stuck-job timeout) drives a provisioning job to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TerminalOutcome {
    Succeeded,
    Failed,
}

impl TerminalOutcome {
    fn status(self) -> JobStatus {
        match self {
            TerminalOutcome::Succeeded => JobStatus::Succeeded,
            TerminalOutcome::Failed => JobStatus::Failed,
        }
    }
}

/// One provisioning attempt against one server.
#[derive(Debug, Clone, FromRow, Serialize, TypedBuilder)]
pub struct Job {
    #[builder(default = Uuid::new_v4())]
    pub id: Uuid,

    #[builder(setter(into))]
    pub server_serial: String,

    #[builder(default = JobStatus::Queued)]
    pub status: JobStatus,

    #[builder(default)]
    pub failed_step: Option<String>,

    /// Immutable after insert; the store treats it as an opaque blob.
    #[builder(setter(transform = |recipe: serde_json::Value| Json(recipe)))]
    pub recipe: Json<serde_json::Value>,

    /// Baseline image URL captured at creation time.
    #[builder(setter(into))]
    pub maintenance_iso_url: String,

    #[builder(default)]
    pub task_iso_path: Option<String>,

    #[builder(default)]
    pub worker_id: Option<String>,

    #[builder(default)]
    pub picked_at: Option<DateTime<Utc>>,

    #[builder(default)]
    pub lease_expires_at: Option<DateTime<Utc>>,

    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,

    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Insert a new job row. Fails if the id already exists.
    pub async fn insert(&self, store: &Store) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO jobs (
                id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
        )
        .bind(self.id)
        .bind(&self.server_serial)
        .bind(self.status)
        .bind(&self.failed_step)
        .bind(&self.recipe)
        .bind(&self.maintenance_iso_url)
        .bind(&self.task_iso_path)
        .bind(&self.worker_id)
        .bind(self.picked_at)
        .bind(self.lease_expires_at)
        .bind(self.created_at)
        .bind(self.updated_at)
        .execute(store.pool())
        .await
        .with_context(|| format!("inserting job {}", self.id))?;

        Ok(())
    }

    pub async fn find_by_id(id: Uuid, store: &Store) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                   task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            FROM jobs
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(store.pool())
        .await?;

        Ok(job)
    }

    /// Newest-first listing for the operator API.
    pub async fn list(status: Option<JobStatus>, limit: i64, store: &Store) -> Result<Vec<Self>> {
        let jobs = match status {
            Some(status) => {
                sqlx::query_as::<_, Self>(
                    r#"
                    SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                           task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
                    FROM jobs
                    WHERE status = ?1
                    ORDER BY created_at DESC
                    LIMIT ?2
                    "#,
                )
                .bind(status)
                .bind(limit)
                .fetch_all(store.pool())
                .await?
            }
            None => {
                sqlx::query_as::<_, Self>(
                    r#"
                    SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                           task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
                    FROM jobs
                    ORDER BY created_at DESC
                    LIMIT ?1
                    "#,
                )
                .bind(limit)
                .fetch_all(store.pool())
                .await?
            }
        };

        Ok(jobs)
    }

    /// Atomically claim the oldest queued job for `worker_id`.
    ///
    /// The selection and the status flip happen in one statement, so two
    /// workers racing on the same row can never both win: SQLite serializes
    /// the writes and the loser's subselect comes up empty.
    pub async fn acquire_queued(
        worker_id: &str,
        lease_ttl: Duration,
        store: &Store,
    ) -> Result<Option<Self>> {
        let now = Utc::now();
        let expires = now + chrono_ttl(lease_ttl)?;

        let job = sqlx::query_as::<_, Self>(
            r#"
            UPDATE jobs SET
                status = 'provisioning',
                worker_id = ?1,
                picked_at = ?2,
                lease_expires_at = ?3,
                updated_at = ?2
            WHERE id = (
                SELECT id FROM jobs
                WHERE status = 'queued'
                ORDER BY created_at ASC, id ASC
                LIMIT 1
            )
            RETURNING id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                      task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            "#,
        )
        .bind(worker_id)
        .bind(now)
        .bind(expires)
        .fetch_optional(store.pool())
        .await?;

        Ok(job)
    }

    /// Heartbeat: push the lease out, but only while this worker still owns
    /// the provisioning row. `false` means the caller has been evicted.
    pub async fn extend_lease(
        id: Uuid,
        worker_id: &str,
        lease_ttl: Duration,
        store: &Store,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono_ttl(lease_ttl)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET lease_expires_at = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'provisioning' AND worker_id = ?4
            "#,
        )
        .bind(expires)
        .bind(now)
        .bind(id)
        .bind(worker_id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Transfer ownership of a provisioning job whose lease has lapsed.
    pub async fn steal_expired_lease(
        id: Uuid,
        new_worker_id: &str,
        lease_ttl: Duration,
        store: &Store,
    ) -> Result<bool> {
        let now = Utc::now();
        let expires = now + chrono_ttl(lease_ttl)?;

        let result = sqlx::query(
            r#"
            UPDATE jobs SET worker_id = ?1, picked_at = ?2, lease_expires_at = ?3, updated_at = ?2
            WHERE id = ?4 AND status = 'provisioning' AND lease_expires_at < ?2
            "#,
        )
        .bind(new_worker_id)
        .bind(now)
        .bind(expires)
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Oldest provisioning job whose lease has lapsed, if any. Candidates for
    /// [`Job::steal_expired_lease`].
    pub async fn find_expired_provisioning(store: &Store) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                   task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            FROM jobs
            WHERE status = 'provisioning' AND lease_expires_at < ?1
            ORDER BY lease_expires_at ASC
            LIMIT 1
            "#,
        )
        .bind(Utc::now())
        .fetch_optional(store.pool())
        .await?;

        Ok(job)
    }

    /// Revert `provisioning -> queued`, clearing every lease field. Used only
    /// by the startup reconciler. `false` if the job is not provisioning.
    pub async fn requeue_provisioning(id: Uuid, store: &Store) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET
                status = 'queued',
                worker_id = NULL,
                picked_at = NULL,
                lease_expires_at = NULL,
                task_iso_path = NULL,
                failed_step = NULL,
                updated_at = ?1
            WHERE id = ?2 AND status = 'provisioning'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Drive a provisioning job to `succeeded` or `failed`. The guard on the
    /// current status makes duplicate deliveries and late timeouts harmless.
    pub async fn mark_status(
        id: Uuid,
        outcome: TerminalOutcome,
        failed_step: Option<&str>,
        store: &Store,
    ) -> Result<bool> {
        let failed_step = match outcome {
            TerminalOutcome::Failed => failed_step,
            TerminalOutcome::Succeeded => None,
        };

        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = ?1, failed_step = ?2, updated_at = ?3
            WHERE id = ?4 AND status = 'provisioning'
            "#,
        )
        .bind(outcome.status())
        .bind(failed_step)
        .bind(Utc::now())
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Promote `succeeded -> complete` after cleanup.
    pub async fn complete(id: Uuid, store: &Store) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET status = 'complete', updated_at = ?1
            WHERE id = ?2 AND status = 'succeeded'
            "#,
        )
        .bind(Utc::now())
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record where the pipeline wrote the task ISO.
    pub async fn set_task_iso_path(id: Uuid, path: &str, store: &Store) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET task_iso_path = ?1, updated_at = ?2
            WHERE id = ?3 AND status = 'provisioning'
            "#,
        )
        .bind(path)
        .bind(Utc::now())
        .bind(id)
        .execute(store.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// The webhook's target: the newest provisioning job for a serial.
    pub async fn active_provisioning_for_serial(
        serial: &str,
        store: &Store,
    ) -> Result<Option<Self>> {
        let job = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                   task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            FROM jobs
            WHERE server_serial = ?1 AND status = 'provisioning'
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(serial)
        .fetch_optional(store.pool())
        .await?;

        Ok(job)
    }

    /// All provisioning jobs, for the startup reconciler.
    pub async fn list_provisioning(store: &Store) -> Result<Vec<Self>> {
        let jobs = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, server_serial, status, failed_step, recipe, maintenance_iso_url,
                   task_iso_path, worker_id, picked_at, lease_expires_at, created_at, updated_at
            FROM jobs
            WHERE status = 'provisioning'
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(store.pool())
        .await?;

        Ok(jobs)
    }
}

fn chrono_ttl(ttl: Duration) -> Result<ChronoDuration> {
    ChronoDuration::from_std(ttl).context("lease TTL out of range")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_job() -> Job {
        Job::builder()
            .server_serial("SER-1")
            .recipe(serde_json::json!({"task_target": "install-linux.target"}))
            .maintenance_iso_url("http://media/maintenance.iso")
            .build()
    }

    #[test]
    fn new_job_starts_queued_with_clear_lease_fields() {
        let job = sample_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.worker_id.is_none());
        assert!(job.picked_at.is_none());
        assert!(job.lease_expires_at.is_none());
        assert!(job.failed_step.is_none());
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(JobStatus::Succeeded.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Complete.is_terminal());
        assert!(!JobStatus::Queued.is_terminal());
        assert!(!JobStatus::Provisioning.is_terminal());
    }

    #[test]
    fn outcome_maps_to_status() {
        assert_eq!(TerminalOutcome::Succeeded.status(), JobStatus::Succeeded);
        assert_eq!(TerminalOutcome::Failed.status(), JobStatus::Failed);
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&JobStatus::Provisioning).unwrap(),
            "\"provisioning\""
        );
    }
}
