//! Append-only job audit log.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use super::Store;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EventLevel {
    Info,
    Warn,
    Error,
}

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct JobEvent {
    #[serde(skip_serializing)]
    pub id: i64,
    #[serde(skip_serializing)]
    pub job_id: Uuid,
    pub time: DateTime<Utc>,
    pub level: EventLevel,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub message: String,
}

impl JobEvent {
    /// Append an entry. Older entries are never rewritten.
    pub async fn append(
        job_id: Uuid,
        level: EventLevel,
        step: Option<&str>,
        message: &str,
        store: &Store,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO job_events (job_id, time, level, step, message)
            VALUES (?1, ?2, ?3, ?4, ?5)
            "#,
        )
        .bind(job_id)
        .bind(Utc::now())
        .bind(level)
        .bind(step)
        .bind(message)
        .execute(store.pool())
        .await?;

        Ok(())
    }

    /// Events for a job in insertion order.
    pub async fn list_for_job(job_id: Uuid, store: &Store) -> Result<Vec<Self>> {
        let events = sqlx::query_as::<_, Self>(
            r#"
            SELECT id, job_id, time, level, step, message
            FROM job_events
            WHERE job_id = ?1
            ORDER BY id ASC
            "#,
        )
        .bind(job_id)
        .fetch_all(store.pool())
        .await?;

        Ok(events)
    }
}
