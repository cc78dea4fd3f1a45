//! SQLite-backed persistence for servers, jobs, events, and settings.
//!
//! The store is the only shared resource between workers and the HTTP layer.
//! All mutating operations are single guarded statements or short
//! transactions; SQLite's single-writer lock serializes them, so the
//! `UPDATE ... WHERE status = <expected>` pattern is race-free. Timestamps
//! used in guards are always bound by the caller from `Utc::now()` so one
//! process clock governs every lease comparison.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::kernel::secrets::SecretCipher;

mod event;
mod job;
mod migrations;
mod server;

pub use event::{EventLevel, JobEvent};
pub use job::{Job, JobStatus, TerminalOutcome};
pub use server::{DeleteServerOutcome, ServerRecord};

const SETTING_SCHEMA_VERSION: &str = "schema_version";
const SETTING_SERVICE_UUID: &str = "service_uuid";

pub struct Store {
    pool: SqlitePool,
    secrets: SecretCipher,
}

impl Store {
    /// Open (creating if missing) the database at `path` and bring the schema
    /// to the current version. Re-opening at the target version is a no-op.
    pub async fn open(path: &Path, secrets: SecretCipher) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening database at {}", path.display()))?;

        let store = Self { pool, secrets };
        migrations::apply(&store.pool)
            .await
            .context("applying schema migrations")?;
        store.ensure_service_uuid().await?;
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(crate) fn secrets(&self) -> &SecretCipher {
        &self.secrets
    }

    /// Cheap connectivity probe for health checks.
    pub async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    pub async fn schema_version(&self) -> Result<i64> {
        let version = self
            .get_setting(SETTING_SCHEMA_VERSION)
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        Ok(version)
    }

    /// Stable identity of this controller instance, minted on first open.
    pub async fn service_uuid(&self) -> Result<Uuid> {
        let raw = self
            .get_setting(SETTING_SERVICE_UUID)
            .await?
            .context("service_uuid setting missing")?;
        raw.parse().context("service_uuid setting is not a UUID")
    }

    pub async fn get_setting(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar::<_, String>("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    pub async fn put_setting(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES (?1, ?2)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn ensure_service_uuid(&self) -> Result<()> {
        if self.get_setting(SETTING_SERVICE_UUID).await?.is_none() {
            self.put_setting(SETTING_SERVICE_UUID, &Uuid::new_v4().to_string())
                .await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn open_temp() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(&dir.path().join("test.db"), SecretCipher::plaintext())
            .await
            .unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn open_migrates_to_current_version() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.schema_version().await.unwrap(), migrations::TARGET_VERSION);
    }

    #[tokio::test]
    async fn reopen_is_a_noop_and_keeps_service_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");

        let store = Store::open(&path, SecretCipher::plaintext()).await.unwrap();
        let first_uuid = store.service_uuid().await.unwrap();
        drop(store);

        let store = Store::open(&path, SecretCipher::plaintext()).await.unwrap();
        assert_eq!(store.service_uuid().await.unwrap(), first_uuid);
        assert_eq!(store.schema_version().await.unwrap(), migrations::TARGET_VERSION);
    }

    #[tokio::test]
    async fn settings_round_trip() {
        let (_dir, store) = open_temp().await;
        assert_eq!(store.get_setting("nope").await.unwrap(), None);

        store.put_setting("k", "v1").await.unwrap();
        store.put_setting("k", "v2").await.unwrap();
        assert_eq!(store.get_setting("k").await.unwrap().as_deref(), Some("v2"));
    }
}
