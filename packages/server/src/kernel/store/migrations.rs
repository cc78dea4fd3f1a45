//! Numbered, forward-only schema migrations.
//!
//! Each pending migration runs inside its own transaction together with the
//! `settings[schema_version]` bump, so a crash mid-migration leaves the
//! previous version intact.

use anyhow::{Context, Result};
use sqlx::SqlitePool;

pub(super) const TARGET_VERSION: i64 = 2;

const MIGRATIONS: &[(i64, &str)] = &[
    (
        1,
        r#"
        CREATE TABLE settings (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE servers (
            serial       TEXT PRIMARY KEY,
            bmc_address  TEXT NOT NULL,
            bmc_username TEXT NOT NULL,
            bmc_password TEXT NOT NULL,
            vendor       TEXT,
            last_seen    TEXT
        );

        CREATE TABLE jobs (
            id                  BLOB PRIMARY KEY,
            server_serial       TEXT NOT NULL REFERENCES servers (serial) ON DELETE RESTRICT,
            status              TEXT NOT NULL DEFAULT 'queued',
            failed_step         TEXT,
            recipe              TEXT NOT NULL,
            maintenance_iso_url TEXT NOT NULL,
            task_iso_path       TEXT,
            worker_id           TEXT,
            picked_at           TEXT,
            lease_expires_at    TEXT,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX idx_jobs_status_created ON jobs (status, created_at);
        CREATE INDEX idx_jobs_server_serial ON jobs (server_serial);

        CREATE TABLE job_events (
            id      INTEGER PRIMARY KEY AUTOINCREMENT,
            job_id  BLOB NOT NULL REFERENCES jobs (id) ON DELETE CASCADE,
            time    TEXT NOT NULL,
            level   TEXT NOT NULL,
            step    TEXT,
            message TEXT NOT NULL
        );

        CREATE INDEX idx_job_events_job ON job_events (job_id, id);
        "#,
    ),
    (
        2,
        // Lease stealing scans provisioning rows by expiry.
        r#"
        CREATE INDEX idx_jobs_lease ON jobs (status, lease_expires_at);
        "#,
    ),
];

pub(super) async fn apply(pool: &SqlitePool) -> Result<()> {
    for (version, sql) in MIGRATIONS {
        if *version <= current_version(pool).await? {
            continue;
        }

        let mut tx = pool.begin().await?;
        sqlx::raw_sql(sql)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("migration {version} failed"))?;
        sqlx::query(
            r#"
            INSERT INTO settings (key, value) VALUES ('schema_version', ?1)
            ON CONFLICT (key) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(version.to_string())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;

        tracing::info!(version, "applied schema migration");
    }
    Ok(())
}

async fn current_version(pool: &SqlitePool) -> Result<i64> {
    let has_settings = sqlx::query_scalar::<_, String>(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'settings'",
    )
    .fetch_optional(pool)
    .await?;
    if has_settings.is_none() {
        return Ok(0);
    }

    let version = sqlx::query_scalar::<_, String>(
        "SELECT value FROM settings WHERE key = 'schema_version'",
    )
    .fetch_optional(pool)
    .await?;
    Ok(version.and_then(|v| v.parse().ok()).unwrap_or(0))
}
