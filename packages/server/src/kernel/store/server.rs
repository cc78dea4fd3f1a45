//! Server inventory records.
//!
//! Rows are upserted by administrators out of band and referenced by jobs.
//! BMC passwords pass through the store's [`SecretCipher`] on the way in and
//! out, so the column holds ciphertext whenever a passphrase is configured.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use typed_builder::TypedBuilder;

use super::Store;

#[derive(Debug, Clone, FromRow, Serialize, TypedBuilder)]
pub struct ServerRecord {
    #[builder(setter(into))]
    pub serial: String,

    #[builder(setter(into))]
    pub bmc_address: String,

    #[builder(setter(into))]
    pub bmc_username: String,

    #[serde(skip_serializing)]
    #[builder(setter(into))]
    pub bmc_password: String,

    #[builder(default)]
    pub vendor: Option<String>,

    #[builder(default)]
    pub last_seen: Option<DateTime<Utc>>,
}

/// Result of a delete attempt; referenced servers cannot be removed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteServerOutcome {
    Deleted,
    NotFound,
    ReferencedByJobs,
}

impl ServerRecord {
    /// Insert or replace the record for this serial.
    pub async fn upsert(&self, store: &Store) -> Result<()> {
        let sealed = store
            .secrets()
            .seal(&self.bmc_password)
            .context("sealing BMC password")?;

        sqlx::query(
            r#"
            INSERT INTO servers (serial, bmc_address, bmc_username, bmc_password, vendor, last_seen)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (serial) DO UPDATE SET
                bmc_address = excluded.bmc_address,
                bmc_username = excluded.bmc_username,
                bmc_password = excluded.bmc_password,
                vendor = excluded.vendor
            "#,
        )
        .bind(&self.serial)
        .bind(&self.bmc_address)
        .bind(&self.bmc_username)
        .bind(&sealed)
        .bind(&self.vendor)
        .bind(self.last_seen)
        .execute(store.pool())
        .await?;

        Ok(())
    }

    pub async fn find_by_serial(serial: &str, store: &Store) -> Result<Option<Self>> {
        let record = sqlx::query_as::<_, Self>(
            r#"
            SELECT serial, bmc_address, bmc_username, bmc_password, vendor, last_seen
            FROM servers
            WHERE serial = ?1
            "#,
        )
        .bind(serial)
        .fetch_optional(store.pool())
        .await?;

        match record {
            Some(mut record) => {
                record.bmc_password = store
                    .secrets()
                    .open(&record.bmc_password)
                    .with_context(|| format!("unsealing BMC password for {serial}"))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// Stamp the server as recently touched by a pipeline.
    pub async fn touch_last_seen(serial: &str, store: &Store) -> Result<()> {
        sqlx::query("UPDATE servers SET last_seen = ?1 WHERE serial = ?2")
            .bind(Utc::now())
            .bind(serial)
            .execute(store.pool())
            .await?;
        Ok(())
    }

    /// Delete a server. The foreign key from jobs restricts removal while any
    /// referencing job exists.
    pub async fn delete(serial: &str, store: &Store) -> Result<DeleteServerOutcome> {
        let result = sqlx::query("DELETE FROM servers WHERE serial = ?1")
            .bind(serial)
            .execute(store.pool())
            .await;

        match result {
            Ok(done) if done.rows_affected() == 1 => Ok(DeleteServerOutcome::Deleted),
            Ok(_) => Ok(DeleteServerOutcome::NotFound),
            Err(sqlx::Error::Database(db)) if is_foreign_key_violation(db.code().as_deref()) => {
                Ok(DeleteServerOutcome::ReferencedByJobs)
            }
            Err(e) => Err(e.into()),
        }
    }
}

// SQLite extended result codes for FOREIGN KEY constraint failures.
fn is_foreign_key_violation(code: Option<&str>) -> bool {
    matches!(code, Some("787") | Some("1811"))
}
