//! Storage Writer: durable, idempotent persistence of readings and identities.
//!
//! Backed by SQLite through a `sqlx` pool. Every write runs in its own
//! transaction and is committed with `synchronous = FULL` before the call
//! returns, so an `Ok` means the row survives a crash.
//!
//! Readings are upserted on the natural key `(sensor, observed_at)`; a
//! redelivered reading replaces the stored values (latest values win) and
//! never creates a second row.

use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteSynchronous,
};

use crate::config::Config;
use crate::error::{ConfigError, StorageError};
use crate::models::{HubIdentity, Reading, ReadingRow, SensorIdentity};
use crate::schema;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

// ---

#[derive(Debug, Clone)]
pub struct Store {
    // ---
    pool: SqlitePool,
}

impl Store {
    // ---
    /// Open (creating if needed) the database at `url` and apply the schema.
    pub async fn open(url: &str, max_connections: u32) -> Result<Self, StorageError> {
        // ---
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(BUSY_TIMEOUT);

        if let Some(parent) = options.get_filename().parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                tracing::info!("Creating storage directory {}", parent.display());
                std::fs::create_dir_all(parent)?;
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    /// Open the configured database. A path that cannot be created or opened
    /// is a configuration problem, reported against `DATABASE_URL`.
    pub async fn open_configured(cfg: &Config) -> Result<Self, ConfigError> {
        // ---
        Self::open(&cfg.db_url, cfg.db_pool_max)
            .await
            .map_err(|e| ConfigError::Invalid {
                name: "DATABASE_URL",
                reason: format!("cannot open '{}': {}", cfg.db_url, e),
            })
    }

    /// Private in-memory database, used by tests and dry runs.
    ///
    /// Pinned to one connection that is never recycled: an in-memory SQLite
    /// database lives exactly as long as its connection.
    pub async fn open_in_memory() -> Result<Self, StorageError> {
        // ---
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        // ---
        schema::create_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Insert hub and sensor if unseen, then return the stored identity.
    pub async fn ensure_identity(
        &self,
        hub_id: &str,
        sensor_id: &str,
    ) -> Result<SensorIdentity, StorageError> {
        // ---
        let now = Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO hubs (hub_id, first_seen) VALUES (?1, ?2)
            ON CONFLICT (hub_id) DO NOTHING
            "#,
        )
        .bind(hub_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO sensors (hub_id, sensor_id, first_seen) VALUES (?1, ?2, ?3)
            ON CONFLICT (hub_id, sensor_id) DO NOTHING
            "#,
        )
        .bind(hub_id)
        .bind(sensor_id)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let identity = sqlx::query_as::<_, SensorIdentity>(
            r#"
            SELECT id AS "key", hub_id, sensor_id
            FROM sensors
            WHERE hub_id = ?1 AND sensor_id = ?2
            "#,
        )
        .bind(hub_id)
        .bind(sensor_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(identity)
    }

    /// Upsert one accepted reading; committed before returning.
    pub async fn append(
        &self,
        identity: &SensorIdentity,
        reading: &Reading,
        received_at: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        // ---
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO readings (
                sensor_key, observed_at,
                temperature, humidity, moisture, received_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (sensor_key, observed_at) DO UPDATE SET
                temperature = excluded.temperature,
                humidity    = excluded.humidity,
                moisture    = excluded.moisture,
                received_at = excluded.received_at
            "#,
        )
        .bind(identity.key)
        .bind(reading.observed_at.timestamp())
        .bind(reading.temperature)
        .bind(reading.humidity)
        .bind(reading.moisture)
        .bind(received_at.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Readings of one sensor with `from <= observed_at <= to`, oldest first.
    pub async fn query_range(
        &self,
        hub_id: &str,
        sensor_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<Reading>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, ReadingRow>(
            r#"
            SELECT s.hub_id, s.sensor_id,
                   r.temperature, r.humidity, r.moisture, r.observed_at
            FROM readings r
            JOIN sensors s ON s.id = r.sensor_key
            WHERE s.hub_id = ?1 AND s.sensor_id = ?2
              AND r.observed_at BETWEEN ?3 AND ?4
            ORDER BY r.observed_at ASC
            "#,
        )
        .bind(hub_id)
        .bind(sensor_id)
        .bind(from.timestamp())
        .bind(to.timestamp())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| {
                let at = row.observed_at;
                row.into_reading()
                    .ok_or_else(|| StorageError::Corrupt(format!("observed_at {at} out of range")))
            })
            .collect()
    }

    /// All hubs in creation order.
    pub async fn list_hubs(&self) -> Result<Vec<HubIdentity>, StorageError> {
        // ---
        let hubs = sqlx::query_as::<_, HubIdentity>("SELECT hub_id FROM hubs ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        Ok(hubs)
    }

    /// All sensors in creation order.
    pub async fn list_sensors(&self) -> Result<Vec<SensorIdentity>, StorageError> {
        // ---
        let sensors = sqlx::query_as::<_, SensorIdentity>(
            r#"SELECT id AS "key", hub_id, sensor_id FROM sensors ORDER BY id"#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(sensors)
    }

    /// Newest stored `observed_at` per sensor key.
    pub async fn last_accepted(&self) -> Result<Vec<(i64, DateTime<Utc>)>, StorageError> {
        // ---
        let rows = sqlx::query_as::<_, (i64, i64)>(
            "SELECT sensor_key, MAX(observed_at) FROM readings GROUP BY sensor_key",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(key, at)| {
                DateTime::<Utc>::from_timestamp(at, 0)
                    .map(|ts| (key, ts))
                    .ok_or_else(|| StorageError::Corrupt(format!("observed_at {at} out of range")))
            })
            .collect()
    }

    pub async fn count_readings(&self) -> Result<i64, StorageError> {
        // ---
        let (count,) = sqlx::query_as::<_, (i64,)>("SELECT COUNT(*) FROM readings")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Administrative reset: drop and recreate all tables.
    pub async fn reset(&self) -> Result<(), StorageError> {
        // ---
        tracing::warn!("Resetting storage: dropping hubs, sensors and readings");
        schema::recreate_schema(&self.pool).await?;
        Ok(())
    }

    /// Close the pool, waiting for checked-out connections to return.
    pub async fn close(&self) {
        // ---
        self.pool.close().await;
        tracing::info!("Storage closed");
    }

    pub fn is_closed(&self) -> bool {
        self.pool.is_closed()
    }
}
