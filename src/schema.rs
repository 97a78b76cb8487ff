//! Database schema management for `sensorhub-ingest`.
//!
//! Ensures required tables and indexes exist before ingesting.
//! Applied once on startup when the store is opened, and again by the
//! storage reset command after the old tables are dropped.

use sqlx::{Sqlite, SqlitePool, Transaction};

// ---

/// Statements creating the three logical tables (idempotent).
///
/// `readings` is keyed by the natural key `(sensor_key, observed_at)`;
/// `observed_at` is stored as UTC epoch seconds so ordering is numeric.
const CREATE: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS hubs (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        hub_id      TEXT    NOT NULL UNIQUE,
        first_seen  INTEGER NOT NULL
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS sensors (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        hub_id      TEXT    NOT NULL REFERENCES hubs (hub_id),
        sensor_id   TEXT    NOT NULL,
        first_seen  INTEGER NOT NULL,
        UNIQUE (hub_id, sensor_id)
    );
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS readings (
        sensor_key   INTEGER NOT NULL REFERENCES sensors (id),
        observed_at  INTEGER NOT NULL,
        temperature  REAL    NOT NULL,
        humidity     REAL    NOT NULL,
        moisture     REAL    NOT NULL,
        received_at  INTEGER NOT NULL,
        PRIMARY KEY (sensor_key, observed_at)
    ) WITHOUT ROWID;
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_sensors_hub_id
        ON sensors (hub_id);
    "#,
];

/// Children first, so foreign keys never dangle mid-transaction.
const DROP: &[&str] = &[
    "DROP TABLE IF EXISTS readings;",
    "DROP TABLE IF EXISTS sensors;",
    "DROP TABLE IF EXISTS hubs;",
];

/// Create or update the database schema (idempotent).
///
/// Safe to call on every startup; no-op if objects already exist.
/// Errors are propagated if any SQL execution fails.
pub async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;
    run_all(&mut tx, CREATE).await?;
    tx.commit().await?;
    Ok(())
}

/// Drop every table and create the schema again, atomically.
///
/// The `AUTOINCREMENT` counters of `hubs` and `sensors` are carried over:
/// dropping a table forgets its `sqlite_sequence` row, and a reissued sensor
/// key would let a reading resolved before the reset land on a different
/// sensor afterwards.
pub async fn recreate_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    // ---
    let mut tx = pool.begin().await?;

    let counters = sqlx::query_as::<_, (String, i64)>(
        "SELECT name, seq FROM sqlite_sequence WHERE name IN ('hubs', 'sensors')",
    )
    .fetch_all(&mut *tx)
    .await?;

    run_all(&mut tx, DROP).await?;
    run_all(&mut tx, CREATE).await?;

    for (table, seq) in counters {
        sqlx::query("INSERT INTO sqlite_sequence (name, seq) VALUES (?1, ?2)")
            .bind(table)
            .bind(seq)
            .execute(&mut *tx)
            .await?;
    }

    tx.commit().await?;
    Ok(())
}

async fn run_all(tx: &mut Transaction<'_, Sqlite>, statements: &[&str]) -> Result<(), sqlx::Error> {
    // ---
    for statement in statements {
        sqlx::query(statement).execute(&mut **tx).await?;
    }
    Ok(())
}
