//! Append-only sensor log on SQLite.

use anyhow::{Context, Result};
use serde::ser::{Serialize, SerializeTuple, Serializer};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Pool, Sqlite};
use std::str::FromStr;
use thiserror::Error;
use tracing::warn;

use crate::clock::Timestamp;
use crate::state::SensorReading;

/// Number of rows the dashboard history shows.
pub const HISTORY_LIMIT: i64 = 300;

#[derive(Debug, Error)]
#[error("log store: {op} failed: {source}")]
pub struct StoreError {
    op: &'static str,
    #[source]
    source: sqlx::Error,
}

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

/// A stored log row. Serialized as a positional array in column order:
/// `[id, tanggal, hari, waktu, moisture, soil_temp, air_temp, air_hum, pump_state]`.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct LogEntry {
    pub id: i64,
    #[sqlx(rename = "tanggal")]
    pub date: String,
    #[sqlx(rename = "hari")]
    pub weekday: String,
    #[sqlx(rename = "waktu")]
    pub time: String,
    pub moisture: f64,
    pub soil_temp: f64,
    pub air_temp: f64,
    pub air_hum: f64,
    pub pump_state: String,
}

impl Serialize for LogEntry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut row = serializer.serialize_tuple(9)?;
        row.serialize_element(&self.id)?;
        row.serialize_element(&self.date)?;
        row.serialize_element(&self.weekday)?;
        row.serialize_element(&self.time)?;
        row.serialize_element(&self.moisture)?;
        row.serialize_element(&self.soil_temp)?;
        row.serialize_element(&self.air_temp)?;
        row.serialize_element(&self.air_hum)?;
        row.serialize_element(&self.pump_state)?;
        row.end()
    }
}

/// A row about to be appended; the id is assigned by the store.
#[derive(Debug, Clone, PartialEq)]
pub struct NewLogEntry {
    pub stamp: Timestamp,
    pub moisture: f64,
    pub soil_temp: f64,
    pub air_temp: f64,
    pub air_hum: f64,
    pub pump_state: String,
}

impl NewLogEntry {
    /// Snapshot of a reading's numeric and pump fields plus its stamp.
    pub fn from_reading(r: &SensorReading) -> Self {
        Self {
            stamp: r.stamp.clone(),
            moisture: r.moisture_percent,
            soil_temp: r.soil_temperature,
            air_temp: r.air_temperature,
            air_hum: r.air_humidity,
            pump_state: r.pump_state.label().to_string(),
        }
    }
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/irrigation/data.db?mode=rwc"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5));

        // Every connection to ":memory:" opens its own empty database, so an
        // in-memory store must live on exactly one connection.
        let in_memory = db_url.contains(":memory:");
        let pool = SqlitePoolOptions::new()
            .max_connections(if in_memory { 1 } else { 5 })
            .min_connections(if in_memory { 1 } else { 0 })
            .idle_timeout(if in_memory { None } else { Some(std::time::Duration::from_secs(600)) })
            .max_lifetime(if in_memory { None } else { Some(std::time::Duration::from_secs(1800)) })
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Persist one entry and return its id. The row is committed before
    /// this returns.
    pub async fn append(&self, e: &NewLogEntry) -> Result<i64, StoreError> {
        let done = sqlx::query(
            r#"
            INSERT INTO sensor_log
              (tanggal, hari, waktu, moisture, soil_temp, air_temp, air_hum, pump_state)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&e.stamp.date)
        .bind(&e.stamp.weekday)
        .bind(&e.stamp.time)
        .bind(e.moisture)
        .bind(e.soil_temp)
        .bind(e.air_temp)
        .bind(e.air_hum)
        .bind(&e.pump_state)
        .execute(&self.pool)
        .await
        .map_err(|source| StoreError {
            op: "append",
            source,
        })?;

        Ok(done.last_insert_rowid())
    }

    /// Up to `limit` entries, newest first. Read failures are logged and
    /// yield an empty list.
    pub async fn recent(&self, limit: i64) -> Vec<LogEntry> {
        let rows = sqlx::query_as::<_, LogEntry>(
            r#"
            SELECT id, tanggal, hari, waktu, moisture, soil_temp, air_temp, air_hum, pump_state
            FROM sensor_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit.max(0))
        .fetch_all(&self.pool)
        .await;

        match rows {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "log store: recent failed, returning empty history");
                Vec::new()
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
