use anyhow::{Context, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::collections::BTreeMap;
use std::str::FromStr;
use time::OffsetDateTime;

/// Attribute names used by the bridge.
pub const ATTR_CALIBRATION: &str = "calibration";
pub const ATTR_ZONES: &str = "config/zones";
pub const ATTR_SENSORS: &str = "config/sensors";
pub const ATTR_PROGRAMS: &str = "config/programs";

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/var/lib/sprinkler-bridge/bridge.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
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

    pub fn now_unix() -> i64 {
        OffsetDateTime::now_utc().unix_timestamp()
    }

    // ----------------------------
    // Attributes
    // ----------------------------

    /// Store `value` as JSON under `name`, replacing any previous value.
    pub async fn set_attribute<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
        let json = serde_json::to_string(value)
            .with_context(|| format!("failed to encode attribute '{name}'"))?;
        sqlx::query(
            r#"
            INSERT INTO attributes (name, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(json)
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("set_attribute '{name}' failed"))?;
        Ok(())
    }

    /// Load an attribute. A stored value that no longer decodes into `T` is
    /// reported as absent so a schema change never blocks start-up.
    pub async fn get_attribute<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT value FROM attributes WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("get_attribute '{name}' failed"))?;

        Ok(row.and_then(|(json,)| match serde_json::from_str(&json) {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!(attribute = name, "db: ignoring undecodable attribute: {e}");
                None
            }
        }))
    }

    // ----------------------------
    // Published values
    // ----------------------------

    pub async fn upsert_value(&self, name: &str, value: &Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO device_values (name, value, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
              value=excluded.value,
              updated_at=excluded.updated_at
            "#,
        )
        .bind(name)
        .bind(value.to_string())
        .bind(Self::now_unix())
        .execute(&self.pool)
        .await
        .with_context(|| format!("upsert_value '{name}' failed"))?;
        Ok(())
    }

    pub async fn load_values(&self) -> Result<BTreeMap<String, Value>> {
        let rows: Vec<(String, String)> =
            sqlx::query_as("SELECT name, value FROM device_values ORDER BY name")
                .fetch_all(&self.pool)
                .await
                .context("load_values failed")?;

        Ok(rows
            .into_iter()
            .filter_map(|(name, json)| serde_json::from_str(&json).ok().map(|v| (name, v)))
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
