//! SQLite-backed persistence for the hourly series and feature table.
//!
//! The `tabular_features` table is generated from the [`FeatureSchema`] so
//! that the persisted column names (`rides_previous_{k}_hour`, `target`,
//! `pickup_hour`, `pickup_location_id`) stay the contract consumed by
//! training and inference. The schema itself is stored alongside the rows;
//! reads hand it back so callers can assert compatibility.

use std::path::Path;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use thiserror::Error;
use tracing::info;

use crate::features::{FeatureDataset, FeatureSchema, LagRow};
use crate::timeseries::HourlyRides;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("schema serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("feature schema missing from store (no feature table written yet)")]
    MissingSchema,
}

pub struct FeatureStore {
    conn: Connection,
}

impl FeatureStore {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA temp_store=MEMORY;
            ",
        )?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS hourly_rides (
                pickup_location_id INTEGER NOT NULL,
                pickup_hour_ms INTEGER NOT NULL,
                rides INTEGER NOT NULL,
                PRIMARY KEY(pickup_location_id, pickup_hour_ms)
            ) WITHOUT ROWID;

            CREATE TABLE IF NOT EXISTS feature_schema (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                version INTEGER NOT NULL,
                fingerprint TEXT NOT NULL,
                schema_json TEXT NOT NULL
            );
            ",
        )?;

        Ok(Self { conn })
    }

    pub fn upsert_hourly(&mut self, rows: &[HourlyRides]) -> Result<(), StoreError> {
        if rows.is_empty() {
            return Ok(());
        }

        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare(
                "
                INSERT INTO hourly_rides (pickup_location_id, pickup_hour_ms, rides)
                VALUES (?1, ?2, ?3)
                ON CONFLICT(pickup_location_id, pickup_hour_ms) DO UPDATE SET
                    rides = excluded.rides
                ",
            )?;
            for row in rows {
                stmt.execute(params![row.location_id, row.pickup_hour_ms_utc, row.rides])?;
            }
        }
        tx.commit()?;

        info!(
            component = "feature_store",
            event = "store.hourly.upserted",
            row_count = rows.len() as u64
        );
        Ok(())
    }

    pub fn load_hourly_range(
        &self,
        start_ts_ms: i64,
        end_ts_ms_exclusive: i64,
    ) -> Result<Vec<HourlyRides>, StoreError> {
        let mut stmt = self.conn.prepare(
            "
            SELECT pickup_location_id, pickup_hour_ms, rides
            FROM hourly_rides
            WHERE pickup_hour_ms >= ?1
              AND pickup_hour_ms < ?2
            ORDER BY pickup_location_id ASC, pickup_hour_ms ASC
            ",
        )?;

        let rows = stmt
            .query_map(params![start_ts_ms, end_ts_ms_exclusive], |row| {
                Ok(HourlyRides {
                    location_id: row.get(0)?,
                    pickup_hour_ms_utc: row.get(1)?,
                    rides: row.get(2)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows)
    }

    pub fn count_hourly_range(
        &self,
        start_ts_ms: i64,
        end_ts_ms_exclusive: i64,
    ) -> Result<u64, StoreError> {
        let count: i64 = self.conn.query_row(
            "
            SELECT COUNT(*)
            FROM hourly_rides
            WHERE pickup_hour_ms >= ?1
              AND pickup_hour_ms < ?2
            ",
            params![start_ts_ms, end_ts_ms_exclusive],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Replaces the persisted feature table and schema metadata with the
    /// given dataset. The lag columns of `tabular_features` are regenerated
    /// from the dataset's schema, so a changed `n_lags` changes the DDL.
    pub fn replace_features(&mut self, dataset: &FeatureDataset) -> Result<(), StoreError> {
        let schema = &dataset.schema;
        let schema_json = serde_json::to_string(schema)?;

        let tx = self.conn.transaction()?;
        tx.execute_batch("DROP TABLE IF EXISTS tabular_features;")?;
        tx.execute_batch(&feature_table_ddl(schema))?;
        {
            let mut stmt = tx.prepare(&feature_insert_sql(schema))?;
            for row in &dataset.table {
                let mut values: Vec<i64> = Vec::with_capacity(row.lags.len() + 3);
                values.push(row.location_id);
                values.push(row.pickup_hour_ms_utc);
                values.extend(row.lags.iter().map(|v| *v as i64));
                values.push(row.target as i64);
                stmt.execute(params_from_iter(values))?;
            }
        }
        tx.execute(
            "
            INSERT INTO feature_schema (id, version, fingerprint, schema_json)
            VALUES (1, ?1, ?2, ?3)
            ON CONFLICT(id) DO UPDATE SET
                version = excluded.version,
                fingerprint = excluded.fingerprint,
                schema_json = excluded.schema_json
            ",
            params![schema.version, schema.fingerprint, schema_json],
        )?;
        tx.commit()?;

        info!(
            component = "feature_store",
            event = "store.features.replaced",
            row_count = dataset.table.len() as u64,
            n_lags = schema.n_lags,
            fingerprint = schema.fingerprint
        );
        Ok(())
    }

    pub fn load_schema(&self) -> Result<FeatureSchema, StoreError> {
        let schema_json: Option<String> = self
            .conn
            .query_row(
                "SELECT schema_json FROM feature_schema WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        let schema_json = schema_json.ok_or(StoreError::MissingSchema)?;
        Ok(serde_json::from_str(&schema_json)?)
    }

    /// Reads the persisted feature table back, ordered by
    /// `(pickup_location_id, pickup_hour)`, together with its schema.
    pub fn load_feature_table(&self) -> Result<(FeatureSchema, Vec<LagRow>), StoreError> {
        let schema = self.load_schema()?;

        let mut stmt = self.conn.prepare(&feature_select_sql(&schema))?;
        let n_lags = schema.columns.len();
        let rows = stmt
            .query_map([], |row| {
                let location_id: i64 = row.get(0)?;
                let pickup_hour_ms_utc: i64 = row.get(1)?;
                let mut lags = Vec::with_capacity(n_lags);
                for idx in 0..n_lags {
                    lags.push(row.get::<_, u32>(2 + idx)?);
                }
                let target: u32 = row.get(2 + n_lags)?;
                Ok(LagRow {
                    pickup_hour_ms_utc,
                    location_id,
                    lags,
                    target,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok((schema, rows))
    }
}

fn feature_table_ddl(schema: &FeatureSchema) -> String {
    let mut ddl = String::from(
        "CREATE TABLE tabular_features (\n    pickup_location_id INTEGER NOT NULL,\n    pickup_hour_ms INTEGER NOT NULL,\n",
    );
    for column in &schema.columns {
        ddl.push_str(&format!("    {} INTEGER NOT NULL,\n", column.name));
    }
    ddl.push_str(
        "    target INTEGER NOT NULL,\n    PRIMARY KEY(pickup_location_id, pickup_hour_ms)\n) WITHOUT ROWID;",
    );
    ddl
}

fn feature_insert_sql(schema: &FeatureSchema) -> String {
    let mut columns = vec!["pickup_location_id".to_string(), "pickup_hour_ms".to_string()];
    columns.extend(schema.columns.iter().map(|c| c.name.clone()));
    columns.push("target".to_string());

    let placeholders: Vec<String> = (1..=columns.len()).map(|idx| format!("?{idx}")).collect();
    format!(
        "INSERT INTO tabular_features ({}) VALUES ({})",
        columns.join(", "),
        placeholders.join(", ")
    )
}

fn feature_select_sql(schema: &FeatureSchema) -> String {
    let mut columns = vec!["pickup_location_id".to_string(), "pickup_hour_ms".to_string()];
    columns.extend(schema.columns.iter().map(|c| c.name.clone()));
    columns.push("target".to_string());

    format!(
        "SELECT {} FROM tabular_features ORDER BY pickup_location_id ASC, pickup_hour_ms ASC",
        columns.join(", ")
    )
}
