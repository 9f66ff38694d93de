//! Lag-feature construction over the completed hourly series.
//!
//! Column names and order (`rides_previous_{k}_hour` for k = 1..N, then
//! `target`) are the persisted contract shared by training and inference; the
//! schema fingerprint exists to catch drift between the two.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::info;

use crate::timeseries::HourlyRides;

pub const FEATURE_SCHEMA_VERSION: u32 = 1;

pub const PICKUP_HOUR_COLUMN: &str = "pickup_hour";
pub const LOCATION_ID_COLUMN: &str = "pickup_location_id";
pub const TARGET_COLUMN: &str = "target";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FeatureDType {
    U32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureColumn {
    pub name: String,
    pub dtype: FeatureDType,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureSchema {
    pub version: u32,
    pub fingerprint: String,
    pub n_lags: u32,
    /// Lag feature columns only, in fixed lag order 1..N. The annotation
    /// columns (`pickup_hour`, `pickup_location_id`) and `target` are named
    /// by the module-level constants.
    pub columns: Vec<FeatureColumn>,
}

/// One row of the full annotated feature table.
///
/// `lags[k - 1]` is the ride count `k` hours before `pickup_hour_ms_utc` for
/// the same location; `target` is the count at `pickup_hour_ms_utc`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LagRow {
    pub pickup_hour_ms_utc: i64,
    pub location_id: i64,
    pub lags: Vec<u32>,
    pub target: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureDataset {
    pub schema: FeatureSchema,
    pub table: Vec<LagRow>,
}

impl FeatureDataset {
    /// Numeric feature matrix for model consumption: lag columns only,
    /// `hour`/`location_id`/`target` stripped.
    pub fn feature_matrix(&self) -> Vec<Vec<f64>> {
        self.table
            .iter()
            .map(|row| row.lags.iter().map(|v| *v as f64).collect())
            .collect()
    }

    pub fn targets(&self) -> Vec<f64> {
        self.table.iter().map(|row| row.target as f64).collect()
    }
}

#[derive(Debug, Error)]
pub enum FeatureError {
    #[error("invalid lag configuration: {0}")]
    InvalidConfig(String),
    #[error("location {0} not present in the hourly series")]
    UnknownLocation(i64),
    #[error("schema version mismatch: expected {expected}, got {actual}")]
    SchemaVersionMismatch { expected: u32, actual: u32 },
    #[error("schema fingerprint mismatch: expected {expected}, got {actual}")]
    SchemaFingerprintMismatch { expected: String, actual: String },
}

pub fn build_feature_schema(n_lags: u32) -> FeatureSchema {
    let columns: Vec<FeatureColumn> = (1..=n_lags)
        .map(|lag| FeatureColumn {
            name: format!("rides_previous_{lag}_hour"),
            dtype: FeatureDType::U32,
        })
        .collect();

    let fingerprint = schema_fingerprint(n_lags, &columns);

    info!(
        component = "features",
        event = "features.schema.built",
        version = FEATURE_SCHEMA_VERSION,
        n_lags = n_lags,
        column_count = columns.len(),
        fingerprint = fingerprint
    );

    FeatureSchema {
        version: FEATURE_SCHEMA_VERSION,
        fingerprint,
        n_lags,
        columns,
    }
}

pub fn assert_schema_compatible(
    expected_version: u32,
    expected_fingerprint: &str,
    actual: &FeatureSchema,
) -> Result<(), FeatureError> {
    if expected_version != actual.version {
        return Err(FeatureError::SchemaVersionMismatch {
            expected: expected_version,
            actual: actual.version,
        });
    }

    if expected_fingerprint != actual.fingerprint {
        return Err(FeatureError::SchemaFingerprintMismatch {
            expected: expected_fingerprint.to_string(),
            actual: actual.fingerprint.clone(),
        });
    }

    Ok(())
}

/// Sliding-window transform over one location's complete, chronologically
/// sorted hourly series. The first `n_lags` rows have insufficient history
/// and are dropped, never imputed.
pub fn build_lag_rows(series: &[HourlyRides], n_lags: usize) -> Vec<LagRow> {
    if series.len() <= n_lags {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(series.len() - n_lags);
    for t in n_lags..series.len() {
        let lags: Vec<u32> = (1..=n_lags).map(|lag| series[t - lag].rides).collect();
        out.push(LagRow {
            pickup_hour_ms_utc: series[t].pickup_hour_ms_utc,
            location_id: series[t].location_id,
            lags,
            target: series[t].rides,
        });
    }
    out
}

/// Assembles the feature table from the completed hourly series.
///
/// With `location_id` set, restricts to that location; otherwise runs the lag
/// builder independently per location in ascending id order and concatenates.
/// Running the shift across the whole mixed-location table would corrupt lag
/// values at location boundaries.
pub fn build_features_and_target(
    complete: &[HourlyRides],
    location_id: Option<i64>,
    n_lags: u32,
) -> Result<FeatureDataset, FeatureError> {
    if n_lags == 0 {
        return Err(FeatureError::InvalidConfig(
            "n_lags must be > 0".to_string(),
        ));
    }

    info!(
        component = "features",
        event = "features.assemble.start",
        input_rows = complete.len() as u64,
        n_lags = n_lags,
        location_id = location_id
    );

    let schema = build_feature_schema(n_lags);

    let mut buckets: BTreeMap<i64, Vec<HourlyRides>> = BTreeMap::new();
    for row in complete {
        if let Some(wanted) = location_id {
            if row.location_id != wanted {
                continue;
            }
        }
        buckets.entry(row.location_id).or_default().push(*row);
    }

    if let Some(wanted) = location_id {
        if buckets.is_empty() {
            return Err(FeatureError::UnknownLocation(wanted));
        }
    }

    let mut table = Vec::new();
    for series in buckets.values_mut() {
        series.sort_by_key(|row| row.pickup_hour_ms_utc);
        table.extend(build_lag_rows(series, n_lags as usize));
    }

    info!(
        component = "features",
        event = "features.assemble.finish",
        location_count = buckets.len() as u64,
        output_rows = table.len() as u64
    );

    Ok(FeatureDataset { schema, table })
}

fn schema_fingerprint(n_lags: u32, columns: &[FeatureColumn]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("version:{FEATURE_SCHEMA_VERSION};"));
    hasher.update(format!("n_lags:{n_lags};"));
    hasher.update("columns:");
    for column in columns {
        hasher.update(column.name.as_bytes());
        hasher.update(":u32;");
    }
    hasher.update(format!("{TARGET_COLUMN}:u32;"));
    hex::encode(hasher.finalize())
}
