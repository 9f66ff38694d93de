//! Chronological train/test partitioning.
//!
//! The cutoff is a hard temporal boundary, not a statistical sample:
//! evaluation must reflect forecasting into the future, never interpolating.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::features::LagRow;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainTestSplit {
    pub x_train: Vec<Vec<f64>>,
    pub y_train: Vec<f64>,
    pub x_test: Vec<Vec<f64>>,
    pub y_test: Vec<f64>,
}

impl TrainTestSplit {
    pub fn is_degenerate(&self) -> bool {
        self.y_train.is_empty() || self.y_test.is_empty()
    }
}

/// Partitions the full annotated table at `cutoff_ts_ms`: rows with
/// `pickup_hour < cutoff` go to train, the rest to test. No shuffling.
///
/// A cutoff outside the table's hour range yields a degenerate (empty)
/// partition and a structured warning; validating the cutoff against the data
/// range up front is the caller's responsibility.
pub fn split_train_test(table: &[LagRow], cutoff_ts_ms: i64) -> TrainTestSplit {
    if let (Some(min_hour), Some(max_hour)) = (
        table.iter().map(|row| row.pickup_hour_ms_utc).min(),
        table.iter().map(|row| row.pickup_hour_ms_utc).max(),
    ) {
        if cutoff_ts_ms <= min_hour || cutoff_ts_ms > max_hour {
            warn!(
                component = "split",
                event = "split.cutoff_out_of_range",
                cutoff_ts_ms = cutoff_ts_ms,
                min_hour_ms = min_hour,
                max_hour_ms = max_hour
            );
        }
    }

    let mut split = TrainTestSplit {
        x_train: Vec::new(),
        y_train: Vec::new(),
        x_test: Vec::new(),
        y_test: Vec::new(),
    };

    for row in table {
        let features: Vec<f64> = row.lags.iter().map(|v| *v as f64).collect();
        if row.pickup_hour_ms_utc < cutoff_ts_ms {
            split.x_train.push(features);
            split.y_train.push(row.target as f64);
        } else {
            split.x_test.push(features);
            split.y_test.push(row.target as f64);
        }
    }

    info!(
        component = "split",
        event = "split.finish",
        cutoff_ts_ms = cutoff_ts_ms,
        train_rows = split.y_train.len() as u64,
        test_rows = split.y_test.len() as u64
    );

    split
}
