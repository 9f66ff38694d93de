//! TDF core crate: taxi-demand feature engineering.
//!
//! Implemented scope:
//! - monthly raw-trip archive sync and decoding
//! - hourly aggregation and global-grid gap filling
//! - lag-feature table assembly with a fingerprinted schema
//! - chronological train/test splitting
//! - sqlite-backed persistence of the hourly series and feature table

mod feature_store;
mod features;
mod observability;
mod split;
mod timeseries;
mod trip_archives;

pub use feature_store::{FeatureStore, StoreError};
pub use features::{
    assert_schema_compatible, build_feature_schema, build_features_and_target, build_lag_rows,
    FeatureColumn, FeatureDType, FeatureDataset, FeatureError, FeatureSchema, LagRow,
    FEATURE_SCHEMA_VERSION, LOCATION_ID_COLUMN, PICKUP_HOUR_COLUMN, TARGET_COLUMN,
};
pub use observability::{
    init_logging, log_pipeline_finish, log_pipeline_start, logging_config_from_env, LogFormat,
    LoggingConfig, LoggingInitError,
};
pub use split::{split_train_test, TrainTestSplit};
pub use timeseries::{
    aggregate_hourly, fill_gaps, floor_to_hour_ms, validate_trips, GapFillReport, HourlyRides,
    TimeSeriesError, TripEvent, HOUR_MS,
};
pub use trip_archives::{
    load_monthly_trips, load_raw_trips, plan_archive, sync_archive, LocalArchiveSource,
    LocalTripArchive, TripArchiveRef, TripDataConfig, TripLoadError, YearMonth,
};
