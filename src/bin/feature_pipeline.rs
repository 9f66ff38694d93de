use std::path::PathBuf;

use tdf::{
    aggregate_hourly, build_features_and_target, fill_gaps, init_logging, load_monthly_trips,
    log_pipeline_finish, log_pipeline_start, logging_config_from_env, validate_trips, FeatureStore,
    TripDataConfig, YearMonth,
};

const DEFAULT_N_LAGS: u32 = 24;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let logging = logging_config_from_env();
    init_logging(&logging)?;

    let token = std::env::args()
        .nth(1)
        .ok_or("usage: feature_pipeline YYYY_MM")?;
    let year_month = YearMonth::parse_token(&token)?;

    let mut cfg = TripDataConfig::default();
    if let Ok(data_root) = std::env::var("TDF_DATA_ROOT") {
        cfg.data_root = PathBuf::from(data_root);
    }
    if let Ok(base_url) = std::env::var("TDF_BASE_URL") {
        cfg.base_url = base_url;
    }
    let store_path = std::env::var("TDF_STORE_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("data/features.sqlite"));
    let n_lags = parse_n_lags()?;

    log_pipeline_start(&logging, &token, n_lags);

    // A missing partition or malformed token aborts with a non-zero exit;
    // skip-and-continue semantics belong to multi-month backfills only.
    let trips = load_monthly_trips(year_month, &cfg)?;
    let validated = validate_trips(
        &trips,
        year_month.start_ts_ms_utc(),
        year_month.end_ts_ms_utc_exclusive(),
    );

    let hourly = aggregate_hourly(&validated);
    let (complete, report) = fill_gaps(&hourly)?;
    let dataset = build_features_and_target(&complete, None, n_lags)?;

    let mut store = FeatureStore::open(&store_path)?;
    store.upsert_hourly(&complete)?;
    store.replace_features(&dataset)?;

    log_pipeline_finish(&token, complete.len() as u64, dataset.table.len() as u64);
    println!(
        "Feature pipeline complete for {year_month} | trips={} locations={} grid_len={} feature_rows={} store={}",
        validated.len(),
        report.location_count,
        report.grid_len,
        dataset.table.len(),
        store_path.display()
    );

    Ok(())
}

fn parse_n_lags() -> Result<u32, Box<dyn std::error::Error>> {
    match std::env::var("TDF_N_LAGS") {
        Ok(raw) => {
            let n: u32 = raw
                .trim()
                .parse()
                .map_err(|_| format!("TDF_N_LAGS must be a positive integer, got '{raw}'"))?;
            if n == 0 {
                return Err("TDF_N_LAGS must be > 0".into());
            }
            Ok(n)
        }
        Err(_) => Ok(DEFAULT_N_LAGS),
    }
}
