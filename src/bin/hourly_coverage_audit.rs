use std::collections::HashMap;
use std::path::PathBuf;

use tdf::{
    aggregate_hourly, load_monthly_trips, validate_trips, TripDataConfig, YearMonth, HOUR_MS,
};

#[derive(Default, Debug, Clone, Copy)]
struct Totals {
    locations: u64,
    observed_rows: u64,
    missing_rows: u64,
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let token = std::env::args()
        .nth(1)
        .ok_or("usage: hourly_coverage_audit YYYY_MM")?;
    let year_month = YearMonth::parse_token(&token)?;

    let mut cfg = TripDataConfig::default();
    if let Ok(data_root) = std::env::var("TDF_DATA_ROOT") {
        cfg.data_root = PathBuf::from(data_root);
    }

    println!("Running hourly coverage audit for {year_month} (pre gap-fill)");

    let trips = load_monthly_trips(year_month, &cfg)?;
    let validated = validate_trips(
        &trips,
        year_month.start_ts_ms_utc(),
        year_month.end_ts_ms_utc_exclusive(),
    );
    let hourly = aggregate_hourly(&validated);

    if hourly.is_empty() {
        return Err(format!("no hourly rows for {year_month}; nothing to audit").into());
    }

    let grid_start = hourly
        .iter()
        .map(|row| row.pickup_hour_ms_utc)
        .min()
        .expect("non-empty hourly table");
    let grid_end = hourly
        .iter()
        .map(|row| row.pickup_hour_ms_utc)
        .max()
        .expect("non-empty hourly table");
    let grid_len = ((grid_end - grid_start) / HOUR_MS + 1) as u64;

    let mut observed_by_location: HashMap<i64, u64> = HashMap::new();
    for row in &hourly {
        *observed_by_location.entry(row.location_id).or_insert(0) += 1;
    }

    let mut totals = Totals::default();
    let mut coverage: Vec<(i64, u64)> = Vec::with_capacity(observed_by_location.len());
    for (location_id, observed) in &observed_by_location {
        totals.locations += 1;
        totals.observed_rows += observed;
        totals.missing_rows += grid_len - observed;
        coverage.push((*location_id, *observed));
    }
    coverage.sort_by_key(|(location_id, observed)| (*observed, *location_id));

    println!(
        "grid_len={grid_len} locations={} observed_rows={} missing_rows={} (to be zero-filled)",
        totals.locations, totals.observed_rows, totals.missing_rows
    );

    println!("\nWorst-covered locations:");
    for (location_id, observed) in coverage.iter().take(10) {
        let pct = 100.0 * *observed as f64 / grid_len as f64;
        println!("  location {location_id:>4} | observed {observed:>5}/{grid_len} hours ({pct:.1}%)");
    }

    Ok(())
}
