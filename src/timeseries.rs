//! Hourly demand time series: validation, aggregation and gap filling.
//!
//! The transform chain is sparse-to-dense and must run in this order:
//! `validate_trips` -> `aggregate_hourly` -> `fill_gaps`. Lag features built
//! on a series that skipped gap filling silently treat zero-ride hours as
//! nonexistent, which is the main correctness trap of this pipeline.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const HOUR_MS: i64 = 3_600_000;

/// One raw pickup record in the canonical schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripEvent {
    pub pickup_ts_ms_utc: i64,
    pub location_id: i64,
}

/// One observed (or zero-filled) hour of demand for one location.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourlyRides {
    pub pickup_hour_ms_utc: i64,
    pub location_id: i64,
    pub rides: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GapFillReport {
    pub location_count: u64,
    pub grid_len: u64,
    pub observed_rows: u64,
    pub filled_rows: u64,
    pub grid_start_ms_utc: i64,
    pub grid_end_ms_utc_inclusive: i64,
}

#[derive(Debug, Error)]
pub enum TimeSeriesError {
    #[error("empty hourly dataset: no hours to build a grid from")]
    EmptyDataset,
    #[error("hour {0} is not aligned to an hour boundary")]
    UnalignedHour(i64),
}

pub fn floor_to_hour_ms(ts_ms: i64) -> i64 {
    ts_ms.div_euclid(HOUR_MS) * HOUR_MS
}

/// Keeps events with `min_ts_ms <= pickup < max_ts_ms` (half-open bounds).
///
/// Timestamps are not floored here; empty input yields empty output.
pub fn validate_trips(events: &[TripEvent], min_ts_ms: i64, max_ts_ms: i64) -> Vec<TripEvent> {
    events
        .iter()
        .copied()
        .filter(|event| event.pickup_ts_ms_utc >= min_ts_ms && event.pickup_ts_ms_utc < max_ts_ms)
        .collect()
}

/// Floors each pickup to its hour start and counts events per
/// `(hour, location)` group. Only non-empty groups appear; gap filling is a
/// separate, explicit step.
///
/// Output is sorted by `(location_id, hour)` so that reruns over the same
/// input are byte-identical.
pub fn aggregate_hourly(events: &[TripEvent]) -> Vec<HourlyRides> {
    let mut counts: HashMap<(i64, i64), u32> = HashMap::new();
    for event in events {
        let hour = floor_to_hour_ms(event.pickup_ts_ms_utc);
        *counts.entry((event.location_id, hour)).or_insert(0) += 1;
    }

    let mut out: Vec<HourlyRides> = counts
        .into_iter()
        .map(|((location_id, hour), rides)| HourlyRides {
            pickup_hour_ms_utc: hour,
            location_id,
            rides,
        })
        .collect();
    out.sort_by_key(|row| (row.location_id, row.pickup_hour_ms_utc));
    out
}

/// Expands every observed location onto the global hourly grid
/// `[min(hour), max(hour)]`, inserting `rides = 0` for absent hours.
///
/// The grid range is computed over the entire input, never per location, so
/// all per-location series come out the same length and alignment. Locations
/// never observed in the input stay absent; no all-zero series is fabricated.
pub fn fill_gaps(
    hourly: &[HourlyRides],
) -> Result<(Vec<HourlyRides>, GapFillReport), TimeSeriesError> {
    if hourly.is_empty() {
        return Err(TimeSeriesError::EmptyDataset);
    }

    let mut grid_start = i64::MAX;
    let mut grid_end = i64::MIN;
    for row in hourly {
        if row.pickup_hour_ms_utc % HOUR_MS != 0 {
            return Err(TimeSeriesError::UnalignedHour(row.pickup_hour_ms_utc));
        }
        grid_start = grid_start.min(row.pickup_hour_ms_utc);
        grid_end = grid_end.max(row.pickup_hour_ms_utc);
    }
    let grid_len = ((grid_end - grid_start) / HOUR_MS + 1) as usize;

    info!(
        component = "timeseries",
        event = "timeseries.fill.start",
        observed_rows = hourly.len() as u64,
        grid_start_ms_utc = grid_start,
        grid_end_ms_utc_inclusive = grid_end,
        grid_len = grid_len as u64
    );

    // Partition once into dense per-location buckets indexed by hour offset,
    // then emit each bucket; O(locations x grid length).
    let mut buckets: HashMap<i64, Vec<u32>> = HashMap::new();
    for row in hourly {
        let offset = ((row.pickup_hour_ms_utc - grid_start) / HOUR_MS) as usize;
        let bucket = buckets
            .entry(row.location_id)
            .or_insert_with(|| vec![0; grid_len]);
        bucket[offset] = bucket[offset].saturating_add(row.rides);
    }

    let mut location_ids: Vec<i64> = buckets.keys().copied().collect();
    location_ids.sort_unstable();

    let mut out = Vec::with_capacity(location_ids.len() * grid_len);
    for location_id in &location_ids {
        let bucket = &buckets[location_id];
        for (offset, rides) in bucket.iter().enumerate() {
            out.push(HourlyRides {
                pickup_hour_ms_utc: grid_start + offset as i64 * HOUR_MS,
                location_id: *location_id,
                rides: *rides,
            });
        }
    }

    let report = GapFillReport {
        location_count: location_ids.len() as u64,
        grid_len: grid_len as u64,
        observed_rows: hourly.len() as u64,
        filled_rows: (out.len() - hourly.len()) as u64,
        grid_start_ms_utc: grid_start,
        grid_end_ms_utc_inclusive: grid_end,
    };

    info!(
        component = "timeseries",
        event = "timeseries.fill.finish",
        location_count = report.location_count,
        grid_len = report.grid_len,
        observed_rows = report.observed_rows,
        filled_rows = report.filled_rows
    );

    Ok((out, report))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    const BASE: i64 = 1_704_067_200_000; // 2024-01-01T00:00:00Z

    fn event(ts_ms: i64, location_id: i64) -> TripEvent {
        TripEvent {
            pickup_ts_ms_utc: ts_ms,
            location_id,
        }
    }

    #[test]
    fn validate_applies_half_open_bounds() {
        let events = vec![
            event(BASE - 1, 1),
            event(BASE, 1),
            event(BASE + HOUR_MS - 1, 1),
            event(BASE + HOUR_MS, 1),
        ];
        let kept = validate_trips(&events, BASE, BASE + HOUR_MS);
        assert_eq!(kept.len(), 2);
        assert!(kept
            .iter()
            .all(|e| e.pickup_ts_ms_utc >= BASE && e.pickup_ts_ms_utc < BASE + HOUR_MS));
    }

    #[test]
    fn validate_empty_input_yields_empty_output() {
        assert!(validate_trips(&[], BASE, BASE + HOUR_MS).is_empty());
    }

    #[test]
    fn aggregate_floors_and_counts_per_hour_and_location() {
        // 00:05 and 00:40 fall in the same hour; 02:10 in a later one.
        let events = vec![
            event(BASE + 5 * 60_000, 1),
            event(BASE + 40 * 60_000, 1),
            event(BASE + 2 * HOUR_MS + 10 * 60_000, 1),
        ];

        let agg = aggregate_hourly(&events);
        assert_eq!(
            agg,
            vec![
                HourlyRides {
                    pickup_hour_ms_utc: BASE,
                    location_id: 1,
                    rides: 2
                },
                HourlyRides {
                    pickup_hour_ms_utc: BASE + 2 * HOUR_MS,
                    location_id: 1,
                    rides: 1
                },
            ]
        );
    }

    #[test]
    fn fill_gaps_inserts_zero_rows_on_the_global_grid() {
        let agg = vec![
            HourlyRides {
                pickup_hour_ms_utc: BASE,
                location_id: 1,
                rides: 2,
            },
            HourlyRides {
                pickup_hour_ms_utc: BASE + 2 * HOUR_MS,
                location_id: 1,
                rides: 1,
            },
        ];

        let (complete, report) = fill_gaps(&agg).expect("fill succeeds");
        assert_eq!(report.grid_len, 3);
        assert_eq!(report.filled_rows, 1);
        assert_eq!(
            complete,
            vec![
                HourlyRides {
                    pickup_hour_ms_utc: BASE,
                    location_id: 1,
                    rides: 2
                },
                HourlyRides {
                    pickup_hour_ms_utc: BASE + HOUR_MS,
                    location_id: 1,
                    rides: 0
                },
                HourlyRides {
                    pickup_hour_ms_utc: BASE + 2 * HOUR_MS,
                    location_id: 1,
                    rides: 1
                },
            ]
        );
    }

    #[test]
    fn disjoint_observation_windows_share_one_global_grid() {
        let agg = vec![
            HourlyRides {
                pickup_hour_ms_utc: BASE,
                location_id: 1,
                rides: 3,
            },
            HourlyRides {
                pickup_hour_ms_utc: BASE + 8 * HOUR_MS,
                location_id: 7,
                rides: 5,
            },
        ];

        let (complete, report) = fill_gaps(&agg).expect("fill succeeds");
        assert_eq!(report.location_count, 2);
        assert_eq!(report.grid_len, 9);
        assert_eq!(complete.len(), 18);

        let hours_for = |loc: i64| -> HashSet<i64> {
            complete
                .iter()
                .filter(|row| row.location_id == loc)
                .map(|row| row.pickup_hour_ms_utc)
                .collect()
        };
        assert_eq!(hours_for(1), hours_for(7));

        let rides_at = |loc: i64, hour: i64| -> u32 {
            complete
                .iter()
                .find(|row| row.location_id == loc && row.pickup_hour_ms_utc == hour)
                .map(|row| row.rides)
                .unwrap()
        };
        assert_eq!(rides_at(1, BASE), 3);
        assert_eq!(rides_at(1, BASE + 8 * HOUR_MS), 0);
        assert_eq!(rides_at(7, BASE), 0);
        assert_eq!(rides_at(7, BASE + 8 * HOUR_MS), 5);
    }

    #[test]
    fn fill_gaps_rejects_empty_input() {
        assert!(matches!(fill_gaps(&[]), Err(TimeSeriesError::EmptyDataset)));
    }

    #[test]
    fn fill_gaps_rejects_unaligned_hours() {
        let agg = vec![HourlyRides {
            pickup_hour_ms_utc: BASE + 1,
            location_id: 1,
            rides: 1,
        }];
        assert!(matches!(
            fill_gaps(&agg),
            Err(TimeSeriesError::UnalignedHour(_))
        ));
    }

    #[test]
    fn output_is_grouped_by_location_then_chronological() {
        let agg = vec![
            HourlyRides {
                pickup_hour_ms_utc: BASE + HOUR_MS,
                location_id: 9,
                rides: 1,
            },
            HourlyRides {
                pickup_hour_ms_utc: BASE,
                location_id: 2,
                rides: 1,
            },
        ];

        let (complete, _) = fill_gaps(&agg).expect("fill succeeds");
        let keys: Vec<(i64, i64)> = complete
            .iter()
            .map(|row| (row.location_id, row.pickup_hour_ms_utc))
            .collect();
        let mut sorted = keys.clone();
        sorted.sort_unstable();
        assert_eq!(keys, sorted);
    }
}
