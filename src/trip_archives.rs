//! Monthly raw taxi-trip archive ingestion.
//!
//! The raw source publishes one zipped CSV archive per calendar month. This
//! module plans the archive for a `YYYY_MM` partition, syncs it into a local
//! cache (download with bounded retries, atomic write), and decodes it into
//! canonical [`TripEvent`] records. Source column names are resolved from the
//! CSV header; missing required columns are a fatal schema error, never
//! guessed around.

use std::fs;
use std::io::{Cursor, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{NaiveDateTime, TimeZone, Utc};
use csv::StringRecord;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zip::ZipArchive;

use crate::timeseries::TripEvent;

const TLC_DATA_BASE_URL: &str = "https://d37ci6vzurychx.cloudfront.net/trip-data";
const PICKUP_DATETIME_COLUMN: &str = "tpep_pickup_datetime";
const PICKUP_LOCATION_COLUMN: &str = "PULocationID";
const PICKUP_DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// One calendar-month raw-data partition, parsed from a `YYYY_MM` token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct YearMonth {
    pub year: i32,
    pub month: u32,
}

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, TripLoadError> {
        if !(1..=12).contains(&month) || !(2009..=9999).contains(&year) {
            return Err(TripLoadError::InvalidToken(format!("{year}_{month:02}")));
        }
        Ok(Self { year, month })
    }

    /// Parses the CLI partition token, format `YYYY_MM` (e.g. `2024_01`).
    pub fn parse_token(raw: &str) -> Result<Self, TripLoadError> {
        let invalid = || TripLoadError::InvalidToken(raw.to_string());
        let (year_str, month_str) = raw.split_once('_').ok_or_else(invalid)?;
        if year_str.len() != 4 || month_str.len() != 2 {
            return Err(invalid());
        }
        let year: i32 = year_str.parse().map_err(|_| invalid())?;
        let month: u32 = month_str.parse().map_err(|_| invalid())?;
        Self::new(year, month).map_err(|_| invalid())
    }

    pub fn start_ts_ms_utc(self) -> i64 {
        Utc.with_ymd_and_hms(self.year, self.month, 1, 0, 0, 0)
            .single()
            .expect("validated year-month has a UTC month start")
            .timestamp_millis()
    }

    pub fn end_ts_ms_utc_exclusive(self) -> i64 {
        self.next().start_ts_ms_utc()
    }

    pub fn next(self) -> YearMonth {
        if self.month == 12 {
            YearMonth {
                year: self.year + 1,
                month: 1,
            }
        } else {
            YearMonth {
                year: self.year,
                month: self.month + 1,
            }
        }
    }
}

impl std::fmt::Display for YearMonth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TripArchiveRef {
    pub year_month: YearMonth,
    pub url: String,
    pub relative_path: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LocalArchiveSource {
    Cached,
    Downloaded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalTripArchive {
    pub archive: TripArchiveRef,
    pub local_path: PathBuf,
    pub source: LocalArchiveSource,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TripDataConfig {
    pub data_root: PathBuf,
    pub base_url: String,
    pub http_timeout_ms: u64,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
}

impl Default for TripDataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/raw"),
            base_url: TLC_DATA_BASE_URL.to_string(),
            http_timeout_ms: 15_000,
            max_retries: 2,
            retry_backoff_ms: 200,
        }
    }
}

#[derive(Debug, Error)]
pub enum TripLoadError {
    #[error("invalid year-month token '{0}': expected YYYY_MM")]
    InvalidToken(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("HTTP client build error: {0}")]
    HttpClientBuild(String),
    #[error("HTTP request failed for {url}: {message}")]
    HttpRequest { url: String, message: String },
    #[error("resource not found at {url}")]
    HttpNotFound { url: String },
    #[error("no raw-trip archive published for {year_month}")]
    MissingPartition { year_month: YearMonth },
    #[error("archive at {path} has no CSV entry")]
    MissingCsvEntry { path: PathBuf },
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
    #[error("required column '{column}' missing from source header")]
    SchemaError { column: &'static str },
    #[error("failed to parse field {field} value '{value}'")]
    ParseField { field: &'static str, value: String },
}

pub fn plan_archive(year_month: YearMonth, cfg: &TripDataConfig) -> TripArchiveRef {
    let filename = format!(
        "yellow_tripdata_{:04}-{:02}.csv.zip",
        year_month.year, year_month.month
    );
    TripArchiveRef {
        year_month,
        url: format!("{}/{filename}", cfg.base_url),
        relative_path: PathBuf::from(filename),
    }
}

pub fn sync_archive(
    year_month: YearMonth,
    cfg: &TripDataConfig,
) -> Result<LocalTripArchive, TripLoadError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    sync_archive_with_fetcher(&plan_archive(year_month, cfg), cfg, &fetcher)
}

/// Syncs and decodes one month of raw trips, clamped to the month's
/// `[start, end)` bounds.
pub fn load_monthly_trips(
    year_month: YearMonth,
    cfg: &TripDataConfig,
) -> Result<Vec<TripEvent>, TripLoadError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    load_monthly_trips_with_fetcher(year_month, cfg, &fetcher)
}

/// Loads several months of one year and concatenates them. Missing partitions
/// are skipped with a warning so that one unpublished month does not abort a
/// backfill; an empty result is the caller's signal that nothing was found.
pub fn load_raw_trips(
    year: i32,
    months: Option<&[u32]>,
    cfg: &TripDataConfig,
) -> Result<Vec<TripEvent>, TripLoadError> {
    let fetcher = ReqwestBlockingFetcher::new(cfg.http_timeout_ms)?;
    load_raw_trips_with_fetcher(year, months, cfg, &fetcher)
}

fn load_monthly_trips_with_fetcher(
    year_month: YearMonth,
    cfg: &TripDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<Vec<TripEvent>, TripLoadError> {
    let local = sync_archive_with_fetcher(&plan_archive(year_month, cfg), cfg, fetcher)?;
    load_local_archive(&local, year_month)
}

fn load_raw_trips_with_fetcher(
    year: i32,
    months: Option<&[u32]>,
    cfg: &TripDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<Vec<TripEvent>, TripLoadError> {
    let all_months: Vec<u32> = (1..=12).collect();
    let months = months.unwrap_or(&all_months);

    let mut trips = Vec::new();
    for month in months {
        let year_month = YearMonth::new(year, *month)?;
        match load_monthly_trips_with_fetcher(year_month, cfg, fetcher) {
            Ok(mut month_trips) => trips.append(&mut month_trips),
            Err(TripLoadError::MissingPartition { year_month }) => {
                warn!(
                    component = "trip_archives",
                    event = "trips.load.partition_missing",
                    year_month = %year_month
                );
            }
            Err(other) => return Err(other),
        }
    }

    Ok(trips)
}

fn sync_archive_with_fetcher(
    archive: &TripArchiveRef,
    cfg: &TripDataConfig,
    fetcher: &dyn HttpFetcher,
) -> Result<LocalTripArchive, TripLoadError> {
    let local_path = cfg.data_root.join(&archive.relative_path);
    if let Some(parent) = local_path.parent() {
        fs::create_dir_all(parent)?;
    }

    if local_path.exists() {
        info!(
            component = "trip_archives",
            event = "trips.sync.file.cached",
            year_month = %archive.year_month,
            path = %local_path.display()
        );
        return Ok(LocalTripArchive {
            archive: archive.clone(),
            local_path,
            source: LocalArchiveSource::Cached,
        });
    }

    let bytes = match fetch_bytes_with_retry(fetcher, &archive.url, cfg) {
        Ok(bytes) => bytes,
        Err(TripLoadError::HttpNotFound { .. }) => {
            return Err(TripLoadError::MissingPartition {
                year_month: archive.year_month,
            })
        }
        Err(other) => return Err(other),
    };
    write_atomic(&local_path, &bytes)?;

    info!(
        component = "trip_archives",
        event = "trips.sync.file.downloaded",
        year_month = %archive.year_month,
        path = %local_path.display(),
        bytes = bytes.len()
    );
    debug!(
        component = "trip_archives",
        event = "trips.sync.file.downloaded.debug",
        url = %archive.url
    );

    Ok(LocalTripArchive {
        archive: archive.clone(),
        local_path,
        source: LocalArchiveSource::Downloaded,
    })
}

fn load_local_archive(
    local: &LocalTripArchive,
    year_month: YearMonth,
) -> Result<Vec<TripEvent>, TripLoadError> {
    info!(
        component = "trip_archives",
        event = "trips.load.start",
        year_month = %year_month,
        path = %local.local_path.display()
    );

    let events = parse_zip_archive(
        &local.local_path,
        year_month.start_ts_ms_utc(),
        year_month.end_ts_ms_utc_exclusive(),
    )?;

    info!(
        component = "trip_archives",
        event = "trips.load.finish",
        year_month = %year_month,
        trip_count = events.len() as u64
    );

    Ok(events)
}

fn parse_zip_archive(
    path: &Path,
    start_ts_ms: i64,
    end_ts_ms_exclusive: i64,
) -> Result<Vec<TripEvent>, TripLoadError> {
    let file = fs::File::open(path)?;
    let mut zip = ZipArchive::new(file)?;

    let mut csv_buf = None;
    for idx in 0..zip.len() {
        let mut entry = zip.by_index(idx)?;
        if entry.is_dir() || !entry.name().to_ascii_lowercase().ends_with(".csv") {
            continue;
        }
        let mut buf = Vec::new();
        entry.read_to_end(&mut buf)?;
        csv_buf = Some(buf);
        break;
    }
    let csv_buf = csv_buf.ok_or_else(|| TripLoadError::MissingCsvEntry {
        path: path.to_path_buf(),
    })?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_reader(Cursor::new(csv_buf));

    let headers = reader.headers()?.clone();
    let pickup_idx = column_index(&headers, PICKUP_DATETIME_COLUMN)?;
    let location_idx = column_index(&headers, PICKUP_LOCATION_COLUMN)?;

    let mut events = Vec::new();
    for record in reader.records() {
        let record = record?;
        let event = parse_trip_record(&record, pickup_idx, location_idx)?;
        if event.pickup_ts_ms_utc >= start_ts_ms && event.pickup_ts_ms_utc < end_ts_ms_exclusive {
            events.push(event);
        }
    }

    Ok(events)
}

fn column_index(headers: &StringRecord, column: &'static str) -> Result<usize, TripLoadError> {
    headers
        .iter()
        .position(|name| name == column)
        .ok_or(TripLoadError::SchemaError { column })
}

fn parse_trip_record(
    record: &StringRecord,
    pickup_idx: usize,
    location_idx: usize,
) -> Result<TripEvent, TripLoadError> {
    let pickup_raw = record.get(pickup_idx).unwrap_or_default();
    let pickup = NaiveDateTime::parse_from_str(pickup_raw, PICKUP_DATETIME_FORMAT).map_err(
        |_| TripLoadError::ParseField {
            field: PICKUP_DATETIME_COLUMN,
            value: pickup_raw.to_string(),
        },
    )?;

    let location_raw = record.get(location_idx).unwrap_or_default();
    let location_id: i64 = location_raw
        .parse()
        .map_err(|_| TripLoadError::ParseField {
            field: PICKUP_LOCATION_COLUMN,
            value: location_raw.to_string(),
        })?;

    Ok(TripEvent {
        pickup_ts_ms_utc: pickup.and_utc().timestamp_millis(),
        location_id,
    })
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), TripLoadError> {
    let file_name = path
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("invalid output path: {}", path.display()),
            )
        })?;
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));

    {
        let mut file = fs::File::create(&tmp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }

    fs::rename(tmp_path, path)?;
    Ok(())
}

trait HttpFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError>;
}

struct ReqwestBlockingFetcher {
    client: reqwest::blocking::Client,
}

impl ReqwestBlockingFetcher {
    fn new(timeout_ms: u64) -> Result<Self, TripLoadError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_millis(timeout_ms))
            .build()
            .map_err(|err| TripLoadError::HttpClientBuild(err.to_string()))?;
        Ok(Self { client })
    }
}

impl HttpFetcher for ReqwestBlockingFetcher {
    fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError> {
        let response = self
            .client
            .get(url)
            .send()
            .map_err(|err| TripLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(TripLoadError::HttpNotFound {
                url: url.to_string(),
            });
        }
        if !status.is_success() {
            return Err(TripLoadError::HttpRequest {
                url: url.to_string(),
                message: format!("unexpected HTTP status {status}"),
            });
        }

        response
            .bytes()
            .map(|bytes| bytes.to_vec())
            .map_err(|err| TripLoadError::HttpRequest {
                url: url.to_string(),
                message: err.to_string(),
            })
    }
}

fn fetch_bytes_with_retry(
    fetcher: &dyn HttpFetcher,
    url: &str,
    cfg: &TripDataConfig,
) -> Result<Vec<u8>, TripLoadError> {
    let mut attempt: u32 = 0;
    loop {
        match fetcher.get_bytes(url) {
            Ok(bytes) => return Ok(bytes),
            // A 404 is a definitive answer; retrying cannot change it.
            Err(err @ TripLoadError::HttpNotFound { .. }) => return Err(err),
            Err(err) if attempt >= cfg.max_retries => return Err(err),
            Err(_) => {
                attempt = attempt.saturating_add(1);
                let shift = attempt.saturating_sub(1).min(10);
                let factor = 1u64 << shift;
                let sleep_ms = cfg.retry_backoff_ms.saturating_mul(factor);
                std::thread::sleep(std::time::Duration::from_millis(sleep_ms));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;
    use zip::write::SimpleFileOptions;

    #[derive(Default)]
    struct MockFetcher {
        responses: HashMap<String, Vec<u8>>,
    }

    impl MockFetcher {
        fn with(mut self, url: &str, body: &[u8]) -> Self {
            self.responses.insert(url.to_string(), body.to_vec());
            self
        }
    }

    impl HttpFetcher for MockFetcher {
        fn get_bytes(&self, url: &str) -> Result<Vec<u8>, TripLoadError> {
            self.responses
                .get(url)
                .cloned()
                .ok_or_else(|| TripLoadError::HttpNotFound {
                    url: url.to_string(),
                })
        }
    }

    fn sample_csv() -> &'static str {
        "VendorID,tpep_pickup_datetime,tpep_dropoff_datetime,PULocationID,DOLocationID\n\
         1,2024-01-01 00:05:00,2024-01-01 00:20:00,43,100\n\
         2,2024-01-01 00:40:30,2024-01-01 01:00:00,43,151\n\
         1,2024-01-15 12:00:00,2024-01-15 12:30:00,7,7\n\
         2,2023-12-31 23:59:59,2024-01-01 00:10:00,43,43\n"
    }

    fn zip_bytes(csv_body: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        {
            let mut zip = zip::ZipWriter::new(Cursor::new(&mut buf));
            zip.start_file("data.csv", SimpleFileOptions::default())
                .unwrap();
            zip.write_all(csv_body.as_bytes()).unwrap();
            zip.finish().unwrap();
        }
        buf
    }

    fn test_cfg(data_root: &Path) -> TripDataConfig {
        TripDataConfig {
            data_root: data_root.to_path_buf(),
            ..TripDataConfig::default()
        }
    }

    #[test]
    fn token_parsing_accepts_yyyy_mm_only() {
        let ym = YearMonth::parse_token("2024_01").unwrap();
        assert_eq!(ym, YearMonth::new(2024, 1).unwrap());

        for bad in ["2024-01", "2024_13", "24_01", "2024_1", "garbage", ""] {
            assert!(
                matches!(
                    YearMonth::parse_token(bad),
                    Err(TripLoadError::InvalidToken(_))
                ),
                "token '{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn month_bounds_are_half_open_and_wrap_december() {
        let jan = YearMonth::new(2024, 1).unwrap();
        assert_eq!(jan.start_ts_ms_utc(), 1_704_067_200_000);
        assert_eq!(jan.end_ts_ms_utc_exclusive(), 1_706_745_600_000);

        let dec = YearMonth::new(2024, 12).unwrap();
        assert_eq!(dec.next(), YearMonth::new(2025, 1).unwrap());
    }

    #[test]
    fn plan_archive_builds_deterministic_url_and_path() {
        let cfg = TripDataConfig::default();
        let archive = plan_archive(YearMonth::new(2024, 3).unwrap(), &cfg);
        assert!(archive
            .url
            .ends_with("/trip-data/yellow_tripdata_2024-03.csv.zip"));
        assert_eq!(
            archive.relative_path,
            PathBuf::from("yellow_tripdata_2024-03.csv.zip")
        );
    }

    #[test]
    fn sync_downloads_then_uses_cache() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        let archive = plan_archive(YearMonth::new(2024, 1).unwrap(), &cfg);
        let fetcher = MockFetcher::default().with(&archive.url, &zip_bytes(sample_csv()));

        let first = sync_archive_with_fetcher(&archive, &cfg, &fetcher).unwrap();
        assert_eq!(first.source, LocalArchiveSource::Downloaded);

        // Second sync must not touch the network at all.
        let offline = MockFetcher::default();
        let second = sync_archive_with_fetcher(&archive, &cfg, &offline).unwrap();
        assert_eq!(second.source, LocalArchiveSource::Cached);
    }

    #[test]
    fn missing_remote_partition_is_a_distinct_error() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        let year_month = YearMonth::new(2024, 2).unwrap();
        let archive = plan_archive(year_month, &cfg);
        let fetcher = MockFetcher::default();

        let err = sync_archive_with_fetcher(&archive, &cfg, &fetcher).unwrap_err();
        assert!(matches!(
            err,
            TripLoadError::MissingPartition { year_month: ym } if ym == year_month
        ));
    }

    #[test]
    fn multi_month_load_skips_unpublished_months() {
        let temp = tempdir().unwrap();
        let cfg = test_cfg(temp.path());
        let january = plan_archive(YearMonth::new(2024, 1).unwrap(), &cfg);
        // Only January is published; February 404s.
        let fetcher = MockFetcher::default().with(&january.url, &zip_bytes(sample_csv()));

        let trips = load_raw_trips_with_fetcher(2024, Some(&[1, 2]), &cfg, &fetcher).unwrap();
        assert_eq!(trips.len(), 3);
    }

    #[test]
    fn parse_resolves_columns_by_header_and_clamps_to_month() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.zip");
        fs::write(&path, zip_bytes(sample_csv())).unwrap();

        let ym = YearMonth::new(2024, 1).unwrap();
        let events =
            parse_zip_archive(&path, ym.start_ts_ms_utc(), ym.end_ts_ms_utc_exclusive()).unwrap();

        // The 2023-12-31 straggler row is clamped out.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].location_id, 43);
        assert_eq!(events[0].pickup_ts_ms_utc, 1_704_067_500_000); // 00:05:00
        assert_eq!(events[2].location_id, 7);
    }

    #[test]
    fn missing_required_column_is_a_schema_error() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.zip");
        let csv_body = "VendorID,tpep_pickup_datetime\n1,2024-01-01 00:05:00\n";
        fs::write(&path, zip_bytes(csv_body)).unwrap();

        let ym = YearMonth::new(2024, 1).unwrap();
        let err = parse_zip_archive(&path, ym.start_ts_ms_utc(), ym.end_ts_ms_utc_exclusive())
            .unwrap_err();
        assert!(matches!(
            err,
            TripLoadError::SchemaError {
                column: PICKUP_LOCATION_COLUMN
            }
        ));
    }

    #[test]
    fn unparseable_fields_are_fatal_not_dropped() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("archive.zip");
        let csv_body = "tpep_pickup_datetime,PULocationID\nnot-a-date,43\n";
        fs::write(&path, zip_bytes(csv_body)).unwrap();

        let ym = YearMonth::new(2024, 1).unwrap();
        let err = parse_zip_archive(&path, ym.start_ts_ms_utc(), ym.end_ts_ms_utc_exclusive())
            .unwrap_err();
        assert!(matches!(err, TripLoadError::ParseField { .. }));
    }
}
