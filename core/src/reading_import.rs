use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;

use anyhow::{Context, Result};
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::Serialize;

use crate::aggregate;
use crate::error::SyncError;
use crate::models::{DailyHealthRecord, validate_glucose, validate_ketones};
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;
use crate::sync;

/// Timestamp layout used by meter exports, e.g. `2025-05-21T07:37:00.000-04:00`.
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.f%:z";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadingKind {
    Glucose,
    Ketone,
}

/// A single blood reading parsed from a meter export.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ImportedReading {
    pub timestamp: DateTime<FixedOffset>,
    pub kind: ReadingKind,
    pub value: f64,
}

impl ImportedReading {
    #[must_use]
    pub fn day(&self) -> NaiveDate {
        self.timestamp.date_naive()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ParsedReadings {
    pub readings: Vec<ImportedReading>,
    /// Rows that were not blood glucose/ketone readings or could not be read:
    /// version and header lines, comments, other sample types, bad values.
    pub rows_skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReadingFailure {
    pub timestamp: DateTime<FixedOffset>,
    pub error: String,
}

/// Summary of what a reading import would do / did.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReadingImportSummary {
    pub dry_run: bool,
    /// Filled in by callers that parsed the file themselves.
    pub rows_skipped: usize,
    pub glucose_readings: usize,
    pub glucose_written: usize,
    pub ketone_readings: usize,
    /// Days whose local record received a ketone value.
    pub ketone_days_updated: usize,
    pub records_created: usize,
    pub days_spanned: usize,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<ReadingFailure>,
}

fn parse_timestamp(value: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_str(value, TIMESTAMP_FORMAT)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .ok()
}

fn parse_row(record: &csv::StringRecord) -> Option<ImportedReading> {
    if record.len() < 4 {
        return None;
    }
    let field = |i: usize| record.get(i).map(|v| v.trim().trim_matches('"').trim());

    let kind = match field(1)?.to_lowercase().as_str() {
        "glucose" => ReadingKind::Glucose,
        "ketone" => ReadingKind::Ketone,
        _ => return None,
    };
    if !field(2)?.eq_ignore_ascii_case("blood") {
        return None;
    }
    let value: f64 = field(3)?.parse().ok()?;
    let valid = match kind {
        ReadingKind::Glucose => validate_glucose(value),
        ReadingKind::Ketone => validate_ketones(value),
    };
    if valid.is_err() {
        return None;
    }
    let timestamp = parse_timestamp(field(0)?)?;

    Some(ImportedReading {
        timestamp,
        kind,
        value,
    })
}

/// Parse a semicolon-delimited meter export from any reader.
///
/// Expected columns: `reading_timestamp;reading_type;reading_sample_type;reading_value`.
/// Only blood glucose and blood ketone rows are kept; every other row is
/// skipped and counted, never fatal.
pub fn parse_readings_csv<R: Read>(reader: R) -> Result<ParsedReadings> {
    let mut rdr = csv::ReaderBuilder::new()
        .delimiter(b';')
        .has_headers(false)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let mut parsed = ParsedReadings::default();
    for (line_num, result) in rdr.records().enumerate() {
        let record = match result {
            Ok(record) => record,
            Err(e) if e.is_io_error() => {
                return Err(e).context("Failed to read readings file");
            }
            Err(e) => {
                tracing::debug!(row = line_num + 1, error = %e, "skipping unreadable row");
                parsed.rows_skipped += 1;
                continue;
            }
        };

        if record.iter().all(str::is_empty) {
            continue;
        }
        if record.get(0).is_some_and(|f| f.starts_with('#')) {
            parsed.rows_skipped += 1;
            continue;
        }
        match parse_row(&record) {
            Some(reading) => parsed.readings.push(reading),
            None => {
                tracing::debug!(row = line_num + 1, "skipping row that is not a blood reading");
                parsed.rows_skipped += 1;
            }
        }
    }

    Ok(parsed)
}

/// Apply parsed readings.
///
/// Glucose readings are written to the provider (replacing that day's
/// samples) and verified by reading them back; a mismatch is recorded in the
/// summary and the import carries on. Ketone readings go onto the local
/// record of their day as a sync write, the latest reading of a day winning.
/// With `dry_run` nothing is written.
pub async fn import_readings(
    store: &dyn DailyRecordStore,
    provider: &dyn ExternalMetricsProvider,
    readings: &[ImportedReading],
    dry_run: bool,
) -> Result<ReadingImportSummary, SyncError> {
    let mut sorted = readings.to_vec();
    sorted.sort_by_key(|r| r.timestamp);

    let glucose: Vec<&ImportedReading> = sorted
        .iter()
        .filter(|r| r.kind == ReadingKind::Glucose)
        .collect();
    let mut ketones_by_day: BTreeMap<NaiveDate, f64> = BTreeMap::new();
    for reading in sorted.iter().filter(|r| r.kind == ReadingKind::Ketone) {
        ketones_by_day.insert(reading.day(), reading.value);
    }
    let days: BTreeSet<NaiveDate> = sorted.iter().map(ImportedReading::day).collect();

    let mut summary = ReadingImportSummary {
        dry_run,
        glucose_readings: glucose.len(),
        ketone_readings: sorted.len() - glucose.len(),
        days_spanned: days.len(),
        ..ReadingImportSummary::default()
    };

    if dry_run {
        for day in ketones_by_day.keys() {
            let exists = store
                .fetch_by_day(*day)
                .map_err(|e| SyncError::persistence(*day, e))?
                .is_some();
            if !exists {
                summary.records_created += 1;
            }
        }
        summary.ketone_days_updated = ketones_by_day.len();
        return Ok(summary);
    }

    if !glucose.is_empty() && !provider.authorize().await {
        return Err(SyncError::Authorization);
    }
    for reading in glucose {
        match sync::import_glucose_sample(provider, reading.value, reading.timestamp).await {
            Ok(()) => summary.glucose_written += 1,
            Err(SyncError::Authorization) => return Err(SyncError::Authorization),
            Err(e) => {
                tracing::warn!(at = %reading.timestamp, error = %e, "glucose import failed");
                summary.failures.push(ReadingFailure {
                    timestamp: reading.timestamp,
                    error: e.to_string(),
                });
            }
        }
    }

    for (day, value) in ketones_by_day {
        let existing = store
            .fetch_by_day(day)
            .map_err(|e| SyncError::persistence(day, e))?;
        let created = existing.is_none();
        let mut record = existing.unwrap_or_else(|| DailyHealthRecord::new(day));
        record.apply_imported_ketones(value);
        let total = aggregate::week_total_with(store, &record)
            .map_err(|e| SyncError::persistence(day, e))?;
        record.set_week_total_steps_cache(Some(total));

        let written = if created {
            store.insert(&record)
        } else {
            store.save(&mut record)
        };
        written.map_err(|e| SyncError::persistence(day, e))?;
        if created {
            summary.records_created += 1;
        }
        summary.ketone_days_updated += 1;
    }

    tracing::info!(
        glucose = summary.glucose_written,
        ketone_days = summary.ketone_days_updated,
        failures = summary.failures.len(),
        "reading import finished"
    );
    Ok(summary)
}
