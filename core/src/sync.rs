use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::Serialize;

use crate::aggregate;
use crate::error::{ProviderError, SyncError};
use crate::models::{DailyHealthRecord, ExternalDayBundle, TrackedField, TrackedMetrics};
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;

/// Largest difference between a written and read-back glucose value that
/// still counts as a match.
pub const GLUCOSE_TOLERANCE: f64 = 0.01;

/// What a merge did to each synced field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeOutcome {
    /// Fields now holding a provider value.
    pub updated: Vec<TrackedField>,
    /// Fields that held a value and were cleared because the provider had none.
    pub cleared: Vec<TrackedField>,
    /// Fields left alone because they already had a value and overwrite was off.
    pub kept: Vec<TrackedField>,
}

impl MergeOutcome {
    #[must_use]
    pub fn changed(&self) -> bool {
        !self.updated.is_empty() || !self.cleared.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncDayReport {
    pub record: DailyHealthRecord,
    pub created: bool,
    pub outcome: MergeOutcome,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<TrackedField>,
}

fn settle<T>(
    field: TrackedField,
    day: NaiveDate,
    result: Result<T, ProviderError>,
    failed: &mut Vec<TrackedField>,
) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            let err = SyncError::fetch(field, &e);
            tracing::warn!(%day, error = %err, "field fetch failed, treating as absent");
            failed.push(field);
            None
        }
    }
}

/// Fetch every synced field for `day` concurrently.
///
/// Never fails: a field whose fetch fails is absent and listed in
/// `bundle.failed`. A step count of 0 is treated as absent.
pub async fn fetch_external_bundle(
    provider: &dyn ExternalMetricsProvider,
    day: NaiveDate,
) -> ExternalDayBundle {
    let (steps, glucose, sleep, heart_rate, weight) = tokio::join!(
        provider.steps_for_day(day),
        provider.glucose_for_day(day),
        provider.sleep_for_day(day),
        provider.heart_rate_for_day(day),
        provider.weight_for_day(day),
    );

    let mut failed = Vec::new();
    let steps = settle(TrackedField::Steps, day, steps, &mut failed).filter(|s| *s > 0);
    let glucose = settle(TrackedField::Glucose, day, glucose, &mut failed).flatten();
    let sleep = settle(TrackedField::Sleep, day, sleep, &mut failed).flatten();
    let heart_rate = settle(TrackedField::HeartRate, day, heart_rate, &mut failed).flatten();
    let weight = settle(TrackedField::Weight, day, weight, &mut failed).flatten();

    ExternalDayBundle {
        day,
        steps,
        glucose,
        sleep,
        heart_rate,
        weight,
        failed,
    }
}

/// Fetch only the step count for `day`, with the same absent-on-zero rule
/// as [`fetch_external_bundle`].
pub async fn fetch_steps_bundle(
    provider: &dyn ExternalMetricsProvider,
    day: NaiveDate,
) -> ExternalDayBundle {
    let mut bundle = ExternalDayBundle::empty(day);
    let steps = provider.steps_for_day(day).await;
    bundle.steps = settle(TrackedField::Steps, day, steps, &mut bundle.failed).filter(|s| *s > 0);
    bundle
}

fn assign(metrics: &mut TrackedMetrics, bundle: &ExternalDayBundle, field: TrackedField) {
    match field {
        TrackedField::Steps => metrics.steps = bundle.steps,
        TrackedField::Glucose => metrics.glucose = bundle.glucose,
        TrackedField::Sleep => metrics.sleep = bundle.sleep,
        TrackedField::HeartRate => metrics.heart_rate = bundle.heart_rate,
        TrackedField::Weight => metrics.weight = bundle.weight,
        TrackedField::Ketones | TrackedField::BloodPressure => {}
    }
}

/// Merge the given fields of `bundle` into `record`.
///
/// A field is written (value and provenance together) when `overwrite` is
/// set or the record has no value for it; otherwise it is left untouched.
/// Fields the provider has no source for are ignored.
pub fn merge_fields(
    record: &mut DailyHealthRecord,
    bundle: &ExternalDayBundle,
    fields: &[TrackedField],
    overwrite: bool,
) -> MergeOutcome {
    let mut outcome = MergeOutcome::default();
    for &field in fields {
        if !TrackedField::SYNCED.contains(&field) {
            continue;
        }
        let had_value = record.metrics.is_present(field);
        if had_value && !overwrite {
            outcome.kept.push(field);
            continue;
        }

        assign(&mut record.metrics, bundle, field);
        let present = bundle.is_present(field);
        record.provenance.set(field, present);
        if present {
            outcome.updated.push(field);
        } else if had_value {
            outcome.cleared.push(field);
        }
    }
    outcome
}

/// Merge every synced field of `bundle` into `record`. In-memory only.
pub fn merge(
    record: &mut DailyHealthRecord,
    bundle: &ExternalDayBundle,
    overwrite: bool,
) -> MergeOutcome {
    merge_fields(record, bundle, &TrackedField::SYNCED, overwrite)
}

/// Fetch, merge and persist one day, creating its record if needed.
pub async fn sync_day(
    store: &dyn DailyRecordStore,
    provider: &dyn ExternalMetricsProvider,
    day: NaiveDate,
    overwrite: bool,
) -> Result<SyncDayReport, SyncError> {
    if !provider.authorize().await {
        return Err(SyncError::Authorization);
    }

    let bundle = fetch_external_bundle(provider, day).await;
    let existing = store
        .fetch_by_day(day)
        .map_err(|e| SyncError::persistence(day, e))?;
    let created = existing.is_none();
    let mut record = existing.unwrap_or_else(|| DailyHealthRecord::new(day));

    let outcome = merge(&mut record, &bundle, overwrite);
    let total =
        aggregate::week_total_with(store, &record).map_err(|e| SyncError::persistence(day, e))?;
    record.set_week_total_steps_cache(Some(total));

    let written = if created {
        store.insert(&record)
    } else {
        store.save(&mut record)
    };
    written.map_err(|e| {
        tracing::error!(%day, error = ?e, "failed to persist synced record");
        SyncError::persistence(day, e)
    })?;

    tracing::info!(
        %day,
        created,
        updated = outcome.updated.len(),
        cleared = outcome.cleared.len(),
        kept = outcome.kept.len(),
        "synced day"
    );
    Ok(SyncDayReport {
        record,
        created,
        outcome,
        failed: bundle.failed,
    })
}

/// Replace the provider's glucose for the sample's day with `value`, then
/// read it back.
///
/// Existing samples of that day are deleted first, so only the most recent
/// write of a day survives.
pub async fn import_glucose_sample(
    provider: &dyn ExternalMetricsProvider,
    value: f64,
    at: DateTime<FixedOffset>,
) -> Result<(), SyncError> {
    let day = at.date_naive();
    let to_sync_error = |e: ProviderError| match e {
        ProviderError::Unauthorized => SyncError::Authorization,
        other => SyncError::fetch(TrackedField::Glucose, &other),
    };

    provider
        .delete_glucose_samples(day)
        .await
        .map_err(to_sync_error)?;
    provider
        .write_glucose_sample(value, at)
        .await
        .map_err(to_sync_error)?;

    let actual = provider.glucose_for_day(day).await.map_err(to_sync_error)?;
    match actual {
        Some(read) if (read - value).abs() <= GLUCOSE_TOLERANCE => {
            tracing::debug!(%day, value, "glucose write verified");
            Ok(())
        }
        actual => Err(SyncError::Verification {
            day,
            expected: value,
            actual,
        }),
    }
}
