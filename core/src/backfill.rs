use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::NaiveDate;
use serde::Serialize;

use crate::aggregate;
use crate::error::SyncError;
use crate::models::{DailyHealthRecord, TrackedField};
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;
use crate::sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillProgress {
    pub day: NaiveDate,
    pub completed: usize,
    pub total: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BackfillReport {
    /// Days that received a new record, in creation order.
    pub created: Vec<NaiveDate>,
    /// Days in the range that already had a record.
    pub skipped: usize,
    /// Created days where some field fetches failed.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub degraded: Vec<(NaiveDate, Vec<TrackedField>)>,
    pub cancelled: bool,
}

/// Create a record for every missing day between the earliest stored day and
/// `today`, filled from the provider. Existing records are never touched.
///
/// With an empty store only `today` is created. Days are processed one at a
/// time in ascending order; `cancel` is checked before each day, so a
/// cancelled run never leaves a partial day behind. A failed insert stops the
/// run, keeping the days already written.
pub async fn run(
    store: &dyn DailyRecordStore,
    provider: &dyn ExternalMetricsProvider,
    today: NaiveDate,
    cancel: &AtomicBool,
    mut on_progress: impl FnMut(&BackfillProgress) + Send,
) -> Result<BackfillReport, SyncError> {
    if !provider.authorize().await {
        return Err(SyncError::Authorization);
    }

    let earliest = store
        .earliest_day()
        .map_err(|e| SyncError::persistence(today, e))?;

    let (missing, skipped) = match earliest {
        None => (vec![today], 0),
        Some(earliest) => {
            let present: HashSet<NaiveDate> = store
                .fetch_range(earliest, today)
                .map_err(|e| SyncError::persistence(earliest, e))?
                .into_iter()
                .map(|r| r.day)
                .collect();
            let missing: Vec<NaiveDate> = earliest
                .iter_days()
                .take_while(|d| *d <= today)
                .filter(|d| !present.contains(d))
                .collect();
            (missing, present.len())
        }
    };

    let total = missing.len();
    tracing::info!(total, skipped, %today, "starting backfill");

    let mut report = BackfillReport {
        skipped,
        ..BackfillReport::default()
    };
    for (index, day) in missing.into_iter().enumerate() {
        if cancel.load(Ordering::SeqCst) {
            tracing::info!(%day, created = report.created.len(), "backfill cancelled");
            report.cancelled = true;
            break;
        }

        let bundle = sync::fetch_external_bundle(provider, day).await;
        let mut record = DailyHealthRecord::new(day);
        sync::merge(&mut record, &bundle, true);
        let week_total =
            aggregate::week_total_with(store, &record).map_err(|e| SyncError::persistence(day, e))?;
        record.set_week_total_steps_cache(Some(week_total));

        if let Err(e) = store.insert(&record) {
            tracing::error!(%day, error = ?e, "backfill insert failed, stopping");
            return Err(SyncError::persistence(day, e));
        }
        tracing::debug!(%day, populated = bundle.populated().len(), "backfilled day");

        if !bundle.failed.is_empty() {
            report.degraded.push((day, bundle.failed));
        }
        report.created.push(day);
        on_progress(&BackfillProgress {
            day,
            completed: index + 1,
            total,
        });
    }

    tracing::info!(created = report.created.len(), "backfill finished");
    Ok(report)
}
