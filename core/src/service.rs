use std::collections::HashMap;
use std::io::Read;
use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result, bail};
use chrono::NaiveDate;

use crate::aggregate;
use crate::backfill::{self, BackfillProgress, BackfillReport};
use crate::db::Database;
use crate::error::SyncError;
use crate::form::{FormOptions, RecordForm};
use crate::models::{DailyHealthRecord, WeightProgress, validate_weight};
use crate::provider::ExternalMetricsProvider;
use crate::reading_import::{self, ReadingImportSummary};
use crate::store::DailyRecordStore;
use crate::sync::{self, SyncDayReport};

const WEIGHT_TARGET_KEY: &str = "weight_target";
const INITIAL_WEIGHT_KEY: &str = "initial_weight";

/// Entry point for front ends: one database plus one metrics provider.
pub struct DaybookService {
    db: Arc<Mutex<Database>>,
    provider: Arc<dyn ExternalMetricsProvider>,
}

impl DaybookService {
    pub fn new(db_path: &Path, provider: Arc<dyn ExternalMetricsProvider>) -> Result<Self> {
        let db = Database::open(db_path)?;
        Ok(Self::from_parts(Arc::new(Mutex::new(db)), provider))
    }

    pub fn new_in_memory(provider: Arc<dyn ExternalMetricsProvider>) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Ok(Self::from_parts(Arc::new(Mutex::new(db)), provider))
    }

    #[must_use]
    pub fn from_parts(db: Arc<Mutex<Database>>, provider: Arc<dyn ExternalMetricsProvider>) -> Self {
        Self { db, provider }
    }

    fn store(&self) -> &dyn DailyRecordStore {
        self.db.as_ref()
    }

    fn lock(&self) -> MutexGuard<'_, Database> {
        self.db.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // --- Records ---

    pub fn record_for_day(&self, day: NaiveDate) -> Result<Option<DailyHealthRecord>> {
        self.store().fetch_by_day(day)
    }

    /// Newest first. `None` lists everything.
    pub fn list_records(&self, limit: Option<usize>) -> Result<Vec<DailyHealthRecord>> {
        self.lock().list_records(limit)
    }

    pub fn delete_record(&self, day: NaiveDate) -> Result<bool> {
        let Some(record) = self.store().fetch_by_day(day)? else {
            return Ok(false);
        };
        self.store().delete(&record.id)
    }

    pub async fn open_form(
        &self,
        day: NaiveDate,
        today: NaiveDate,
        options: FormOptions,
    ) -> Result<RecordForm> {
        let existing = self.store().fetch_by_day(day)?;
        let store: Arc<dyn DailyRecordStore> = self.db.clone();
        Ok(RecordForm::load(store, Arc::clone(&self.provider), existing, day, today, options).await)
    }

    // --- Provider reconciliation ---

    pub async fn sync_day(&self, day: NaiveDate, overwrite: bool) -> Result<SyncDayReport, SyncError> {
        sync::sync_day(self.store(), self.provider.as_ref(), day, overwrite).await
    }

    pub async fn backfill(
        &self,
        today: NaiveDate,
        cancel: &AtomicBool,
        on_progress: impl FnMut(&BackfillProgress) + Send,
    ) -> Result<BackfillReport, SyncError> {
        backfill::run(self.store(), self.provider.as_ref(), today, cancel, on_progress).await
    }

    pub async fn import_readings_csv<R: Read>(
        &self,
        reader: R,
        dry_run: bool,
    ) -> Result<ReadingImportSummary> {
        let parsed = reading_import::parse_readings_csv(reader)?;
        let mut summary = reading_import::import_readings(
            self.store(),
            self.provider.as_ref(),
            &parsed.readings,
            dry_run,
        )
        .await?;
        summary.rows_skipped = parsed.rows_skipped;
        Ok(summary)
    }

    // --- Weekly step totals ---

    pub fn cached_week_total(&self, day: NaiveDate) -> Result<i64> {
        aggregate::cached_week_total(self.store(), day)
    }

    pub async fn live_week_total(
        &self,
        day: NaiveDate,
        on_progress: impl FnMut(NaiveDate, i64) + Send,
    ) -> i64 {
        aggregate::live_week_total(self.provider.as_ref(), day, on_progress).await
    }

    /// Rewrite every stored week total that no longer matches the records.
    /// Returns the number of records updated.
    pub fn recompute_week_totals(&self) -> Result<usize> {
        let db = self.lock();
        let records = db.list_records(None)?;
        let steps_by_day: HashMap<NaiveDate, i64> = records
            .iter()
            .filter_map(|r| r.metrics().steps.map(|s| (r.day, s)))
            .collect();

        let mut updated = 0;
        for record in &records {
            let total: i64 = aggregate::week_start(record.day)
                .iter_days()
                .take_while(|d| *d <= record.day)
                .filter_map(|d| steps_by_day.get(&d))
                .sum();
            if record.week_total_steps_cache() != Some(total) {
                db.set_week_total_cache(&record.id, Some(total))
                    .with_context(|| format!("Failed to update week total for {}", record.day))?;
                updated += 1;
            }
        }
        tracing::info!(checked = records.len(), updated, "recomputed week totals");
        Ok(updated)
    }

    // --- Weight goal ---

    pub fn set_weight_target(&self, lbs: f64) -> Result<()> {
        validate_weight(lbs)?;
        self.lock().set_setting(WEIGHT_TARGET_KEY, &lbs.to_string())
    }

    pub fn set_initial_weight(&self, lbs: f64) -> Result<()> {
        validate_weight(lbs)?;
        self.lock().set_setting(INITIAL_WEIGHT_KEY, &lbs.to_string())
    }

    pub fn clear_weight_target(&self) -> Result<bool> {
        self.lock().delete_setting(WEIGHT_TARGET_KEY)
    }

    /// Progress from the starting weight towards the target. The starting
    /// weight defaults to the earliest recorded weight and is then kept.
    pub fn weight_progress(&self) -> Result<WeightProgress> {
        let db = self.lock();
        let parse = |key: &str, value: Option<String>| -> Result<Option<f64>> {
            value
                .map(|v| {
                    v.parse::<f64>()
                        .with_context(|| format!("Invalid stored {key} '{v}'"))
                })
                .transpose()
        };

        let target = parse(WEIGHT_TARGET_KEY, db.get_setting(WEIGHT_TARGET_KEY)?)?;
        let mut initial = parse(INITIAL_WEIGHT_KEY, db.get_setting(INITIAL_WEIGHT_KEY)?)?;
        if initial.is_none() {
            if let Some((_, first)) = db.boundary_weight(false)? {
                db.set_setting(INITIAL_WEIGHT_KEY, &first.to_string())?;
                initial = Some(first);
            }
        }
        let latest = db.boundary_weight(true)?;
        Ok(WeightProgress::compute(initial, target, latest))
    }

    pub fn require_record(&self, day: NaiveDate) -> Result<DailyHealthRecord> {
        match self.record_for_day(day)? {
            Some(record) => Ok(record),
            None => bail!("No record for {day}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{TrackedEdit, TrackedField};
    use crate::test_support::{DayData, FakeProvider, day};

    fn service(provider: FakeProvider) -> DaybookService {
        DaybookService::new_in_memory(Arc::new(provider)).unwrap()
    }

    fn insert_with(svc: &DaybookService, d: u32, edit: TrackedEdit) {
        let mut record = DailyHealthRecord::new(day(d));
        record.apply_edit(edit);
        svc.store().insert(&record).unwrap();
    }

    #[test]
    fn test_delete_record_by_day() {
        let svc = service(FakeProvider::new());
        insert_with(&svc, 3, TrackedEdit::Steps(Some(10)));
        assert!(svc.delete_record(day(3)).unwrap());
        assert!(!svc.delete_record(day(3)).unwrap());
        assert!(svc.require_record(day(3)).is_err());
    }

    #[test]
    fn test_recompute_week_totals() {
        let svc = service(FakeProvider::new());
        for d in 1..=8 {
            insert_with(&svc, d, TrackedEdit::Steps(Some(1000)));
        }

        assert_eq!(svc.recompute_week_totals().unwrap(), 8);
        let totals: Vec<Option<i64>> = svc
            .list_records(None)
            .unwrap()
            .iter()
            .rev()
            .map(DailyHealthRecord::week_total_steps_cache)
            .collect();
        assert_eq!(totals[0], Some(1000));
        assert_eq!(totals[6], Some(7000));
        assert_eq!(totals[7], Some(7000));

        // Nothing stale the second time
        assert_eq!(svc.recompute_week_totals().unwrap(), 0);
        assert_eq!(svc.cached_week_total(day(8)).unwrap(), 7000);
    }

    #[tokio::test]
    async fn test_sync_then_edit_through_form() {
        let svc = service(FakeProvider::new().with_day(
            day(14),
            DayData {
                steps: 6400,
                glucose: Some(93.0),
                ..DayData::default()
            },
        ));
        svc.sync_day(day(14), false).await.unwrap();

        let mut form = svc
            .open_form(day(14), day(20), FormOptions::default())
            .await
            .unwrap();
        assert!(!form.is_new());
        assert!(form.record().is_synced(TrackedField::Glucose));
        form.edit(TrackedEdit::Glucose(Some(97.0))).unwrap();
        form.save().unwrap();

        let stored = svc.require_record(day(14)).unwrap();
        assert_eq!(stored.metrics().glucose, Some(97.0));
        assert!(!stored.is_synced(TrackedField::Glucose));
        assert!(stored.is_synced(TrackedField::Steps));
    }

    #[tokio::test]
    async fn test_backfill_through_service() {
        let svc = service(FakeProvider::new().with_steps(day(2), 800));
        insert_with(&svc, 1, TrackedEdit::Steps(Some(100)));

        let cancel = AtomicBool::new(false);
        let report = svc.backfill(day(3), &cancel, |_| {}).await.unwrap();
        assert_eq!(report.created, vec![day(2), day(3)]);
        assert_eq!(svc.list_records(None).unwrap().len(), 3);
        assert_eq!(svc.live_week_total(day(3), |_, _| {}).await, 800);
    }

    #[tokio::test]
    async fn test_import_readings_csv_reports_skipped_rows() {
        let svc = service(FakeProvider::new());
        let csv = "version;1\n\
                   reading_timestamp;reading_type;reading_sample_type;reading_value\n\
                   2025-06-21T07:37:00.000-04:00;glucose;blood;96\n";
        let summary = svc.import_readings_csv(csv.as_bytes(), false).await.unwrap();
        assert_eq!(summary.rows_skipped, 2);
        assert_eq!(summary.glucose_written, 1);
    }

    #[test]
    fn test_weight_progress_defaults_initial_weight() {
        let svc = service(FakeProvider::new());
        insert_with(&svc, 1, TrackedEdit::Weight(Some(200.0)));
        insert_with(&svc, 9, TrackedEdit::Weight(Some(192.5)));
        svc.set_weight_target(180.0).unwrap();

        let progress = svc.weight_progress().unwrap();
        assert_eq!(progress.initial, Some(200.0));
        assert_eq!(progress.target, Some(180.0));
        assert_eq!(progress.latest, Some(192.5));
        assert!((progress.change_since_initial.unwrap() + 7.5).abs() < f64::EPSILON);
        assert!((progress.remaining_to_target.unwrap() - 12.5).abs() < f64::EPSILON);

        // The starting weight is persisted and no longer follows the records
        svc.delete_record(day(1)).unwrap();
        assert_eq!(svc.weight_progress().unwrap().initial, Some(200.0));
    }

    #[test]
    fn test_weight_target_validation() {
        let svc = service(FakeProvider::new());
        assert!(svc.set_weight_target(0.0).is_err());
        assert!(svc.set_weight_target(170.0).is_ok());
        assert!(svc.clear_weight_target().unwrap());
        assert!(svc.weight_progress().unwrap().target.is_none());
    }
}
