use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

use anyhow::{Result, bail};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};

use crate::db::Database;
use crate::error::ProviderError;
use crate::models::{DailyHealthRecord, HeartRateStats, SleepDuration, TrackedField};
use crate::provider::ExternalMetricsProvider;
use crate::store::DailyRecordStore;

pub(crate) fn day(d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2025, 6, d).unwrap()
}

#[derive(Debug, Clone, Default)]
pub(crate) struct DayData {
    pub steps: i64,
    pub glucose: Option<f64>,
    pub sleep: Option<SleepDuration>,
    pub heart_rate: Option<HeartRateStats>,
    pub weight: Option<f64>,
}

/// Scriptable provider: per-day data, per-field failures, denied access and
/// skewed glucose writes.
#[derive(Default)]
pub(crate) struct FakeProvider {
    days: Mutex<HashMap<NaiveDate, DayData>>,
    failing: HashSet<TrackedField>,
    failing_days: HashSet<NaiveDate>,
    denied: bool,
    glucose_skew: f64,
    pub step_calls: AtomicUsize,
}

impl FakeProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_day(self, day: NaiveDate, data: DayData) -> Self {
        self.days
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(day, data);
        self
    }

    pub fn with_steps(self, day: NaiveDate, steps: i64) -> Self {
        self.with_day(
            day,
            DayData {
                steps,
                ..DayData::default()
            },
        )
    }

    pub fn failing(mut self, field: TrackedField) -> Self {
        self.failing.insert(field);
        self
    }

    /// Every query for `day` fails.
    pub fn failing_day(mut self, day: NaiveDate) -> Self {
        self.failing_days.insert(day);
        self
    }

    pub fn denied(mut self) -> Self {
        self.denied = true;
        self
    }

    pub fn skew_glucose_writes(mut self, skew: f64) -> Self {
        self.glucose_skew = skew;
        self
    }

    pub fn set_steps(&self, day: NaiveDate, steps: i64) {
        self.days
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(day)
            .or_default()
            .steps = steps;
    }

    fn read<T>(
        &self,
        field: TrackedField,
        day: NaiveDate,
        f: impl FnOnce(&DayData) -> T,
    ) -> Result<T, ProviderError>
    where
        T: Default,
    {
        if self.denied {
            return Err(ProviderError::Unauthorized);
        }
        if self.failing.contains(&field) || self.failing_days.contains(&day) {
            return Err(ProviderError::Query(format!("{field} query failed")));
        }
        let days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(days.get(&day).map(f).unwrap_or_default())
    }
}

#[async_trait]
impl ExternalMetricsProvider for FakeProvider {
    async fn authorize(&self) -> bool {
        !self.denied
    }

    async fn steps_for_day(&self, day: NaiveDate) -> Result<i64, ProviderError> {
        self.step_calls.fetch_add(1, Ordering::SeqCst);
        self.read(TrackedField::Steps, day, |d| d.steps)
    }

    async fn glucose_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError> {
        self.read(TrackedField::Glucose, day, |d| d.glucose)
    }

    async fn sleep_for_day(&self, day: NaiveDate) -> Result<Option<SleepDuration>, ProviderError> {
        self.read(TrackedField::Sleep, day, |d| d.sleep)
    }

    async fn heart_rate_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Option<HeartRateStats>, ProviderError> {
        self.read(TrackedField::HeartRate, day, |d| d.heart_rate)
    }

    async fn weight_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError> {
        self.read(TrackedField::Weight, day, |d| d.weight)
    }

    async fn delete_glucose_samples(&self, day: NaiveDate) -> Result<(), ProviderError> {
        if self.denied {
            return Err(ProviderError::Unauthorized);
        }
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(data) = days.get_mut(&day) {
            data.glucose = None;
        }
        Ok(())
    }

    async fn write_glucose_sample(
        &self,
        value: f64,
        at: DateTime<FixedOffset>,
    ) -> Result<(), ProviderError> {
        if self.denied {
            return Err(ProviderError::Unauthorized);
        }
        let mut days = self.days.lock().unwrap_or_else(PoisonError::into_inner);
        days.entry(at.date_naive()).or_default().glucose = Some(value + self.glucose_skew);
        Ok(())
    }
}

/// Store that starts rejecting inserts after a number of successful ones.
pub(crate) struct FailingStore {
    inner: Mutex<Database>,
    inserts_allowed: usize,
    inserts: AtomicUsize,
    fail_saves: bool,
}

impl FailingStore {
    pub fn failing_inserts_after(inserts_allowed: usize) -> Self {
        Self {
            inner: Mutex::new(Database::open_in_memory().unwrap()),
            inserts_allowed,
            inserts: AtomicUsize::new(0),
            fail_saves: false,
        }
    }

    pub fn failing_saves() -> Self {
        Self {
            fail_saves: true,
            ..Self::failing_inserts_after(usize::MAX)
        }
    }

    /// Bypass the failure budget when seeding fixtures.
    pub fn seed(&self, record: &DailyHealthRecord) {
        self.inner.insert(record).unwrap();
    }
}

impl DailyRecordStore for FailingStore {
    fn fetch_all(&self) -> Result<Vec<DailyHealthRecord>> {
        self.inner.fetch_all()
    }

    fn fetch_by_day(&self, day: NaiveDate) -> Result<Option<DailyHealthRecord>> {
        self.inner.fetch_by_day(day)
    }

    fn fetch_range(&self, start: NaiveDate, end: NaiveDate) -> Result<Vec<DailyHealthRecord>> {
        self.inner.fetch_range(start, end)
    }

    fn insert(&self, record: &DailyHealthRecord) -> Result<()> {
        if self.inserts.fetch_add(1, Ordering::SeqCst) >= self.inserts_allowed {
            bail!("disk full");
        }
        self.inner.insert(record)
    }

    fn save(&self, record: &mut DailyHealthRecord) -> Result<()> {
        if self.fail_saves {
            bail!("database is locked");
        }
        self.inner.save(record)
    }

    fn delete(&self, id: &str) -> Result<bool> {
        self.inner.delete(id)
    }
}
