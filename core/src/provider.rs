use std::path::PathBuf;
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::{HeartRateStats, SleepDuration};

/// Read-mostly source of health metrics (a phone health store, a wearable
/// export, ...). Absence of data is `Ok(None)` (or `Ok(0)` for steps), never
/// an error.
#[async_trait]
pub trait ExternalMetricsProvider: Send + Sync {
    async fn authorize(&self) -> bool;

    /// Cumulative step count for the day, 0 if none.
    async fn steps_for_day(&self, day: NaiveDate) -> Result<i64, ProviderError>;

    /// Latest glucose sample of the day in mg/dL.
    async fn glucose_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError>;

    /// Total time asleep across sleep intervals that ended on `day`.
    async fn sleep_for_day(&self, day: NaiveDate) -> Result<Option<SleepDuration>, ProviderError>;

    async fn heart_rate_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Option<HeartRateStats>, ProviderError>;

    /// Latest weight sample of the day in lbs.
    async fn weight_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError>;

    async fn delete_glucose_samples(&self, day: NaiveDate) -> Result<(), ProviderError>;

    async fn write_glucose_sample(
        &self,
        value: f64,
        at: DateTime<FixedOffset>,
    ) -> Result<(), ProviderError>;
}

// --- Sample file provider ---

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantitySample {
    pub at: DateTime<FixedOffset>,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SleepStage {
    #[default]
    Asleep,
    InBed,
    Awake,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SleepSample {
    pub start: DateTime<FixedOffset>,
    pub end: DateTime<FixedOffset>,
    #[serde(default)]
    pub stage: SleepStage,
}

/// Raw samples as stored in a health export file. The calendar day of a
/// sample is taken in its own UTC offset.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricSamples {
    #[serde(default)]
    pub steps: Vec<QuantitySample>,
    #[serde(default)]
    pub glucose: Vec<QuantitySample>,
    #[serde(default)]
    pub sleep: Vec<SleepSample>,
    #[serde(default)]
    pub heart_rate: Vec<QuantitySample>,
    #[serde(default)]
    pub weight: Vec<QuantitySample>,
}

impl MetricSamples {
    fn on_day(samples: &[QuantitySample], day: NaiveDate) -> impl Iterator<Item = &QuantitySample> {
        samples.iter().filter(move |s| s.at.date_naive() == day)
    }

    fn latest_on_day(samples: &[QuantitySample], day: NaiveDate) -> Option<f64> {
        Self::on_day(samples, day)
            .max_by_key(|s| s.at)
            .map(|s| s.value)
    }

    #[must_use]
    pub fn steps_for_day(&self, day: NaiveDate) -> i64 {
        let total: f64 = Self::on_day(&self.steps, day).map(|s| s.value).sum();
        total.round() as i64
    }

    #[must_use]
    pub fn glucose_for_day(&self, day: NaiveDate) -> Option<f64> {
        Self::latest_on_day(&self.glucose, day)
    }

    #[must_use]
    pub fn weight_for_day(&self, day: NaiveDate) -> Option<f64> {
        Self::latest_on_day(&self.weight, day)
    }

    #[must_use]
    pub fn sleep_for_day(&self, day: NaiveDate) -> Option<SleepDuration> {
        let seconds: i64 = self
            .sleep
            .iter()
            .filter(|s| s.stage == SleepStage::Asleep && s.end.date_naive() == day)
            .map(|s| (s.end - s.start).num_seconds().max(0))
            .sum();
        (seconds > 0).then(|| SleepDuration::from_minutes(seconds / 60))
    }

    #[must_use]
    pub fn heart_rate_for_day(&self, day: NaiveDate) -> Option<HeartRateStats> {
        let values: Vec<f64> = Self::on_day(&self.heart_rate, day)
            .map(|s| s.value)
            .collect();
        if values.is_empty() {
            return None;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        #[allow(clippy::cast_precision_loss)]
        let avg = values.iter().sum::<f64>() / values.len() as f64;
        Some(HeartRateStats { min, max, avg })
    }
}

/// Provider backed by a JSON file of [`MetricSamples`].
///
/// The file is loaded on first use (normally by `authorize`). Glucose writes
/// are applied to the loaded samples and written back to the file.
pub struct SampleFileProvider {
    path: Option<PathBuf>,
    samples: Mutex<Option<MetricSamples>>,
}

impl SampleFileProvider {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: Some(path.into()),
            samples: Mutex::new(None),
        }
    }

    /// Provider over in-memory samples; writes are not persisted anywhere.
    #[must_use]
    pub fn in_memory(samples: MetricSamples) -> Self {
        Self {
            path: None,
            samples: Mutex::new(Some(samples)),
        }
    }

    fn loaded(&self) -> Result<MutexGuard<'_, Option<MetricSamples>>, ProviderError> {
        let mut guard = self.samples.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.is_none() {
            let Some(path) = &self.path else {
                return Err(ProviderError::Unauthorized);
            };
            let text = std::fs::read_to_string(path)?;
            *guard = Some(serde_json::from_str(&text)?);
            tracing::debug!(path = %path.display(), "loaded health samples");
        }
        Ok(guard)
    }

    fn with_samples<T>(&self, f: impl FnOnce(&MetricSamples) -> T) -> Result<T, ProviderError> {
        let guard = self.loaded()?;
        guard.as_ref().map(f).ok_or(ProviderError::Unauthorized)
    }

    fn update_samples(&self, f: impl FnOnce(&mut MetricSamples)) -> Result<(), ProviderError> {
        let mut guard = self.loaded()?;
        let mut updated = guard.clone().ok_or(ProviderError::Unauthorized)?;
        f(&mut updated);
        // Memory only changes once the file write has gone through
        if let Some(path) = &self.path {
            let json = serde_json::to_string_pretty(&updated)?;
            std::fs::write(path, json)?;
        }
        *guard = Some(updated);
        Ok(())
    }
}

#[async_trait]
impl ExternalMetricsProvider for SampleFileProvider {
    async fn authorize(&self) -> bool {
        match self.loaded() {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(error = %e, "health samples unavailable");
                false
            }
        }
    }

    async fn steps_for_day(&self, day: NaiveDate) -> Result<i64, ProviderError> {
        self.with_samples(|s| s.steps_for_day(day))
    }

    async fn glucose_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError> {
        self.with_samples(|s| s.glucose_for_day(day))
    }

    async fn sleep_for_day(&self, day: NaiveDate) -> Result<Option<SleepDuration>, ProviderError> {
        self.with_samples(|s| s.sleep_for_day(day))
    }

    async fn heart_rate_for_day(
        &self,
        day: NaiveDate,
    ) -> Result<Option<HeartRateStats>, ProviderError> {
        self.with_samples(|s| s.heart_rate_for_day(day))
    }

    async fn weight_for_day(&self, day: NaiveDate) -> Result<Option<f64>, ProviderError> {
        self.with_samples(|s| s.weight_for_day(day))
    }

    async fn delete_glucose_samples(&self, day: NaiveDate) -> Result<(), ProviderError> {
        self.update_samples(|s| s.glucose.retain(|g| g.at.date_naive() != day))
    }

    async fn write_glucose_sample(
        &self,
        value: f64,
        at: DateTime<FixedOffset>,
    ) -> Result<(), ProviderError> {
        self.update_samples(|s| s.glucose.push(QuantitySample { at, value }))
    }
}
