use std::fmt;
use std::str::FromStr;

use anyhow::{Result, bail};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// --- Tracked value types ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloodPressure {
    pub systolic: i64,
    pub diastolic: i64,
}

impl fmt::Display for BloodPressure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.systolic, self.diastolic)
    }
}

impl FromStr for BloodPressure {
    type Err = anyhow::Error;

    /// Parses `"120/80"`.
    fn from_str(s: &str) -> Result<Self> {
        let Some((sys, dia)) = s.trim().split_once('/') else {
            bail!("Invalid blood pressure '{s}'. Use systolic/diastolic, e.g. 120/80");
        };
        let bp = BloodPressure {
            systolic: sys.trim().parse()?,
            diastolic: dia.trim().parse()?,
        };
        validate_blood_pressure(bp)?;
        Ok(bp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SleepDuration {
    pub hours: i64,
    pub minutes: i64,
}

impl SleepDuration {
    #[must_use]
    pub fn from_minutes(total: i64) -> Self {
        Self {
            hours: total / 60,
            minutes: total % 60,
        }
    }

    #[must_use]
    pub fn total_minutes(self) -> i64 {
        self.hours * 60 + self.minutes
    }
}

impl fmt::Display for SleepDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}h {}m", self.hours, self.minutes)
    }
}

impl FromStr for SleepDuration {
    type Err = anyhow::Error;

    /// Accepts `"7h 30m"`, `"7h"`, `"45m"` and `"7:30"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim().to_lowercase();
        let parsed = if let Some((h, m)) = s.split_once(':') {
            Some((h.trim().parse::<i64>(), m.trim().parse::<i64>()))
        } else if s.contains('h') || s.contains('m') {
            let (h, rest) = match s.split_once('h') {
                Some((h, rest)) => (h.trim(), rest.trim()),
                None => ("0", s.as_str()),
            };
            let m = rest.trim_end_matches('m').trim();
            let m = if m.is_empty() { "0" } else { m };
            Some((h.parse::<i64>(), m.parse::<i64>()))
        } else {
            None
        };

        let Some((Ok(hours), Ok(minutes))) = parsed else {
            bail!("Invalid sleep duration '{s}'. Use e.g. '7h 30m' or '7:30'");
        };
        let sleep = SleepDuration { hours, minutes };
        validate_sleep(sleep)?;
        Ok(sleep)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartRateStats {
    pub min: f64,
    pub max: f64,
    pub avg: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressLevel {
    Low,
    Medium,
    High,
}

impl StressLevel {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

impl FromStr for StressLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "medium" => Ok(Self::Medium),
            "high" => Ok(Self::High),
            _ => bail!("Invalid stress level '{s}'. Must be one of: low, medium, high"),
        }
    }
}

// --- Tracked fields and provenance ---

/// A record field that can be filled from the external provider and
/// therefore carries a provenance flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackedField {
    Steps,
    Glucose,
    Ketones,
    BloodPressure,
    Weight,
    Sleep,
    HeartRate,
}

impl TrackedField {
    pub const ALL: [TrackedField; 7] = [
        Self::Steps,
        Self::Glucose,
        Self::Ketones,
        Self::BloodPressure,
        Self::Weight,
        Self::Sleep,
        Self::HeartRate,
    ];

    /// Fields the provider has a source for. Ketones and blood pressure are
    /// tracked but only ever written by the user or by reading import.
    pub const SYNCED: [TrackedField; 5] = [
        Self::Steps,
        Self::Glucose,
        Self::Sleep,
        Self::HeartRate,
        Self::Weight,
    ];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Steps => "steps",
            Self::Glucose => "glucose",
            Self::Ketones => "ketones",
            Self::BloodPressure => "blood_pressure",
            Self::Weight => "weight",
            Self::Sleep => "sleep",
            Self::HeartRate => "heart_rate",
        }
    }
}

impl fmt::Display for TrackedField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TrackedMetrics {
    pub steps: Option<i64>,
    pub glucose: Option<f64>,
    pub ketones: Option<f64>,
    pub blood_pressure: Option<BloodPressure>,
    pub weight: Option<f64>,
    pub sleep: Option<SleepDuration>,
    pub heart_rate: Option<HeartRateStats>,
}

impl TrackedMetrics {
    #[must_use]
    pub fn is_present(&self, field: TrackedField) -> bool {
        match field {
            TrackedField::Steps => self.steps.is_some(),
            TrackedField::Glucose => self.glucose.is_some(),
            TrackedField::Ketones => self.ketones.is_some(),
            TrackedField::BloodPressure => self.blood_pressure.is_some(),
            TrackedField::Weight => self.weight.is_some(),
            TrackedField::Sleep => self.sleep.is_some(),
            TrackedField::HeartRate => self.heart_rate.is_some(),
        }
    }
}

/// Per-field "last written by sync" flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Provenance {
    pub steps: bool,
    pub glucose: bool,
    pub ketones: bool,
    pub blood_pressure: bool,
    pub weight: bool,
    pub sleep: bool,
    pub heart_rate: bool,
}

impl Provenance {
    #[must_use]
    pub fn is_synced(&self, field: TrackedField) -> bool {
        match field {
            TrackedField::Steps => self.steps,
            TrackedField::Glucose => self.glucose,
            TrackedField::Ketones => self.ketones,
            TrackedField::BloodPressure => self.blood_pressure,
            TrackedField::Weight => self.weight,
            TrackedField::Sleep => self.sleep,
            TrackedField::HeartRate => self.heart_rate,
        }
    }

    pub(crate) fn set(&mut self, field: TrackedField, synced: bool) {
        let flag = match field {
            TrackedField::Steps => &mut self.steps,
            TrackedField::Glucose => &mut self.glucose,
            TrackedField::Ketones => &mut self.ketones,
            TrackedField::BloodPressure => &mut self.blood_pressure,
            TrackedField::Weight => &mut self.weight,
            TrackedField::Sleep => &mut self.sleep,
            TrackedField::HeartRate => &mut self.heart_rate,
        };
        *flag = synced;
    }
}

/// A direct (user) write to one tracked field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackedEdit {
    Steps(Option<i64>),
    Glucose(Option<f64>),
    Ketones(Option<f64>),
    BloodPressure(Option<BloodPressure>),
    Weight(Option<f64>),
    Sleep(Option<SleepDuration>),
    HeartRate(Option<HeartRateStats>),
}

impl TrackedEdit {
    #[must_use]
    pub fn field(&self) -> TrackedField {
        match self {
            Self::Steps(_) => TrackedField::Steps,
            Self::Glucose(_) => TrackedField::Glucose,
            Self::Ketones(_) => TrackedField::Ketones,
            Self::BloodPressure(_) => TrackedField::BloodPressure,
            Self::Weight(_) => TrackedField::Weight,
            Self::Sleep(_) => TrackedField::Sleep,
            Self::HeartRate(_) => TrackedField::HeartRate,
        }
    }

    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Steps(Some(v)) => validate_steps(v),
            Self::Glucose(Some(v)) => validate_glucose(v),
            Self::Ketones(Some(v)) => validate_ketones(v),
            Self::BloodPressure(Some(v)) => validate_blood_pressure(v),
            Self::Weight(Some(v)) => validate_weight(v),
            Self::Sleep(Some(v)) => validate_sleep(v),
            Self::HeartRate(Some(v)) => validate_heart_rate(v),
            _ => Ok(()),
        }
    }
}

/// Explicit provenance transition produced by a tracked-field write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProvenanceChange {
    pub field: TrackedField,
    pub was_synced: bool,
    pub is_synced: bool,
}

// --- Daily record ---

/// User-owned fields. Never touched by sync.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct RecordDetails {
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub stress_level: Option<StressLevel>,
    #[serde(default)]
    pub walked_am: bool,
    #[serde(default)]
    pub walked_pm: bool,
    #[serde(default)]
    pub went_to_gym: bool,
    #[serde(default)]
    pub light_therapy: bool,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub wake_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub first_meal_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub last_meal_time: Option<NaiveTime>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub notes: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub weather: Option<String>,
}

/// One calendar day of the journal.
///
/// Tracked metrics and their provenance flags are only writable through
/// [`DailyHealthRecord::apply_edit`] (user writes, which clear provenance)
/// and the sync merge (which sets value and provenance together).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailyHealthRecord {
    pub id: String,
    pub day: NaiveDate,
    pub(crate) metrics: TrackedMetrics,
    pub(crate) provenance: Provenance,
    pub details: RecordDetails,
    pub(crate) week_total_steps_cache: Option<i64>,
    pub created_at: String,
    pub updated_at: String,
}

impl DailyHealthRecord {
    #[must_use]
    pub fn new(day: NaiveDate) -> Self {
        let now = Local::now().to_rfc3339();
        Self {
            id: Uuid::new_v4().to_string(),
            day,
            metrics: TrackedMetrics::default(),
            provenance: Provenance::default(),
            details: RecordDetails::default(),
            week_total_steps_cache: None,
            created_at: now.clone(),
            updated_at: now,
        }
    }

    #[must_use]
    pub fn metrics(&self) -> &TrackedMetrics {
        &self.metrics
    }

    #[must_use]
    pub fn provenance(&self) -> &Provenance {
        &self.provenance
    }

    #[must_use]
    pub fn is_synced(&self, field: TrackedField) -> bool {
        self.provenance.is_synced(field)
    }

    #[must_use]
    pub fn week_total_steps_cache(&self) -> Option<i64> {
        self.week_total_steps_cache
    }

    pub(crate) fn set_week_total_steps_cache(&mut self, total: Option<i64>) {
        self.week_total_steps_cache = total;
    }

    /// Apply a direct edit. The field's provenance flag is always cleared.
    pub fn apply_edit(&mut self, edit: TrackedEdit) -> ProvenanceChange {
        let field = edit.field();
        match edit {
            TrackedEdit::Steps(v) => self.metrics.steps = v,
            TrackedEdit::Glucose(v) => self.metrics.glucose = v,
            TrackedEdit::Ketones(v) => self.metrics.ketones = v,
            TrackedEdit::BloodPressure(v) => self.metrics.blood_pressure = v,
            TrackedEdit::Weight(v) => self.metrics.weight = v,
            TrackedEdit::Sleep(v) => self.metrics.sleep = v,
            TrackedEdit::HeartRate(v) => self.metrics.heart_rate = v,
        }
        let was_synced = self.provenance.is_synced(field);
        self.provenance.set(field, false);
        ProvenanceChange {
            field,
            was_synced,
            is_synced: false,
        }
    }

    /// Ketone value taken from an imported meter reading. Counts as a sync
    /// write, so the flag is set.
    pub(crate) fn apply_imported_ketones(&mut self, value: f64) -> ProvenanceChange {
        self.metrics.ketones = Some(value);
        let was_synced = self.provenance.ketones;
        self.provenance.ketones = true;
        ProvenanceChange {
            field: TrackedField::Ketones,
            was_synced,
            is_synced: true,
        }
    }
}

// --- External data ---

/// Provider values fetched for one day in a single coordinated operation.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ExternalDayBundle {
    pub day: NaiveDate,
    pub steps: Option<i64>,
    pub glucose: Option<f64>,
    pub sleep: Option<SleepDuration>,
    pub heart_rate: Option<HeartRateStats>,
    pub weight: Option<f64>,
    /// Fields whose fetch failed (and are therefore absent).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub failed: Vec<TrackedField>,
}

impl ExternalDayBundle {
    #[must_use]
    pub fn empty(day: NaiveDate) -> Self {
        Self {
            day,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_present(&self, field: TrackedField) -> bool {
        match field {
            TrackedField::Steps => self.steps.is_some(),
            TrackedField::Glucose => self.glucose.is_some(),
            TrackedField::Sleep => self.sleep.is_some(),
            TrackedField::HeartRate => self.heart_rate.is_some(),
            TrackedField::Weight => self.weight.is_some(),
            TrackedField::Ketones | TrackedField::BloodPressure => false,
        }
    }

    #[must_use]
    pub fn populated(&self) -> Vec<TrackedField> {
        TrackedField::SYNCED
            .into_iter()
            .filter(|f| self.is_present(*f))
            .collect()
    }
}

// --- Settings ---

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct WeightProgress {
    pub initial: Option<f64>,
    pub target: Option<f64>,
    pub latest: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_day: Option<NaiveDate>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_since_initial: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub remaining_to_target: Option<f64>,
}

impl WeightProgress {
    #[must_use]
    pub fn compute(
        initial: Option<f64>,
        target: Option<f64>,
        latest: Option<(NaiveDate, f64)>,
    ) -> Self {
        let latest_weight = latest.map(|(_, w)| w);
        Self {
            initial,
            target,
            latest: latest_weight,
            latest_day: latest.map(|(d, _)| d),
            change_since_initial: initial.zip(latest_weight).map(|(i, l)| l - i),
            remaining_to_target: target.zip(latest_weight).map(|(t, l)| l - t),
        }
    }
}

// --- Validation ---

pub fn validate_steps(steps: i64) -> Result<()> {
    if steps < 0 {
        bail!("Steps must not be negative");
    }
    Ok(())
}

pub fn validate_glucose(mg_dl: f64) -> Result<()> {
    if !(mg_dl > 0.0 && mg_dl < 1000.0) {
        bail!("Glucose must be between 0 and 1000 mg/dL (got {mg_dl})");
    }
    Ok(())
}

pub fn validate_ketones(mmol_l: f64) -> Result<()> {
    if !(0.0..=20.0).contains(&mmol_l) {
        bail!("Ketones must be between 0 and 20 mmol/L (got {mmol_l})");
    }
    Ok(())
}

pub fn validate_weight(lbs: f64) -> Result<()> {
    if lbs <= 0.0 || !lbs.is_finite() {
        bail!("Weight must be greater than 0");
    }
    Ok(())
}

pub fn validate_blood_pressure(bp: BloodPressure) -> Result<()> {
    if bp.diastolic <= 0 || bp.systolic <= 0 {
        bail!("Blood pressure values must be greater than 0");
    }
    if bp.systolic <= bp.diastolic {
        bail!(
            "Systolic ({}) must be greater than diastolic ({})",
            bp.systolic,
            bp.diastolic
        );
    }
    Ok(())
}

pub fn validate_sleep(sleep: SleepDuration) -> Result<()> {
    if sleep.hours < 0 || !(0..60).contains(&sleep.minutes) {
        bail!("Sleep must be a non-negative duration with minutes between 0 and 59");
    }
    if sleep.total_minutes() > 24 * 60 {
        bail!("Sleep cannot exceed 24 hours");
    }
    Ok(())
}

pub fn validate_heart_rate(hr: HeartRateStats) -> Result<()> {
    if hr.min <= 0.0 {
        bail!("Heart rate must be greater than 0");
    }
    if hr.min > hr.avg || hr.avg > hr.max {
        bail!("Heart rate stats must satisfy min <= avg <= max");
    }
    Ok(())
}
