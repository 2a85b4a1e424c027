use anyhow::{Context, Result, bail};
use chrono::{Local, NaiveDate, NaiveTime};
use serde::Serialize;

use daybook_core::models::{DailyHealthRecord, HeartRateStats, TrackedField, validate_heart_rate};

pub(crate) fn parse_date(date_str: Option<String>) -> Result<NaiveDate> {
    match date_str {
        None => Ok(Local::now().date_naive()),
        Some(s) => match s.as_str() {
            "today" => Ok(Local::now().date_naive()),
            "yesterday" => Ok(Local::now().date_naive() - chrono::Duration::days(1)),
            "tomorrow" => Ok(Local::now().date_naive() + chrono::Duration::days(1)),
            _ => NaiveDate::parse_from_str(&s, "%Y-%m-%d").with_context(|| {
                format!("Invalid date '{s}'. Use YYYY-MM-DD or today/yesterday/tomorrow")
            }),
        },
    }
}

pub(crate) fn parse_time(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .with_context(|| format!("Invalid time '{s}'. Use HH:MM (24-hour)"))
}

/// Parses `"min/max/avg"`, e.g. `"52/131/68"`.
pub(crate) fn parse_heart_rate(s: &str) -> Result<HeartRateStats> {
    let parts: Vec<&str> = s.split('/').map(str::trim).collect();
    let [min, max, avg] = parts.as_slice() else {
        bail!("Invalid heart rate '{s}'. Use min/max/avg, e.g. 52/131/68");
    };
    let parse = |v: &str| -> Result<f64> {
        v.parse()
            .with_context(|| format!("Invalid heart rate value '{v}'"))
    };
    let stats = HeartRateStats {
        min: parse(min)?,
        max: parse(max)?,
        avg: parse(avg)?,
    };
    validate_heart_rate(stats)?;
    Ok(stats)
}

pub(crate) fn parse_field(s: &str) -> Result<TrackedField> {
    let wanted = s.trim().to_lowercase().replace('-', "_");
    let alias = match wanted.as_str() {
        "bp" => "blood_pressure",
        "hr" => "heart_rate",
        other => other,
    };
    TrackedField::ALL
        .into_iter()
        .find(|f| f.as_str() == alias)
        .with_context(|| {
            let names: Vec<&str> = TrackedField::ALL.iter().map(|f| f.as_str()).collect();
            format!("Unknown field '{s}'. Must be one of: {}", names.join(", "))
        })
}

pub(crate) fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub(crate) fn json_error(message: &str) -> String {
    #[derive(Serialize)]
    struct CliError<'a> {
        error: &'a str,
    }
    serde_json::to_string(&CliError { error: message })
        .unwrap_or_else(|_| format!("{{\"error\":\"{message}\"}}"))
}

pub(crate) fn no_neg_zero(v: f64) -> f64 {
    if v == 0.0 { 0.0 } else { v }
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let end = s.char_indices().nth(max - 3).map_or(s.len(), |(i, _)| i);
        format!("{}...", &s[..end])
    }
}

/// Display value of one tracked field, `-` when absent.
pub(crate) fn field_value(record: &DailyHealthRecord, field: TrackedField) -> String {
    let m = record.metrics();
    let value = match field {
        TrackedField::Steps => m.steps.map(|v| v.to_string()),
        TrackedField::Glucose => m.glucose.map(|v| format!("{v:.0} mg/dL")),
        TrackedField::Ketones => m.ketones.map(|v| format!("{v:.1} mmol/L")),
        TrackedField::BloodPressure => m.blood_pressure.map(|v| v.to_string()),
        TrackedField::Weight => m.weight.map(|v| format!("{v:.1} lbs")),
        TrackedField::Sleep => m.sleep.map(|v| v.to_string()),
        TrackedField::HeartRate => m
            .heart_rate
            .map(|v| format!("{:.0}-{:.0} (avg {:.0}) bpm", v.min, v.max, v.avg)),
    };
    value.unwrap_or_else(|| "-".to_string())
}

/// Where a present field's value came from.
pub(crate) fn field_source(record: &DailyHealthRecord, field: TrackedField) -> &'static str {
    if !record.metrics().is_present(field) {
        ""
    } else if record.is_synced(field) {
        "synced"
    } else {
        "manual"
    }
}
