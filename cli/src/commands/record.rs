use anyhow::{Result, bail};
use chrono::Local;
use clap::Args;
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use daybook_core::form::FormOptions;
use daybook_core::models::{
    BloodPressure, DailyHealthRecord, HeartRateStats, ProvenanceChange, RecordDetails,
    SleepDuration, StressLevel, TrackedEdit, TrackedField,
};
use daybook_core::service::DaybookService;

use super::helpers::{
    field_source, field_value, json_error, parse_date, parse_field, parse_heart_rate, parse_time,
    print_json, truncate,
};

/// Field values for `daybook edit`. Tracked values written here count as
/// manual entries and are no longer replaced by sync.
#[derive(Args, Debug, Default)]
pub(crate) struct EditArgs {
    /// Step count
    #[arg(long)]
    steps: Option<i64>,
    /// Blood glucose in mg/dL
    #[arg(long)]
    glucose: Option<f64>,
    /// Blood ketones in mmol/L
    #[arg(long)]
    ketones: Option<f64>,
    /// Blood pressure as systolic/diastolic, e.g. 120/80
    #[arg(long)]
    bp: Option<BloodPressure>,
    /// Weight in lbs
    #[arg(long)]
    weight: Option<f64>,
    /// Sleep duration, e.g. "7h 30m" or 7:30
    #[arg(long)]
    sleep: Option<SleepDuration>,
    /// Heart rate as min/max/avg, e.g. 52/131/68
    #[arg(long, value_parser = parse_heart_rate)]
    heart_rate: Option<HeartRateStats>,
    /// Clear a tracked field (repeatable): steps, glucose, ketones, bp, weight, sleep, hr
    #[arg(long, value_parser = parse_field)]
    clear: Vec<TrackedField>,
    /// Stress level: low, medium, high
    #[arg(long)]
    stress: Option<StressLevel>,
    #[arg(long)]
    walked_am: Option<bool>,
    #[arg(long)]
    walked_pm: Option<bool>,
    #[arg(long)]
    gym: Option<bool>,
    #[arg(long)]
    light_therapy: Option<bool>,
    /// Wake time (HH:MM)
    #[arg(long)]
    wake: Option<String>,
    /// First meal time (HH:MM)
    #[arg(long)]
    first_meal: Option<String>,
    /// Last meal time (HH:MM)
    #[arg(long)]
    last_meal: Option<String>,
    /// Free-form notes (empty string clears)
    #[arg(long)]
    notes: Option<String>,
    /// Weather description (empty string clears)
    #[arg(long)]
    weather: Option<String>,
    /// Let today's step count from health data replace a step value already recorded
    #[arg(long)]
    overwrite_steps: bool,
}

impl EditArgs {
    fn tracked_edits(&self) -> Vec<TrackedEdit> {
        let mut edits: Vec<TrackedEdit> = self.clear.iter().map(|f| clear_edit(*f)).collect();
        edits.extend(self.steps.map(|v| TrackedEdit::Steps(Some(v))));
        edits.extend(self.glucose.map(|v| TrackedEdit::Glucose(Some(v))));
        edits.extend(self.ketones.map(|v| TrackedEdit::Ketones(Some(v))));
        edits.extend(self.bp.map(|v| TrackedEdit::BloodPressure(Some(v))));
        edits.extend(self.weight.map(|v| TrackedEdit::Weight(Some(v))));
        edits.extend(self.sleep.map(|v| TrackedEdit::Sleep(Some(v))));
        edits.extend(self.heart_rate.map(|v| TrackedEdit::HeartRate(Some(v))));
        edits
    }

    fn has_detail_changes(&self) -> bool {
        self.stress.is_some()
            || self.walked_am.is_some()
            || self.walked_pm.is_some()
            || self.gym.is_some()
            || self.light_therapy.is_some()
            || self.wake.is_some()
            || self.first_meal.is_some()
            || self.last_meal.is_some()
            || self.notes.is_some()
            || self.weather.is_some()
    }

    /// Build the detail update up front so bad input fails before the form
    /// is touched.
    fn detail_update(&self) -> Result<impl FnOnce(&mut RecordDetails)> {
        let wake = self.wake.as_deref().map(parse_time).transpose()?;
        let first_meal = self.first_meal.as_deref().map(parse_time).transpose()?;
        let last_meal = self.last_meal.as_deref().map(parse_time).transpose()?;
        let stress = self.stress;
        let (walked_am, walked_pm, gym, light_therapy) =
            (self.walked_am, self.walked_pm, self.gym, self.light_therapy);
        let notes = self.notes.clone();
        let weather = self.weather.clone();

        Ok(move |d: &mut RecordDetails| {
            if stress.is_some() {
                d.stress_level = stress;
            }
            if let Some(v) = walked_am {
                d.walked_am = v;
            }
            if let Some(v) = walked_pm {
                d.walked_pm = v;
            }
            if let Some(v) = gym {
                d.went_to_gym = v;
            }
            if let Some(v) = light_therapy {
                d.light_therapy = v;
            }
            if wake.is_some() {
                d.wake_time = wake;
            }
            if first_meal.is_some() {
                d.first_meal_time = first_meal;
            }
            if last_meal.is_some() {
                d.last_meal_time = last_meal;
            }
            if let Some(n) = notes {
                d.notes = non_empty(n);
            }
            if let Some(w) = weather {
                d.weather = non_empty(w);
            }
        })
    }
}

fn non_empty(s: String) -> Option<String> {
    let trimmed = s.trim();
    (!trimmed.is_empty()).then(|| trimmed.to_string())
}

fn clear_edit(field: TrackedField) -> TrackedEdit {
    match field {
        TrackedField::Steps => TrackedEdit::Steps(None),
        TrackedField::Glucose => TrackedEdit::Glucose(None),
        TrackedField::Ketones => TrackedEdit::Ketones(None),
        TrackedField::BloodPressure => TrackedEdit::BloodPressure(None),
        TrackedField::Weight => TrackedEdit::Weight(None),
        TrackedField::Sleep => TrackedEdit::Sleep(None),
        TrackedField::HeartRate => TrackedEdit::HeartRate(None),
    }
}

fn print_record(record: &DailyHealthRecord) {
    #[derive(Tabled)]
    struct FieldRow {
        #[tabled(rename = "Field")]
        field: &'static str,
        #[tabled(rename = "Value")]
        value: String,
        #[tabled(rename = "Source")]
        source: &'static str,
    }

    println!("{}", record.day.format("%A, %Y-%m-%d"));
    let rows: Vec<FieldRow> = TrackedField::ALL
        .into_iter()
        .map(|f| FieldRow {
            field: f.as_str(),
            value: field_value(record, f),
            source: field_source(record, f),
        })
        .collect();
    let table = Table::new(&rows).with(Style::rounded()).to_string();
    println!("{table}");

    if let Some(total) = record.week_total_steps_cache() {
        println!("  7-day steps:   {total}");
    }
    let d = &record.details;
    if let Some(stress) = d.stress_level {
        println!("  Stress:        {}", stress.as_str());
    }
    let habits: Vec<&str> = [
        (d.walked_am, "AM walk"),
        (d.walked_pm, "PM walk"),
        (d.went_to_gym, "gym"),
        (d.light_therapy, "light therapy"),
    ]
    .into_iter()
    .filter_map(|(done, name)| done.then_some(name))
    .collect();
    if !habits.is_empty() {
        println!("  Habits:        {}", habits.join(", "));
    }
    for (label, time) in [
        ("Woke up", d.wake_time),
        ("First meal", d.first_meal_time),
        ("Last meal", d.last_meal_time),
    ] {
        if let Some(t) = time {
            println!("  {:<14} {}", format!("{label}:"), t.format("%H:%M"));
        }
    }
    if let Some(ref w) = d.weather {
        println!("  Weather:       {w}");
    }
    if let Some(ref n) = d.notes {
        println!("  Notes:         {n}");
    }
}

pub(crate) fn cmd_show(service: &DaybookService, date: Option<String>, json: bool) -> Result<()> {
    let day = parse_date(date)?;

    match service.record_for_day(day)? {
        Some(record) if json => print_json(&record)?,
        Some(record) => print_record(&record),
        None => {
            let message = format!("No record for {day}");
            if json {
                println!("{}", json_error(&message));
            } else {
                eprintln!("{message}. Use `daybook edit` or `daybook sync` to create one.");
            }
        }
    }

    Ok(())
}

pub(crate) fn cmd_list(service: &DaybookService, days: Option<u32>, json: bool) -> Result<()> {
    let records = service.list_records(days.map(|d| d as usize))?;

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        eprintln!("No records yet. Use `daybook backfill` to start from today.");
        return Ok(());
    }

    #[derive(Tabled)]
    struct RecordRow {
        #[tabled(rename = "Date")]
        date: String,
        #[tabled(rename = "Steps")]
        steps: String,
        #[tabled(rename = "Glucose")]
        glucose: String,
        #[tabled(rename = "Ketones")]
        ketones: String,
        #[tabled(rename = "BP")]
        bp: String,
        #[tabled(rename = "Weight")]
        weight: String,
        #[tabled(rename = "Sleep")]
        sleep: String,
        #[tabled(rename = "7-day steps")]
        week: String,
        #[tabled(rename = "Notes")]
        notes: String,
    }

    let dash = || "-".to_string();
    let rows: Vec<RecordRow> = records
        .iter()
        .map(|r| {
            let m = r.metrics();
            RecordRow {
                date: r.day.format("%Y-%m-%d").to_string(),
                steps: m.steps.map_or_else(dash, |v| v.to_string()),
                glucose: m.glucose.map_or_else(dash, |v| format!("{v:.0}")),
                ketones: m.ketones.map_or_else(dash, |v| format!("{v:.1}")),
                bp: m.blood_pressure.map_or_else(dash, |v| v.to_string()),
                weight: m.weight.map_or_else(dash, |v| format!("{v:.1}")),
                sleep: m.sleep.map_or_else(dash, |v| v.to_string()),
                week: r
                    .week_total_steps_cache()
                    .map_or_else(dash, |v| v.to_string()),
                notes: r
                    .details
                    .notes
                    .as_deref()
                    .map(|n| truncate(n, 30))
                    .unwrap_or_default(),
            }
        })
        .collect();

    let table = Table::new(&rows)
        .with(Style::rounded())
        .with(Modify::new(Columns::new(1..8)).with(Alignment::right()))
        .to_string();
    println!("{table}");

    Ok(())
}

pub(crate) async fn cmd_edit(
    service: &DaybookService,
    date: Option<String>,
    args: EditArgs,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;
    let edits = args.tracked_edits();
    let detail_update = args
        .has_detail_changes()
        .then(|| args.detail_update())
        .transpose()?;

    let options = FormOptions {
        overwrite: args.overwrite_steps,
    };
    let mut form = service
        .open_form(day, Local::now().date_naive(), options)
        .await?;
    if !form.is_authorized() {
        tracing::info!(%day, "health data unavailable, saving manual values only");
    }

    let mut changes: Vec<ProvenanceChange> = Vec::with_capacity(edits.len());
    for edit in edits {
        changes.push(form.edit(edit)?);
    }
    if let Some(update) = detail_update {
        form.edit_details(update)?;
    }

    let created = form.is_new();
    let record = form.save()?;

    if json {
        #[derive(Serialize)]
        struct EditResult<'a> {
            created: bool,
            record: &'a DailyHealthRecord,
            changes: &'a [ProvenanceChange],
        }
        print_json(&EditResult {
            created,
            record,
            changes: &changes,
        })?;
    } else {
        let verb = if created { "Created" } else { "Updated" };
        println!("{verb} record for {day}");
        for change in changes.iter().filter(|c| c.was_synced) {
            println!("  {} is now a manual value and will not be synced", change.field);
        }
    }

    Ok(())
}

pub(crate) fn cmd_delete(service: &DaybookService, date: &str, json: bool) -> Result<()> {
    let day = parse_date(Some(date.to_string()))?;
    if !service.delete_record(day)? {
        bail!("No record for {day}");
    }

    if json {
        println!("{}", serde_json::json!({ "deleted": day }));
    } else {
        println!("Deleted record for {day}");
    }

    Ok(())
}
