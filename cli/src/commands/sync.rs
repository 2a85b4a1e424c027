use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;
use chrono::{Local, NaiveDate};
use serde::Serialize;
use tabled::{
    Table, Tabled,
    settings::{Alignment, Modify, Style, object::Columns},
};

use daybook_core::aggregate::week_start;
use daybook_core::models::TrackedField;
use daybook_core::service::DaybookService;

use super::helpers::{parse_date, print_json};

fn join_fields(fields: &[TrackedField]) -> String {
    fields
        .iter()
        .map(|f| f.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

pub(crate) async fn cmd_sync(
    service: &DaybookService,
    date: Option<String>,
    overwrite: bool,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;
    let report = service.sync_day(day, overwrite).await?;

    if json {
        return print_json(&report);
    }

    let status = if report.created {
        "new record"
    } else if report.outcome.changed() {
        "updated"
    } else {
        "no changes"
    };
    println!("Synced {day} ({status})");
    for (label, fields) in [
        ("Updated", &report.outcome.updated),
        ("Cleared", &report.outcome.cleared),
        ("Kept", &report.outcome.kept),
        ("Failed", &report.failed),
    ] {
        if !fields.is_empty() {
            println!("  {:<9} {}", format!("{label}:"), join_fields(fields));
        }
    }
    if !overwrite && !report.outcome.kept.is_empty() {
        eprintln!("Use --overwrite to replace existing values with health data.");
    }

    Ok(())
}

pub(crate) async fn cmd_backfill(service: &DaybookService, json: bool) -> Result<()> {
    let today = Local::now().date_naive();

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    let watcher = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nStopping after the current day...");
            flag.store(true, Ordering::SeqCst);
        }
    });

    let result = service
        .backfill(today, &cancel, |p| {
            if !json {
                eprint!("\rBackfilling {} ({}/{})", p.day, p.completed, p.total);
            }
        })
        .await;
    watcher.abort();
    let report = result?;

    if json {
        return print_json(&report);
    }

    if !report.created.is_empty() {
        eprintln!();
    }
    if report.cancelled {
        println!("Backfill cancelled.");
    } else {
        println!("Backfill complete.");
    }
    println!("  Days created:  {}", report.created.len());
    println!("  Days skipped:  {}", report.skipped);
    if let (Some(first), Some(last)) = (report.created.first(), report.created.last()) {
        println!("  Range:         {first} to {last}");
    }
    for (day, fields) in &report.degraded {
        println!("  {day}: could not fetch {}", join_fields(fields));
    }

    Ok(())
}

#[derive(Serialize)]
struct WeekTotal {
    start: NaiveDate,
    end: NaiveDate,
    total: i64,
    live: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    days: Vec<DaySteps>,
}

#[derive(Serialize, Tabled)]
struct DaySteps {
    #[tabled(rename = "Date")]
    day: NaiveDate,
    #[tabled(rename = "Running total")]
    running_total: i64,
}

pub(crate) async fn cmd_week(
    service: &DaybookService,
    date: Option<String>,
    live: bool,
    json: bool,
) -> Result<()> {
    let day = parse_date(date)?;

    let mut days = Vec::new();
    let total = if live {
        service
            .live_week_total(day, |d, running_total| {
                days.push(DaySteps {
                    day: d,
                    running_total,
                });
            })
            .await
    } else {
        service.cached_week_total(day)?
    };
    let week = WeekTotal {
        start: week_start(day),
        end: day,
        total,
        live,
        days,
    };

    if json {
        return print_json(&week);
    }

    let source = if live { "health data" } else { "journal" };
    println!(
        "Steps {} to {}: {} (from {source})",
        week.start, week.end, week.total
    );
    if !week.days.is_empty() {
        let table = Table::new(&week.days)
            .with(Style::rounded())
            .with(Modify::new(Columns::new(1..2)).with(Alignment::right()))
            .to_string();
        println!("{table}");
    }

    Ok(())
}

pub(crate) fn cmd_recompute(service: &DaybookService, json: bool) -> Result<()> {
    let updated = service.recompute_week_totals()?;

    if json {
        println!("{}", serde_json::json!({ "updated": updated }));
    } else if updated == 0 {
        println!("All week totals are up to date.");
    } else {
        println!("Updated week totals on {updated} records.");
    }

    Ok(())
}
