use std::path::Path;

use anyhow::{Context, Result};

use daybook_core::service::DaybookService;

use super::helpers::{json_error, print_json};

pub(crate) async fn cmd_import_readings(
    service: &DaybookService,
    path: &Path,
    dry_run: bool,
    json: bool,
) -> Result<()> {
    let file = std::fs::File::open(path)
        .with_context(|| format!("Failed to open file: {}", path.display()))?;

    let summary = service.import_readings_csv(file, dry_run).await?;

    if summary.glucose_readings == 0 && summary.ketone_readings == 0 {
        let message = "No blood glucose or ketone readings found in file";
        if json {
            println!("{}", json_error(message));
        } else {
            eprintln!("{message} ({} rows skipped).", summary.rows_skipped);
        }
        return Ok(());
    }

    if json {
        return print_json(&summary);
    }

    if dry_run {
        println!("Dry run, no changes made.\n");
        println!("  Glucose readings:   {}", summary.glucose_readings);
        println!("  Ketone readings:    {}", summary.ketone_readings);
        println!("  Days to update:     {}", summary.ketone_days_updated);
        println!("  Records to create:  {}", summary.records_created);
    } else {
        println!("Import complete.\n");
        println!(
            "  Glucose written:    {} of {}",
            summary.glucose_written, summary.glucose_readings
        );
        println!("  Ketone readings:    {}", summary.ketone_readings);
        println!("  Days updated:       {}", summary.ketone_days_updated);
        println!("  Records created:    {}", summary.records_created);
    }
    println!("  Days spanned:       {}", summary.days_spanned);
    println!("  Rows skipped:       {}", summary.rows_skipped);

    if !summary.failures.is_empty() {
        eprintln!("\n{} readings failed:", summary.failures.len());
        for failure in &summary.failures {
            eprintln!("  {}: {}", failure.timestamp, failure.error);
        }
    }

    Ok(())
}
