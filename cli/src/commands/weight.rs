use anyhow::Result;

use daybook_core::service::DaybookService;

use super::helpers::{no_neg_zero, print_json};

pub(crate) fn cmd_weight_target(
    service: &DaybookService,
    value: Option<f64>,
    clear: bool,
    json: bool,
) -> Result<()> {
    if clear {
        let removed = service.clear_weight_target()?;
        if json {
            println!("{}", serde_json::json!({ "cleared": removed }));
        } else if removed {
            println!("Cleared weight target");
        } else {
            println!("No weight target was set");
        }
        return Ok(());
    }

    match value {
        Some(lbs) => {
            service.set_weight_target(lbs)?;
            if json {
                println!("{}", serde_json::json!({ "target": lbs }));
            } else {
                println!("Weight target set to {lbs:.1} lbs");
            }
            Ok(())
        }
        None => cmd_weight_progress(service, json),
    }
}

pub(crate) fn cmd_weight_initial(service: &DaybookService, value: f64, json: bool) -> Result<()> {
    service.set_initial_weight(value)?;
    if json {
        println!("{}", serde_json::json!({ "initial": value }));
    } else {
        println!("Starting weight set to {value:.1} lbs");
    }
    Ok(())
}

pub(crate) fn cmd_weight_progress(service: &DaybookService, json: bool) -> Result<()> {
    let progress = service.weight_progress()?;

    if json {
        return print_json(&progress);
    }

    let show = |v: Option<f64>| v.map_or_else(|| "-".to_string(), |w| format!("{w:.1} lbs"));
    println!("  Starting weight: {}", show(progress.initial));
    match (progress.latest, progress.latest_day) {
        (Some(w), Some(day)) => println!("  Latest weight:   {w:.1} lbs ({day})"),
        _ => println!("  Latest weight:   -"),
    }
    println!("  Target:          {}", show(progress.target));
    if let Some(change) = progress.change_since_initial {
        println!("  Change:          {:+.1} lbs", no_neg_zero(change));
    }
    if let Some(remaining) = progress.remaining_to_target {
        if remaining > 0.0 {
            println!("  To go:           {remaining:.1} lbs");
        } else {
            println!("  Target reached ({:.1} lbs below)", no_neg_zero(-remaining));
        }
    }
    if progress.latest.is_none() {
        eprintln!("No weights recorded yet. Use `daybook edit --weight` or `daybook sync`.");
    }

    Ok(())
}
