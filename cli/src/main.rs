mod commands;
mod config;
mod server;

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use crate::commands::{
    EditArgs, cmd_backfill, cmd_delete, cmd_edit, cmd_import_readings, cmd_list, cmd_recompute,
    cmd_show, cmd_sync, cmd_week, cmd_weight_initial, cmd_weight_progress, cmd_weight_target,
};
use crate::config::Config;
use daybook_core::provider::SampleFileProvider;
use daybook_core::service::DaybookService;

#[derive(Parser)]
#[command(
    name = "daybook",
    version,
    about = "A local-first daily health journal",
    long_about = "A local-first daily health journal.\n\n\
        Steps, glucose, sleep, heart rate and weight are filled in from an exported \
        health sample file. Anything you enter by hand is kept as-is by later syncs."
)]
struct Cli {
    /// Health sample file (JSON) to sync from [default: health_samples.json in the data directory]
    #[arg(long, global = true)]
    samples: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the record for a day (default: today)
    Show {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow)
        date: Option<String>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// List records, newest first
    List {
        /// Number of records to show (default: all)
        #[arg(short, long)]
        days: Option<u32>,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create or update a day's record
    Edit {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        #[command(flatten)]
        fields: EditArgs,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete a day's record
    Delete {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow)
        date: String,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Fill a day's record from health data
    Sync {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Replace values already on the record, including manual ones
        #[arg(long)]
        overwrite: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create records for every missing day up to today
    Backfill {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the 7-day step total ending on a day
    Week {
        /// Date (YYYY-MM-DD or today/yesterday/tomorrow, default: today)
        date: Option<String>,
        /// Sum steps from health data instead of the journal
        #[arg(long)]
        live: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Recompute the stored 7-day step totals of every record
    Recompute {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Import data from other apps
    Import {
        #[command(subcommand)]
        command: ImportCommands,
    },
    /// Weight goal and progress
    Weight {
        #[command(subcommand)]
        command: WeightCommands,
    },
    /// Start the JSON API server
    Serve {
        /// Port to listen on
        #[arg(short, long, default_value = "8080")]
        port: u16,
        /// Address to bind to
        #[arg(short, long, default_value = "127.0.0.1")]
        bind: String,
        /// Disable API key authentication
        #[arg(long)]
        no_auth: bool,
    },
}

#[derive(Subcommand)]
enum ImportCommands {
    /// Import blood glucose and ketone readings from a meter CSV export
    Readings {
        /// Path to the semicolon-separated CSV file
        file: PathBuf,
        /// Preview what would be imported without making changes
        #[arg(long)]
        dry_run: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Subcommand)]
enum WeightCommands {
    /// Set, clear or show the target weight
    Target {
        /// Target weight in lbs (omit to show progress)
        value: Option<f64>,
        /// Remove the target
        #[arg(long, conflicts_with = "value")]
        clear: bool,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Set the starting weight progress is measured from
    Initial {
        /// Starting weight in lbs
        value: f64,
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show progress towards the target weight
    Progress {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_env("DAYBOOK_LOG")
                .unwrap_or_else(|_| "warn".into()),
        )
        .with_writer(std::io::stderr)
        .init();
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        eprintln!("Error: {e:#}");
        process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = Config::load(cli.samples)?;
    let provider = Arc::new(SampleFileProvider::new(&config.samples_path));
    let service = DaybookService::new(&config.db_path, provider)?;

    match cli.command {
        Commands::Show { date, json } => cmd_show(&service, date, json),
        Commands::List { days, json } => cmd_list(&service, days, json),
        Commands::Edit { date, fields, json } => cmd_edit(&service, date, fields, json).await,
        Commands::Delete { date, json } => cmd_delete(&service, &date, json),
        Commands::Sync {
            date,
            overwrite,
            json,
        } => cmd_sync(&service, date, overwrite, json).await,
        Commands::Backfill { json } => cmd_backfill(&service, json).await,
        Commands::Week { date, live, json } => cmd_week(&service, date, live, json).await,
        Commands::Recompute { json } => cmd_recompute(&service, json),
        Commands::Import { command } => match command {
            ImportCommands::Readings {
                file,
                dry_run,
                json,
            } => cmd_import_readings(&service, &file, dry_run, json).await,
        },
        Commands::Weight { command } => match command {
            WeightCommands::Target { value, clear, json } => {
                cmd_weight_target(&service, value, clear, json)
            }
            WeightCommands::Initial { value, json } => cmd_weight_initial(&service, value, json),
            WeightCommands::Progress { json } => cmd_weight_progress(&service, json),
        },
        Commands::Serve {
            port,
            bind,
            no_auth,
        } => {
            let api_key = if no_auth {
                None
            } else {
                Some(config.load_or_create_api_key()?.0)
            };
            server::start_server(service, port, &bind, api_key).await
        }
    }
}
