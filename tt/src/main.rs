//! TripTrack - real-time transit trip tracker
//!
//! CLI entry point for running the worker and inspecting tracked trips.

use std::fs;
use std::sync::Arc;

use clap::Parser;
use colored::Colorize;
use eyre::{Context, Result};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};

use triptrack::cli::{Cli, Command, OutputFormat, get_log_path};
use triptrack::config::Config;
use triptrack::domain::{LastStopSnapshot, Product, TRIP_QUEUE, TripIdentity, TripJob};
use triptrack::provider::VagTripProvider;
use triptrack::scheduler::Worker;
use triptrack::state::StateManager;
use triptrack::tracker::{Rescheduler, TrackerPorts, TripTracker};

fn setup_logging(cli_log_level: Option<&str>, config_log_level: Option<&str>, foreground: bool) -> Result<()> {
    // Note: Can't log params here since logging isn't initialized yet
    let log_path = get_log_path();
    if let Some(log_dir) = log_path.parent() {
        fs::create_dir_all(log_dir).context("Failed to create log directory")?;
    }

    // Priority: CLI --log-level > config file > default (INFO)
    let level = match cli_log_level.or(config_log_level) {
        Some(s) => match s.to_uppercase().as_str() {
            "TRACE" => tracing::Level::TRACE,
            "DEBUG" => tracing::Level::DEBUG,
            "INFO" => tracing::Level::INFO,
            "WARN" | "WARNING" => tracing::Level::WARN,
            "ERROR" => tracing::Level::ERROR,
            _ => {
                eprintln!("Warning: Unknown log-level '{}', defaulting to INFO", s);
                tracing::Level::INFO
            }
        },
        None => tracing::Level::INFO,
    };

    let log_file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)
        .context("Failed to open log file")?;
    let writer = if foreground {
        BoxMakeWriter::new(log_file.and(std::io::stderr))
    } else {
        BoxMakeWriter::new(log_file)
    };

    tracing_subscriber::fmt()
        .with_writer(writer)
        .with_ansi(false)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env().add_directive(level.into()))
        .init();

    info!("Logging initialized (level: {:?})", level);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Load log level from config file early (before full config load)
    let config_log_level = Config::load_log_level(cli.config.as_ref());
    let foreground = matches!(cli.command, Command::Run { foreground: true });
    setup_logging(cli.log_level.as_deref(), config_log_level.as_deref(), foreground)
        .context("Failed to setup logging")?;

    let config = Config::load(cli.config.as_ref()).context("Failed to load configuration")?;
    config.validate().context("Invalid configuration")?;

    let db_path = config.storage.db_path();
    info!(db_path = %db_path.display(), "TripTrack loaded config");
    let state = StateManager::spawn(&db_path).context(format!("Failed to open store at {}", db_path.display()))?;

    debug!(command = ?cli.command, "main: dispatching command");
    let result = match cli.command {
        Command::Run { .. } => cmd_run(&config, state.clone()).await,
        Command::Track {
            trip_number,
            product,
            date,
            start,
            end,
            force,
        } => {
            let service_date = date.unwrap_or_else(|| chrono::Local::now().date_naive());
            let trip = TripIdentity {
                trip_number,
                service_date,
                product,
            };
            cmd_track(&state, trip, start, end, force).await
        }
        Command::Status { format } => cmd_status(&state, format).await,
        Command::Stops {
            trip_number,
            product,
            date,
            format,
        } => cmd_stops(&state, trip_number, product, date, format).await,
        Command::Errors { limit } => cmd_errors(&state, limit).await,
    };

    if let Err(e) = state.shutdown().await {
        debug!(error = %e, "main: state manager already stopped");
    }
    result
}

async fn cmd_run(config: &Config, state: StateManager) -> Result<()> {
    debug!("cmd_run: called");
    let provider = VagTripProvider::from_config(&config.provider).context("Failed to create provider client")?;
    let ports = TrackerPorts::with_backend(Arc::new(provider), Arc::new(state.clone()));
    let rescheduler = Rescheduler::new(config.tracking.poll_buffer(), config.tracking.fallback_poll());
    let tracker = TripTracker::new(ports, rescheduler);
    let mut worker = Worker::new(config.worker.clone(), state, tracker);

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("SIGINT received");
                let _ = shutdown_tx.send(()).await;
            }
            Err(e) => warn!(error = %e, "Failed to listen for Ctrl+C"),
        }
    });

    println!("{} worker started (Ctrl+C to stop)", "triptrack".bold());
    let stats = worker.run(shutdown_rx).await?;
    println!(
        "Stopped: {} completed, {} retried, {} failed, {} parked",
        stats.completed.to_string().green(),
        stats.retried.to_string().yellow(),
        stats.failed.to_string().red(),
        stats.parked.to_string().yellow()
    );
    Ok(())
}

async fn cmd_track(
    state: &StateManager,
    trip: TripIdentity,
    start: Option<chrono::DateTime<chrono::Utc>>,
    end: Option<chrono::DateTime<chrono::Utc>>,
    force: bool,
) -> Result<()> {
    debug!(%trip, force, "cmd_track: called");
    // A second first poll would start a second chain of polls for the same trip
    if !force {
        if state.get_tracking_key(trip.trip_number).await?.is_some() {
            eyre::bail!("Trip {} is already being tracked (use --force to enqueue anyway)", trip);
        }
        if let Some(id) = state.pending_trip_job(&trip).await? {
            eyre::bail!("Trip {} already has a queued poll {} (use --force to enqueue anyway)", trip, id);
        }
    } else {
        warn!(%trip, "Skipping duplicate tracking check");
    }

    let job = TripJob::new(trip, start, end);
    let payload = serde_json::to_string(&job).context("Failed to serialize job")?;
    let id = state.enqueue_job(TRIP_QUEUE, payload, tripstore::now_ms()).await?;

    info!(%trip, %id, "Trip enqueued");
    println!("{} {} ({})", "Tracking".green(), trip, id.dimmed());
    Ok(())
}

async fn cmd_status(state: &StateManager, format: OutputFormat) -> Result<()> {
    debug!(?format, "cmd_status: called");
    let counts = state.job_counts(TRIP_QUEUE).await?;
    let keys = state.list_tracking_keys().await?;

    let trips: Vec<(u32, Option<LastStopSnapshot>)> = keys
        .into_iter()
        .map(|key| {
            let snapshot = serde_json::from_str(&key.payload)
                .inspect_err(|e| warn!(trip_number = key.trip_number, error = %e, "Unreadable tracking key"))
                .ok();
            (key.trip_number, snapshot)
        })
        .collect();

    match format {
        OutputFormat::Json => {
            let trips: Vec<_> = trips
                .iter()
                .map(|(trip_number, snapshot)| serde_json::json!({ "trip_number": trip_number, "last_stop": snapshot }))
                .collect();
            let body = serde_json::json!({ "jobs": counts, "trips": trips });
            println!("{}", serde_json::to_string_pretty(&body)?);
        }
        OutputFormat::Text => {
            println!("{} ({})", "Jobs".bold(), counts.total());
            println!("  waiting:   {}", counts.waiting);
            println!("  active:    {}", counts.active.to_string().cyan());
            println!("  completed: {}", counts.completed.to_string().green());
            println!("  failed:    {}", counts.failed.to_string().red());
            println!("  parked:    {}", counts.parked.to_string().yellow());
            println!("{} ({})", "Tracked trips".bold(), trips.len());
            for (trip_number, snapshot) in &trips {
                match snapshot {
                    Some(s) => {
                        let progress = s
                            .progress_to_next_stop
                            .map(|p| format!("{:.0}%", p * 100.0))
                            .unwrap_or_else(|| "-".to_string());
                        println!(
                            "  {} {} {} last stop {} ({}), {} to next",
                            trip_number.to_string().bold(),
                            s.product,
                            s.line_name,
                            s.stop_name,
                            s.stop_code,
                            progress
                        );
                    }
                    None => println!("  {} {}", trip_number.to_string().bold(), "(unreadable)".dimmed()),
                }
            }
        }
    }
    Ok(())
}

fn format_delay(secs: i64) -> String {
    let text = format!("{:+}s", secs);
    if secs >= 60 {
        text.red().to_string()
    } else if secs > 0 {
        text.yellow().to_string()
    } else {
        text.green().to_string()
    }
}

async fn cmd_stops(
    state: &StateManager,
    trip_number: u32,
    product: Product,
    date: chrono::NaiveDate,
    format: OutputFormat,
) -> Result<()> {
    debug!(trip_number, %product, %date, "cmd_stops: called");
    let records = state.list_trip_stops(trip_number, date, product.as_str()).await?;

    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&records)?),
        OutputFormat::Text => {
            if records.is_empty() {
                println!("No stops recorded for trip {} ({}, {})", trip_number, product, date);
                return Ok(());
            }
            for record in &records {
                let scheduled = record
                    .scheduled_departure
                    .or(record.scheduled_arrival)
                    .map(|t| t.with_timezone(&chrono::Local).format("%H:%M").to_string())
                    .unwrap_or_else(|| "--:--".to_string());
                println!(
                    "{}  {:<10} arr {}  dep {}",
                    scheduled,
                    record.stop_code,
                    format_delay(record.arrival_delay_secs),
                    format_delay(record.departure_delay_secs)
                );
            }
        }
    }
    Ok(())
}

async fn cmd_errors(state: &StateManager, limit: usize) -> Result<()> {
    debug!(limit, "cmd_errors: called");
    let reports = state.list_errors(limit).await?;
    if reports.is_empty() {
        println!("No errors reported");
    }
    for report in reports {
        let at = chrono::DateTime::from_timestamp_millis(report.reported_at)
            .map(|t| t.to_rfc3339())
            .unwrap_or_default();
        println!("{} {}", at.dimmed(), report.message.red());
        println!("    {}", report.context);
    }
    Ok(())
}
