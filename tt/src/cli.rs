//! CLI command definitions and subcommands

use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::debug;

use crate::domain::Product;

/// TripTrack - real-time transit trip tracker
#[derive(Debug, Parser)]
#[command(
    name = "triptrack",
    about = "Follows transit trips stop by stop and records their delays",
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, global = true, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Log level (TRACE, DEBUG, INFO, WARN, ERROR)
    #[arg(
        short = 'l',
        long = "log-level",
        global = true,
        help = "Log level (TRACE, DEBUG, INFO, WARN, ERROR)"
    )]
    pub log_level: Option<String>,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Command,
}

/// CLI subcommands
#[derive(Debug, Subcommand)]
pub enum Command {
    /// Run the worker until Ctrl+C
    Run {
        /// Also log to stderr
        #[arg(long)]
        foreground: bool,
    },

    /// Start tracking a trip (enqueues its first poll)
    Track {
        /// Trip number
        trip_number: u32,

        /// Product (Bus, Tram, UBahn, SBahn, RBahn)
        #[arg(short, long)]
        product: Product,

        /// Service date (YYYY-MM-DD), defaults to today
        #[arg(short, long)]
        date: Option<NaiveDate>,

        /// Scheduled trip start (RFC 3339)
        #[arg(long)]
        start: Option<DateTime<Utc>>,

        /// Scheduled trip end (RFC 3339)
        #[arg(long)]
        end: Option<DateTime<Utc>>,

        /// Enqueue even if the trip is already being tracked
        #[arg(long)]
        force: bool,
    },

    /// Show queue counts and trips being tracked
    Status {
        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// List recorded stops of a trip
    Stops {
        /// Trip number
        trip_number: u32,

        #[arg(short, long)]
        product: Product,

        /// Service date (YYYY-MM-DD)
        #[arg(short, long)]
        date: NaiveDate,

        /// Output format
        #[arg(short, long, default_value = "text")]
        format: OutputFormat,
    },

    /// Show recent error reports
    Errors {
        /// Number of reports to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },
}

/// Output format for status/listing commands
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

impl std::str::FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        debug!(%s, "OutputFormat::from_str: called");
        match s.to_lowercase().as_str() {
            "text" | "plain" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            _ => Err(format!("Unknown format: {}. Use text or json", s)),
        }
    }
}

/// Location of the log file
pub fn get_log_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("triptrack")
        .join("logs")
        .join("triptrack.log")
}
