//! Seatbook: concurrent seat allocation for scheduled trips.
//!
//! Main entry point: parses the command line, loads configuration, sets up
//! logging and runs the requested command.

mod output;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::{EnvFilter, fmt};

use seatbook_core::config::{AppConfig, BookingConfig, SeatLayout};
use seatbook_core::error::AppError;
use seatbook_core::types::{IsolationLevel, LockStrategy};
use seatbook_database::{MemoryStore, PgConnector};
use seatbook_engine::AllocationOrchestrator;

use crate::output::OutputFormat;

/// Seatbook command line.
#[derive(Debug, Parser)]
#[command(name = "seatbook", version, about = "Concurrent seat allocation for scheduled trips")]
struct Cli {
    /// Base configuration file (without extension).
    #[arg(long, global = true)]
    config: Option<String>,

    /// Environment overlay loaded from `config/<env>`.
    #[arg(long, global = true)]
    env: Option<String>,

    /// Output format
    #[arg(long, value_enum, default_value_t = OutputFormat::Table, global = true)]
    format: OutputFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Claim the next unclaimed trip and book a seat for every passenger
    Book(BookArgs),
    /// Apply pending database migrations
    Migrate,
}

#[derive(Debug, Args)]
struct BookArgs {
    /// Seat selection lock strategy
    #[arg(long)]
    strategy: Option<LockStrategy>,

    /// Transaction isolation level
    #[arg(long)]
    isolation: Option<IsolationLevel>,

    /// Number of pooled store connections
    #[arg(long)]
    pool_size: Option<usize>,

    /// Attempts per passenger
    #[arg(long)]
    retries: Option<u32>,

    /// Run deadline in seconds
    #[arg(long)]
    deadline: Option<u64>,

    /// Store to book against
    #[arg(long, value_enum, default_value_t = StoreKind::Postgres)]
    store: StoreKind,

    /// Passengers seeded into the in-memory store
    #[arg(long, default_value_t = 150)]
    passengers: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StoreKind {
    /// PostgreSQL from the `database` section
    Postgres,
    /// Seeded in-memory store with one trip
    Memory,
}

impl BookArgs {
    /// Apply command line overrides to the loaded booking section.
    fn apply(&self, booking: &mut BookingConfig) -> Result<(), AppError> {
        if let Some(strategy) = self.strategy {
            booking.lock_strategy = strategy;
        }
        if let Some(isolation) = self.isolation {
            booking.isolation_level = isolation;
        }
        if let Some(pool_size) = self.pool_size {
            booking.pool_capacity = pool_size;
        }
        if let Some(retries) = self.retries {
            booking.max_retries = retries;
        }
        if let Some(deadline) = self.deadline {
            booking.run_deadline_seconds = deadline;
        }
        booking.validate()
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match load_configuration(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    init_logging(&config);

    if let Err(e) = run(cli, config).await {
        tracing::error!("Seatbook error: {}", e);
        output::print_error(&e.to_string());
        std::process::exit(1);
    }
}

/// Load configuration from file and environment
fn load_configuration(cli: &Cli) -> Result<AppConfig, AppError> {
    let config_path = cli
        .config
        .clone()
        .or_else(|| std::env::var("SEATBOOK_CONFIG").ok())
        .unwrap_or_else(|| "config/default".to_string());

    let env = cli
        .env
        .clone()
        .or_else(|| std::env::var("SEATBOOK_ENV").ok())
        .unwrap_or_else(|| "development".to_string());

    AppConfig::load(&config_path, &env)
}

/// Initialize tracing/logging
fn init_logging(config: &AppConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.logging.level));

    match config.logging.format.as_str() {
        "json" => {
            fmt()
                .json()
                .with_env_filter(filter)
                .with_target(true)
                .with_thread_ids(true)
                .with_writer(std::io::stderr)
                .init();
        }
        _ => {
            fmt()
                .pretty()
                .with_env_filter(filter)
                .with_target(true)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

async fn run(cli: Cli, mut config: AppConfig) -> Result<(), AppError> {
    tracing::info!("Starting seatbook v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Command::Migrate => {
            seatbook_database::migration::migrate(&config.database).await?;
            output::print_success("Database migrations applied");
        }
        Command::Book(args) => {
            args.apply(&mut config.booking)?;

            let report = match args.store {
                StoreKind::Postgres => {
                    let connector = PgConnector::new(&config.database)?;
                    AllocationOrchestrator::new(connector, config.booking)
                        .run()
                        .await?
                }
                StoreKind::Memory => {
                    let store = seed_memory_store(&config.booking.layout, args.passengers);
                    AllocationOrchestrator::new(store, config.booking)
                        .run()
                        .await?
                }
            };

            output::print_report(&report, cli.format)?;
        }
    }

    Ok(())
}

/// One trip filling the configured layout plus `passengers` passengers.
fn seed_memory_store(layout: &SeatLayout, passengers: usize) -> MemoryStore {
    let store = MemoryStore::new();
    store.add_trip("DEMO-1", layout.rows, layout.seats_per_row);
    for n in 1..=passengers {
        store.add_passenger(format!("Passenger {n}"));
    }
    tracing::info!(
        seats = layout.capacity(),
        passengers,
        "Seeded in-memory store"
    );
    store
}
