//! Phone Bill Benchmark
//!
//! Command line driver for the billing batch and its online load.
//! Configuration comes from `config/*.toml`, an explicit `--config` file and
//! `PHONEBILL_` environment variables.

mod commands;

use anyhow::Context as _;
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use phonebill_core::AppConfig;
use std::env;
use std::time::Instant;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use commands::Context;

#[derive(Debug, Parser)]
#[command(name = "phonebill", version, about = "Phone bill batch benchmark")]
struct Cli {
    /// Configuration file, replaces config/default.toml
    #[arg(short, long, global = true)]
    config: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Drop and create the benchmark tables
    CreateTable,
    /// Recreate the tables and fill them with test data
    CreateTestData,
    /// Run the billing batch, with the online load when configured
    PhoneBill {
        /// Any day of the month to bill
        #[arg(long)]
        target_month: Option<NaiveDate>,
        /// Number of calculation workers
        #[arg(long)]
        threads: Option<usize>,
    },
    /// Run the online load only
    OnlineApp {
        /// Seconds to run, 0 runs until interrupted
        #[arg(long)]
        time_limit: Option<u64>,
    },
    /// Run the batch for several thread counts and transaction scopes
    ThreadBench,
}

/// Initialize tracing/logging
fn init_tracing() {
    let log_level = env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "phonebill={},phonebill_services={},phonebill_db={},phonebill_core={},sqlx=warn",
            log_level, log_level, log_level, log_level
        ))
    });

    let json = env::var("LOG_FORMAT").map(|f| f == "json").unwrap_or(false);
    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry
            .with(fmt::layer().json().with_thread_names(true).with_target(true))
            .init();
    } else {
        registry
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_names(true)
                    .with_line_number(true),
            )
            .init();
    }
}

fn load_config(cli: &Cli) -> anyhow::Result<AppConfig> {
    let config = match &cli.config {
        Some(path) => AppConfig::from_file(path).with_context(|| format!("loading {}", path))?,
        None => AppConfig::load().context("loading configuration")?,
    };
    Ok(config)
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;
    if let Command::PhoneBill {
        target_month,
        threads,
    } = &cli.command
    {
        if let Some(month) = target_month {
            config.batch.target_month = *month;
        }
        if let Some(threads) = threads {
            config.batch.thread_count = *threads;
        }
    }
    if let Command::OnlineApp {
        time_limit: Some(secs),
    } = &cli.command
    {
        config.online.exec_time_limit_secs = *secs;
    }
    config.validate()?;

    let ctx = Context::new(config)?;
    let started = Instant::now();
    match cli.command {
        Command::CreateTable => ctx.create_table()?,
        Command::CreateTestData => ctx.create_test_data()?,
        Command::PhoneBill { .. } => ctx.phone_bill()?,
        Command::OnlineApp { .. } => ctx.online_app()?,
        Command::ThreadBench => ctx.thread_bench()?,
    }
    info!("Elapsed time = {:.3} sec", started.elapsed().as_secs_f64());
    ctx.log_reports();
    Ok(())
}

fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    init_tracing();

    let cli = Cli::parse();
    info!("Starting phonebill v{}", env!("CARGO_PKG_VERSION"));

    run(cli).inspect_err(|e| error!("Command failed: {:#}", e))
}
