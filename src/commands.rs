//! Command implementations

use anyhow::Context as _;
use phonebill_core::{config::TransactionScope, traits::Database, AppConfig};
use phonebill_services::constants::GENERATOR_STOP_TIMEOUT;
use phonebill_services::{
    create_online_apps, create_test_data, BatchOrchestrator, OnlineApps, TransactionRunner,
    TxCounters, TxStatistics,
};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, instrument};

/// Thread counts swept by `thread-bench`
const BENCH_THREAD_COUNTS: [usize; 4] = [1, 2, 4, 6];

/// Transaction scopes swept by `thread-bench`
const BENCH_SCOPES: [TransactionScope; 2] = [TransactionScope::Contract, TransactionScope::Whole];

/// Everything a command runs with
pub struct Context {
    config: AppConfig,
    database: Arc<dyn Database>,
    counters: Arc<TxCounters>,
    runner: TransactionRunner,
    statistics: Arc<TxStatistics>,
}

impl Context {
    pub fn new(config: AppConfig) -> anyhow::Result<Self> {
        let database =
            phonebill_db::connect(&config.database).context("connecting to the database")?;
        let counters = Arc::new(TxCounters::new());
        Ok(Self {
            config,
            database,
            runner: TransactionRunner::new(Arc::clone(&counters)),
            counters,
            statistics: Arc::new(TxStatistics::new()),
        })
    }

    pub fn create_table(&self) -> anyhow::Result<()> {
        self.database.create_tables()?;
        info!("Tables created on {}", self.database.name());
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn create_test_data(&self) -> anyhow::Result<()> {
        self.database.create_tables()?;
        let summary = create_test_data(
            self.database.as_ref(),
            &self.runner,
            &self.config.test_data,
            self.config.random_seed,
        )?;
        info!(
            "Test data created: {} contracts, {} histories",
            summary.contracts, summary.histories
        );
        Ok(())
    }

    fn online_apps(&self) -> anyhow::Result<OnlineApps> {
        let apps = create_online_apps(
            &self.config,
            Arc::clone(&self.database),
            &self.runner,
            Arc::clone(&self.statistics),
        )?;
        Ok(apps)
    }

    #[instrument(skip(self))]
    pub fn phone_bill(&self) -> anyhow::Result<()> {
        let orchestrator = BatchOrchestrator::new(
            Arc::clone(&self.database),
            self.config.batch.clone(),
            self.runner.clone(),
            Arc::clone(&self.statistics),
        );
        let started = Instant::now();
        let result = if self.config.online.has_online_app() {
            orchestrator.run_with_online_apps(self.online_apps()?)
        } else {
            orchestrator.run()
        };
        self.statistics.set_dedicated_time(started.elapsed());
        let result = result?;
        info!(
            "Batch {} billed {} contracts in {:.3} sec",
            result.batch_exec_id,
            result.contracts,
            result.elapsed.as_secs_f64()
        );
        Ok(())
    }

    #[instrument(skip(self))]
    pub fn online_app(&self) -> anyhow::Result<()> {
        let apps = self.online_apps()?;
        if apps.is_empty() {
            info!("No online application configured");
            return Ok(());
        }
        let limit = self.config.online.exec_time_limit_secs;
        let started = Instant::now();
        let running = apps.start()?;
        if limit == 0 {
            info!("Running online applications until interrupted");
            loop {
                thread::park();
            }
        }
        thread::sleep(Duration::from_secs(limit));
        running.terminate_and_wait(GENERATOR_STOP_TIMEOUT);
        self.statistics.set_dedicated_time(started.elapsed());
        Ok(())
    }

    /// One batch per thread count and scope, each worker with its own session
    #[instrument(skip(self))]
    pub fn thread_bench(&self) -> anyhow::Result<()> {
        for threads in BENCH_THREAD_COUNTS {
            for scope in BENCH_SCOPES {
                let mut config = self.config.batch.clone();
                config.thread_count = threads;
                config.transaction_scope = scope;
                config.shared_connection = false;

                self.counters.reset();
                self.statistics.clear();
                let orchestrator = BatchOrchestrator::new(
                    Arc::clone(&self.database),
                    config,
                    self.runner.clone(),
                    Arc::clone(&self.statistics),
                );
                let result = orchestrator.run()?;
                self.statistics.set_dedicated_time(result.elapsed);
                println!(
                    "threads = {}, scope = {:?}, contracts = {}, elapsed = {:.3} sec",
                    threads,
                    scope,
                    result.contracts,
                    result.elapsed.as_secs_f64()
                );
            }
        }
        Ok(())
    }

    /// Log the transaction counters and latency statistics of the command
    pub fn log_reports(&self) {
        info!("Transaction counters:\n{}", self.counters.report());
        info!("Transaction statistics:\n{}", self.statistics.report());
    }
}
