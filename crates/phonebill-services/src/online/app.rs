//! Generic runner of one online application
//!
//! An [`OnlineApp`] drives a [`LoadGenerator`] on its own thread: it follows
//! the [`Schedule`] and runs every execution in a transaction, first as OCC
//! and then as an LTX declaring the generator's write set. An execution that
//! keeps failing with retriable errors is abandoned, any other error ends the
//! run loop.

use chrono::Utc;
use phonebill_core::{
    traits::{Database, Session},
    AppResult, Table, TxLabel, TxMode, TxOption,
};
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::scheduler::{Schedule, Tick};
use crate::constants::{LTX_TRY_LIMIT, OCC_TRY_LIMIT, SCHEDULER_SLEEP};
use crate::statistics::TxStatistics;
use crate::transaction::{CounterName, TransactionRunner};

/// Capabilities of one kind of online load
pub trait LoadGenerator: Send {
    /// Base of the application thread names
    fn name(&self) -> &'static str;

    /// Label of the next execution
    fn label(&self) -> TxLabel;

    /// Tables an LTX attempt declares for writing
    fn write_preserve(&self) -> &'static [Table];

    /// Read and compute the data of one execution, called again on retry
    fn create_data(&mut self, session: &mut dyn Session) -> AppResult<()>;

    /// Write the data computed by `create_data`, called again on retry
    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()>;

    /// Called after a new schedule window was built
    fn on_schedule_rebuilt(&mut self, _schedule: &[i64]) -> AppResult<()> {
        Ok(())
    }

    /// Called once the transaction of an execution committed
    fn after_commit_success(&mut self) {}
}

/// Counters of one escalation tier
struct Tier {
    mode: TxMode,
    tries: u32,
    try_counter: CounterName,
    abort_counter: CounterName,
    success_counter: CounterName,
    abandoned_counter: CounterName,
}

const TIERS: [Tier; 2] = [
    Tier {
        mode: TxMode::Occ,
        tries: OCC_TRY_LIMIT,
        try_counter: CounterName::OccTry,
        abort_counter: CounterName::OccAbort,
        success_counter: CounterName::OccSucc,
        abandoned_counter: CounterName::OccAbandonedRetry,
    },
    Tier {
        mode: TxMode::Ltx,
        tries: LTX_TRY_LIMIT,
        try_counter: CounterName::LtxTry,
        abort_counter: CounterName::LtxAbort,
        success_counter: CounterName::LtxSucc,
        abandoned_counter: CounterName::LtxAbandonedRetry,
    },
];

/// Current time in epoch milliseconds
pub fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

/// One scheduled load generator
pub struct OnlineApp {
    name: String,
    generator: Box<dyn LoadGenerator>,
    exec_per_min: i32,
    database: Arc<dyn Database>,
    runner: TransactionRunner,
    statistics: Arc<TxStatistics>,
    terminate: Arc<AtomicBool>,
    rng: StdRng,
    skip_database_access: bool,
    exec_count: u64,
    abandoned_count: u64,
}

impl OnlineApp {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        number: usize,
        generator: Box<dyn LoadGenerator>,
        exec_per_min: i32,
        database: Arc<dyn Database>,
        runner: TransactionRunner,
        statistics: Arc<TxStatistics>,
        rng: StdRng,
        skip_database_access: bool,
    ) -> Self {
        Self {
            name: format!("{}-{:03}", generator.name(), number),
            generator,
            exec_per_min,
            database,
            runner,
            statistics,
            terminate: Arc::new(AtomicBool::new(false)),
            rng,
            skip_database_access,
            exec_count: 0,
            abandoned_count: 0,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exec_per_min(&self) -> i32 {
        self.exec_per_min
    }

    /// Flag that stops the run loop once set
    pub fn terminate_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.terminate)
    }

    pub(crate) fn set_terminate_flag(&mut self, terminate: Arc<AtomicBool>) {
        self.terminate = terminate;
    }

    /// Follow the schedule until terminated
    ///
    /// Returns right away when the rate is 0.
    #[instrument(skip(self), fields(app = %self.name))]
    pub fn run(mut self) -> AppResult<()> {
        if self.exec_per_min == 0 {
            return Ok(());
        }
        info!("{} started", self.name);
        let mut session = self.database.open_session()?;
        let mut schedule = Schedule::new(self.exec_per_min, now_millis());
        while !self.terminate.load(Ordering::SeqCst) {
            match schedule.poll(now_millis(), &mut self.rng) {
                Tick::Sleep => thread::sleep(SCHEDULER_SLEEP),
                Tick::Execute => {
                    self.execute_once(session.as_mut())?;
                }
                Tick::Rebuilt => {
                    let times: Vec<i64> = schedule.pending().collect();
                    self.generator.on_schedule_rebuilt(&times)?;
                }
            }
        }
        session.close()?;
        info!(
            "{} terminated, executions = {}, abandoned = {}",
            self.name, self.exec_count, self.abandoned_count
        );
        Ok(())
    }

    /// Run one execution with OCC then LTX retries
    ///
    /// Returns false when every attempt failed with a retriable error.
    pub fn execute_once(&mut self, session: &mut dyn Session) -> AppResult<bool> {
        let label = self.generator.label();
        let write_preserve = self.generator.write_preserve();
        let counters = Arc::clone(self.runner.counters());
        let skip = self.skip_database_access;
        let started = Instant::now();

        for tier in &TIERS {
            let option = TxOption::of_mode(tier.mode, 0, label, write_preserve);
            for attempt in 1..=tier.tries {
                if self.terminate.load(Ordering::SeqCst) && attempt > 1 {
                    debug!("{} stops retrying on terminate request", self.name);
                    return Ok(false);
                }
                counters.increment(label, tier.try_counter);
                let generator = &mut self.generator;
                let result = self.runner.try_once(session, &option, &mut |s: &mut dyn Session| {
                    generator.create_data(s)?;
                    if !skip {
                        generator.update_database(s)?;
                    }
                    Ok(())
                });
                match result {
                    Ok(()) => {
                        counters.increment(label, tier.success_counter);
                        self.statistics.add_latency(label, started.elapsed());
                        self.generator.after_commit_success();
                        self.exec_count += 1;
                        return Ok(true);
                    }
                    Err(e) if e.is_retriable() => {
                        counters.increment(label, tier.abort_counter);
                        debug!("{} attempt {} of {} failed: {}", self.name, attempt, option, e);
                    }
                    Err(e) => return Err(e),
                }
            }
            counters.increment(label, tier.abandoned_counter);
        }
        warn!("{} abandoned an execution of {}", self.name, label);
        self.abandoned_count += 1;
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::TxCounters;
    use phonebill_core::AppError;
    use phonebill_db::MemoryDatabase;
    use rand::SeedableRng;

    /// Fails every write with the given error
    struct FailingGenerator {
        retriable: bool,
        created: u32,
        committed: u32,
    }

    impl LoadGenerator for FailingGenerator {
        fn name(&self) -> &'static str {
            "Failing"
        }

        fn label(&self) -> TxLabel {
            TxLabel::OnlineMasterUpdate
        }

        fn write_preserve(&self) -> &'static [Table] {
            &[Table::Contracts]
        }

        fn create_data(&mut self, _session: &mut dyn Session) -> AppResult<()> {
            self.created += 1;
            Ok(())
        }

        fn update_database(&mut self, _session: &mut dyn Session) -> AppResult<()> {
            if self.retriable {
                Err(AppError::SerializationFailure("conflict".to_string()))
            } else {
                Err(AppError::Database("broken".to_string()))
            }
        }

        fn after_commit_success(&mut self) {
            self.committed += 1;
        }
    }

    fn app(retriable: bool, skip: bool) -> (OnlineApp, Arc<TxCounters>) {
        let counters = Arc::new(TxCounters::new());
        let app = OnlineApp::new(
            0,
            Box::new(FailingGenerator {
                retriable,
                created: 0,
                committed: 0,
            }),
            60,
            Arc::new(MemoryDatabase::new()),
            TransactionRunner::new(Arc::clone(&counters)),
            Arc::new(TxStatistics::new()),
            StdRng::seed_from_u64(0),
            skip,
        );
        (app, counters)
    }

    #[test]
    fn test_escalation_then_abandon() {
        let (mut app, counters) = app(true, false);
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();

        assert!(!app.execute_once(session.as_mut()).unwrap());

        let label = TxLabel::OnlineMasterUpdate;
        assert_eq!(counters.get(label, CounterName::OccTry), 3);
        assert_eq!(counters.get(label, CounterName::OccAbort), 3);
        assert_eq!(counters.get(label, CounterName::LtxTry), 3);
        assert_eq!(counters.get(label, CounterName::LtxAbort), 3);
        assert_eq!(counters.get(label, CounterName::LtxAbandonedRetry), 1);
        assert_eq!(counters.get(label, CounterName::OccSucc), 0);
        assert_eq!(counters.get(label, CounterName::LtxSucc), 0);
        assert_eq!(app.abandoned_count, 1);
    }

    #[test]
    fn test_fatal_error_propagates() {
        let (mut app, counters) = app(false, false);
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();

        let err = app.execute_once(session.as_mut()).unwrap_err();
        assert!(matches!(err, AppError::Database(_)));
        assert_eq!(counters.get(TxLabel::OnlineMasterUpdate, CounterName::OccTry), 1);
        assert_eq!(counters.get(TxLabel::OnlineMasterUpdate, CounterName::LtxTry), 0);
    }

    #[test]
    fn test_skip_database_access_commits_without_writing() {
        let (mut app, counters) = app(true, true);
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();

        assert!(app.execute_once(session.as_mut()).unwrap());
        assert_eq!(counters.get(TxLabel::OnlineMasterUpdate, CounterName::OccSucc), 1);
        assert_eq!(app.exec_count, 1);
    }

    #[test]
    fn test_zero_rate_returns_immediately() {
        let (app, _) = app(true, false);
        let app = OnlineApp {
            exec_per_min: 0,
            ..app
        };
        assert!(app.run().is_ok());
    }

    #[test]
    fn test_run_stops_on_terminate() {
        let (app, _) = app(true, false);
        let terminate = app.terminate_flag();
        let handle = thread::spawn(move || app.run());
        thread::sleep(std::time::Duration::from_millis(50));
        terminate.store(true, Ordering::SeqCst);
        assert!(handle.join().unwrap().is_ok());
    }
}
