//! Billing batch orchestration
//!
//! Builds the work queue from the contracts of the target month, runs the
//! calculation workers on their own threads and settles every session at the
//! end: all of them commit when no worker failed, otherwise all of them roll
//! back.

use parking_lot::Mutex;
use phonebill_core::{
    config::{BatchConfig, TransactionScope},
    models::BillingPeriod,
    traits::Database,
    AppError, AppResult, Table, TxLabel, TxOption,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::calculator::{SimpleBillingCalculator, SimpleCallChargeCalculator};
use super::queue::{CalculationTarget, WorkItem, WorkQueue};
use super::worker::{CalculationWorker, SharedSession};
use crate::constants::{GENERATOR_STOP_TIMEOUT, WORKER_POLL_INTERVAL};
use crate::online::OnlineApps;
use crate::statistics::TxStatistics;
use crate::transaction::{CounterName, TransactionRunner};

/// Outcome of a successful batch run
#[derive(Debug, Clone)]
pub struct BatchResult {
    pub batch_exec_id: String,
    pub contracts: usize,
    pub elapsed: Duration,
}

type WorkerHandle = (String, JoinHandle<AppResult<usize>>);

/// Runs the billing batch
pub struct BatchOrchestrator {
    database: Arc<dyn Database>,
    config: BatchConfig,
    runner: TransactionRunner,
    statistics: Arc<TxStatistics>,
    abort: Arc<AtomicBool>,
}

impl BatchOrchestrator {
    pub fn new(
        database: Arc<dyn Database>,
        config: BatchConfig,
        runner: TransactionRunner,
        statistics: Arc<TxStatistics>,
    ) -> Self {
        Self {
            database,
            config,
            runner,
            statistics,
            abort: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Request every worker of the running batch to stop
    pub fn abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Run the batch while the given online applications load the database
    pub fn run_with_online_apps(&self, apps: OnlineApps) -> AppResult<BatchResult> {
        let running = apps.start()?;
        let result = self.run();
        running.terminate_and_wait(GENERATOR_STOP_TIMEOUT);
        result
    }

    /// Run the batch once
    ///
    /// Returns the first error reported by the queue producer or any worker.
    #[instrument(
        skip(self),
        fields(month = %self.config.target_month, threads = self.config.thread_count)
    )]
    pub fn run(&self) -> AppResult<BatchResult> {
        if self.config.transaction_scope == TransactionScope::Contract
            && self.config.shared_connection
        {
            return Err(AppError::Config(
                "transaction scope CONTRACT cannot run on a shared connection".to_string(),
            ));
        }
        self.abort.store(false, Ordering::SeqCst);
        info!("Phone bill batch started");
        let batch_exec_id = Uuid::new_v4().to_string();
        let started = Instant::now();

        let mut sessions: Vec<SharedSession> = Vec::new();
        let outcome = self.execute(&batch_exec_id, &mut sessions);
        let settled = self.settle(&sessions, outcome.is_ok());

        let elapsed = started.elapsed();
        let contracts = outcome?;
        settled?;
        if self.config.transaction_scope == TransactionScope::Whole {
            self.statistics.add_latency(TxLabel::BatchMain, elapsed);
        }
        info!("Billings calculated in {:.3} sec", elapsed.as_secs_f64());
        Ok(BatchResult {
            batch_exec_id,
            contracts,
            elapsed,
        })
    }

    fn tx_option(&self) -> TxOption {
        TxOption::of_mode(
            self.config.transaction_option,
            0,
            TxLabel::BatchMain,
            &[Table::History, Table::Billing],
        )
    }

    fn begin_whole(&self, session: &SharedSession, option: &TxOption) -> AppResult<()> {
        self.runner.counters().increment(option.label, CounterName::BeginTx);
        session.lock().begin(option)
    }

    fn execute(&self, batch_exec_id: &str, sessions: &mut Vec<SharedSession>) -> AppResult<usize> {
        let period = BillingPeriod::of_month(self.config.target_month)?;
        let thread_count = self.config.thread_count;
        let scope = self.config.transaction_scope;
        let tx_option = self.tx_option();
        let queue = Arc::new(WorkQueue::for_workers(thread_count));

        let main: SharedSession = Arc::new(Mutex::new(self.database.open_session()?));
        sessions.push(Arc::clone(&main));
        if scope == TransactionScope::Whole {
            self.begin_whole(&main, &tx_option)?;
        }
        let deleted = main.lock().billings().delete_by_month(period.start)?;
        info!("Deleted {} billing rows of {}", deleted, period.start);

        let mut handles: Vec<WorkerHandle> = Vec::with_capacity(thread_count);
        let spawned =
            self.spawn_workers(&main, sessions, &queue, &tx_option, batch_exec_id, &mut handles);

        let produced = match spawned {
            Ok(()) => self.enqueue(&main, &queue, period),
            Err(e) => Err(e),
        };
        if produced.is_err() {
            self.abort.store(true, Ordering::SeqCst);
            queue.abort(handles.len());
        } else {
            queue.set_end_of_work(handles.len());
        }

        let joined = self.wait_for_workers(handles, &queue);
        let mut discarded = 0;
        while let Some(item) = queue.poll() {
            if !item.is_end_of_work() {
                discarded += 1;
            }
        }
        if discarded > 0 {
            warn!("Discarded {} contracts left in the queue", discarded);
        }
        let contracts = produced?;
        joined?;
        Ok(contracts)
    }

    fn spawn_workers(
        &self,
        main: &SharedSession,
        sessions: &mut Vec<SharedSession>,
        queue: &Arc<WorkQueue>,
        tx_option: &TxOption,
        batch_exec_id: &str,
        handles: &mut Vec<WorkerHandle>,
    ) -> AppResult<()> {
        for i in 0..self.config.thread_count {
            let session = if self.config.shared_connection {
                Arc::clone(main)
            } else {
                let session: SharedSession = Arc::new(Mutex::new(self.database.open_session()?));
                sessions.push(Arc::clone(&session));
                if self.config.transaction_scope == TransactionScope::Whole {
                    self.begin_whole(&session, tx_option)?;
                }
                session
            };
            let name = format!("calc-{:03}", i);
            let worker = CalculationWorker::new(
                name.clone(),
                Arc::clone(queue),
                session,
                self.runner.clone(),
                Arc::clone(&self.statistics),
                self.config.transaction_scope,
                self.config.shared_connection,
                tx_option.clone(),
                batch_exec_id,
                Arc::clone(&self.abort),
            );
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker.run())?;
            handles.push((name, handle));
        }
        Ok(())
    }

    /// Queue one item per contract of the period, in phone number order
    fn enqueue(
        &self,
        main: &SharedSession,
        queue: &WorkQueue,
        period: BillingPeriod,
    ) -> AppResult<usize> {
        let contracts = main
            .lock()
            .contracts()
            .get_by_date_range(period.start, period.end)?;
        let mut queued = 0;
        for contract in contracts {
            if self.abort.load(Ordering::SeqCst) {
                warn!("Stop queueing contracts on abort request after {}", queued);
                break;
            }
            debug!("Queueing contract {}", contract.key());
            queue.put(WorkItem::Calculate(Box::new(CalculationTarget {
                contract,
                billing_calculator: Box::new(SimpleBillingCalculator::default()),
                call_charge_calculator: Box::new(SimpleCallChargeCalculator),
                start: period.start,
                end: period.end,
            })));
            queued += 1;
        }
        info!("Queued {} contracts", queued);
        Ok(queued)
    }

    /// Poll the workers until all are done and keep the first error
    fn wait_for_workers(&self, mut pending: Vec<WorkerHandle>, queue: &WorkQueue) -> AppResult<()> {
        let mut first_error: Option<AppError> = None;
        while !pending.is_empty() {
            thread::sleep(WORKER_POLL_INTERVAL);
            let (done, running): (Vec<_>, Vec<_>) =
                pending.into_iter().partition(|(_, handle)| handle.is_finished());
            pending = running;
            for (name, handle) in done {
                let error = match handle.join() {
                    Ok(Ok(calculated)) => {
                        debug!("{} calculated {} contracts", name, calculated);
                        continue;
                    }
                    Ok(Err(e)) => e,
                    Err(_) => AppError::WorkerPanicked(name),
                };
                error!("Calculation worker failed: {}", error);
                self.abort.store(true, Ordering::SeqCst);
                first_error.get_or_insert(error);
            }
            debug!("{}", queue.status());
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Commit or roll back every session, then close them
    fn settle(&self, sessions: &[SharedSession], success: bool) -> AppResult<()> {
        let whole = self.config.transaction_scope == TransactionScope::Whole;
        let mut first_error = None;
        for session in sessions {
            let mut session = session.lock();
            let result = if success {
                if whole {
                    self.runner.counters().increment(TxLabel::BatchMain, CounterName::TryCommit);
                }
                session.commit()
            } else {
                session.rollback()
            };
            match (&result, success, whole) {
                (Ok(()), true, true) => {
                    self.runner.counters().increment(TxLabel::BatchMain, CounterName::Success)
                }
                (_, false, true) | (Err(_), true, true) => {
                    self.runner.counters().increment(TxLabel::BatchMain, CounterName::Aborted)
                }
                _ => {}
            }
            if let Err(e) = result.and_then(|_| session.close()) {
                error!("Failed to settle session: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if !success {
            info!("All sessions rolled back");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
