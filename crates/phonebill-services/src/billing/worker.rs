//! Calculation worker
//!
//! Takes items from the [`WorkQueue`] until it sees an end-of-work sentinel or
//! the shared abort flag. Under CONTRACT scope every contract is committed on
//! its own and retriable failures are retried in place. Under WHOLE scope the
//! worker writes into the transaction the orchestrator opened. After a
//! retriable failure a worker that owns its session rolls it back, begins
//! again and recalculates every contract it had written. A worker on a shared
//! session retries the failed contract inside the shared transaction.

use parking_lot::Mutex;
use phonebill_core::{
    config::TransactionScope,
    models::Billing,
    traits::Session,
    AppError, AppResult, TxOption,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::queue::{CalculationTarget, WorkItem, WorkQueue};
use crate::statistics::TxStatistics;
use crate::transaction::{CounterName, TransactionRunner};

/// Session handle that may be shared between workers
pub type SharedSession = Arc<Mutex<Box<dyn Session>>>;

/// Bill one contract inside the session's current transaction
///
/// Returns the number of history rows charged.
pub fn calculate(
    session: &mut dyn Session,
    target: &mut CalculationTarget,
    batch_exec_id: &str,
) -> AppResult<usize> {
    let end_exclusive = target.end.succ_opt().ok_or_else(|| {
        AppError::InvalidInput(format!("billing period end out of range: {}", target.end))
    })?;
    let phone_number = target.contract.phone_number.as_str();

    let mut histories = session
        .histories()
        .get_calculation_targets(phone_number, target.start, end_exclusive)?;

    target.billing_calculator.init();
    for history in histories.iter_mut() {
        let charge = target.call_charge_calculator.calc(history.time_secs)?;
        history.charge = Some(charge);
        target.billing_calculator.add_call_charge(charge);
    }
    session.histories().batch_update(&histories)?;

    let billing = Billing {
        phone_number: phone_number.to_string(),
        target_month: target.start,
        basic_charge: target.billing_calculator.basic_charge(),
        metered_charge: target.billing_calculator.metered_charge(),
        billing_amount: target.billing_calculator.billing_amount(),
        batch_exec_id: batch_exec_id.to_string(),
    };
    debug!(
        "Inserting to billing table: phone_number = {}, target_month = {}, basic_charge = {}, metered_charge = {}, billing_amount = {}, batch_exec_id = {}",
        billing.phone_number,
        billing.target_month,
        billing.basic_charge,
        billing.metered_charge,
        billing.billing_amount,
        billing.batch_exec_id
    );
    session.billings().insert(&billing)?;
    Ok(histories.len())
}

/// One worker of the billing batch
pub struct CalculationWorker {
    name: String,
    queue: Arc<WorkQueue>,
    session: SharedSession,
    runner: TransactionRunner,
    statistics: Arc<TxStatistics>,
    scope: TransactionScope,
    shared_session: bool,
    tx_option: TxOption,
    batch_exec_id: String,
    abort: Arc<AtomicBool>,
}

impl CalculationWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: impl Into<String>,
        queue: Arc<WorkQueue>,
        session: SharedSession,
        runner: TransactionRunner,
        statistics: Arc<TxStatistics>,
        scope: TransactionScope,
        shared_session: bool,
        tx_option: TxOption,
        batch_exec_id: impl Into<String>,
        abort: Arc<AtomicBool>,
    ) -> Self {
        Self {
            name: name.into(),
            queue,
            session,
            runner,
            statistics,
            scope,
            shared_session,
            tx_option,
            batch_exec_id: batch_exec_id.into(),
            abort,
        }
    }

    /// Drain the queue, returns the number of calculated contracts
    ///
    /// A fatal failure sets the abort flag, empties the queue and comes back
    /// as the error, tagged with the contract's phone number.
    #[instrument(skip(self), fields(worker = %self.name))]
    pub fn run(self) -> AppResult<usize> {
        info!("Calculation task started");
        let mut calculated = 0;
        // Contracts written into this worker's open WHOLE transaction
        let mut written: Vec<Box<CalculationTarget>> = Vec::new();
        loop {
            if self.abort.load(Ordering::SeqCst) {
                info!(
                    "Calculation task finished by abort request, number of calculated contracts = {}",
                    calculated
                );
                return Ok(calculated);
            }
            let mut target = match self.queue.take() {
                WorkItem::EndOfWork => {
                    info!(
                        "Calculation task finished normally, number of calculated contracts = {}",
                        calculated
                    );
                    return Ok(calculated);
                }
                WorkItem::Calculate(target) => target,
            };
            debug!("{}", self.queue.status());

            match self.process(&mut target, &mut written) {
                Ok(true) => {
                    calculated += 1;
                    if self.replays_on_retry() {
                        written.push(target);
                    }
                }
                Ok(false) => {}
                Err(e) => {
                    self.abort.store(true, Ordering::SeqCst);
                    self.queue.clear();
                    error!("Calculation task aborting by error: {}", e);
                    return Err(e.for_contract(target.contract.phone_number.clone()));
                }
            }
        }
    }

    fn replays_on_retry(&self) -> bool {
        self.scope == TransactionScope::Whole && !self.shared_session
    }

    /// Returns false when a retry loop gave up because of an abort request
    fn process(
        &self,
        target: &mut CalculationTarget,
        written: &mut [Box<CalculationTarget>],
    ) -> AppResult<bool> {
        let mut session = self.session.lock();
        match self.scope {
            TransactionScope::Whole => {
                let mut restart = false;
                loop {
                    let result = if restart {
                        self.restart_whole(session.as_mut(), written)
                    } else {
                        Ok(())
                    }
                    .and_then(|_| calculate(session.as_mut(), target, &self.batch_exec_id));
                    match result {
                        Ok(_) => return Ok(true),
                        Err(e) if e.is_retriable() => {
                            let counters = self.runner.counters();
                            counters.increment(self.tx_option.label, CounterName::Aborted);
                            if self.abort.load(Ordering::SeqCst) {
                                debug!(
                                    "Stop retrying {} on abort request",
                                    target.contract.phone_number
                                );
                                return Ok(false);
                            }
                            warn!(
                                "Retrying calculation of {} after {} contracts: {}",
                                target.contract.phone_number,
                                written.len(),
                                e
                            );
                            restart = self.replays_on_retry();
                        }
                        Err(e) => return Err(e),
                    }
                }
            }
            TransactionScope::Contract => loop {
                let started = Instant::now();
                let result = self.runner.try_once(
                    session.as_mut(),
                    &self.tx_option,
                    &mut |s: &mut dyn Session| calculate(s, target, &self.batch_exec_id),
                );
                match result {
                    Ok(_) => {
                        self.statistics.add_latency(self.tx_option.label, started.elapsed());
                        return Ok(true);
                    }
                    Err(e) if e.is_retriable() => {
                        if self.abort.load(Ordering::SeqCst) {
                            debug!(
                                "Stop retrying {} on abort request",
                                target.contract.phone_number
                            );
                            return Ok(false);
                        }
                        warn!(
                            "Retrying calculation of {} after: {}",
                            target.contract.phone_number, e
                        );
                    }
                    Err(e) => return Err(e),
                }
            },
        }
    }

    /// Roll back this worker's WHOLE transaction and write `written` again
    fn restart_whole(
        &self,
        session: &mut dyn Session,
        written: &mut [Box<CalculationTarget>],
    ) -> AppResult<()> {
        session.rollback()?;
        self.runner.counters().increment(self.tx_option.label, CounterName::BeginTx);
        session.begin(&self.tx_option)?;
        for target in written.iter_mut() {
            calculate(session, target, &self.batch_exec_id)?;
        }
        Ok(())
    }
}
