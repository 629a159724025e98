//! Transaction runner and counters
//!
//! [`TransactionRunner`] runs a unit of work inside one transaction of a
//! [`Session`] and counts every step under the transaction's label. Retriable
//! failures are retried up to the option's retry limit, anything else is
//! returned to the caller after rolling back.

use parking_lot::Mutex;
use phonebill_core::{traits::Session, AppError, AppResult, TxLabel, TxOption};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::Arc;
use tracing::{debug, warn};

/// Counter kinds kept per transaction label
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CounterName {
    BeginTx,
    TryCommit,
    Aborted,
    Success,
    OccTry,
    OccAbort,
    OccSucc,
    OccAbandonedRetry,
    LtxTry,
    LtxAbort,
    LtxSucc,
    LtxAbandonedRetry,
}

impl CounterName {
    pub fn as_str(&self) -> &'static str {
        match self {
            CounterName::BeginTx => "BEGIN_TX",
            CounterName::TryCommit => "TRY_COMMIT",
            CounterName::Aborted => "ABORTED",
            CounterName::Success => "SUCCESS",
            CounterName::OccTry => "OCC_TRY",
            CounterName::OccAbort => "OCC_ABORT",
            CounterName::OccSucc => "OCC_SUCC",
            CounterName::OccAbandonedRetry => "OCC_ABANDONED_RETRY",
            CounterName::LtxTry => "LTX_TRY",
            CounterName::LtxAbort => "LTX_ABORT",
            CounterName::LtxSucc => "LTX_SUCC",
            CounterName::LtxAbandonedRetry => "LTX_ABANDONED_RETRY",
        }
    }
}

/// Columns of the counter report
const REPORT_COLUMNS: [CounterName; 4] = [
    CounterName::BeginTx,
    CounterName::TryCommit,
    CounterName::Aborted,
    CounterName::Success,
];

/// Thread-safe transaction counters
#[derive(Debug, Default)]
pub struct TxCounters {
    counts: Mutex<BTreeMap<(TxLabel, CounterName), u64>>,
}

impl TxCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, label: TxLabel, name: CounterName) {
        *self.counts.lock().entry((label, name)).or_insert(0) += 1;
    }

    pub fn get(&self, label: TxLabel, name: CounterName) -> u64 {
        self.counts.lock().get(&(label, name)).copied().unwrap_or(0)
    }

    pub fn reset(&self) {
        self.counts.lock().clear();
    }

    /// CSV report with one row per label that has any count
    pub fn report(&self) -> String {
        let counts = self.counts.lock();
        let mut labels: Vec<TxLabel> = counts.keys().map(|(label, _)| *label).collect();
        labels.dedup();

        let mut out = String::from("TX_LABELS");
        for column in REPORT_COLUMNS {
            out.push(',');
            out.push_str(column.as_str());
        }
        out.push('\n');
        for label in labels {
            out.push_str(label.as_str());
            for column in REPORT_COLUMNS {
                let value = counts.get(&(label, column)).copied().unwrap_or(0);
                let _ = write!(out, ",{}", value);
            }
            out.push('\n');
        }
        out
    }
}

/// Runs units of work in transactions
#[derive(Debug, Clone)]
pub struct TransactionRunner {
    counters: Arc<TxCounters>,
}

impl TransactionRunner {
    pub fn new(counters: Arc<TxCounters>) -> Self {
        Self { counters }
    }

    pub fn counters(&self) -> &Arc<TxCounters> {
        &self.counters
    }

    /// Run `work` and commit, retrying retriable failures
    ///
    /// Gives up with [`AppError::RetryOver`] once `option.retry_limit`
    /// retries have failed.
    pub fn execute<T, F>(
        &self,
        session: &mut dyn Session,
        option: &TxOption,
        mut work: F,
    ) -> AppResult<T>
    where
        F: FnMut(&mut dyn Session) -> AppResult<T>,
    {
        let mut attempt = 0;
        loop {
            match self.try_once(session, option, &mut work) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retriable() && attempt < option.retry_limit => {
                    attempt += 1;
                    debug!("Retrying {} after retriable failure ({}): {}", option, attempt, e);
                }
                Err(e) if e.is_retriable() => {
                    return Err(AppError::RetryOver {
                        attempts: attempt + 1,
                        source: Box::new(e),
                    })
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Run `work` once in a new transaction and commit it
    ///
    /// On failure the transaction is rolled back and the original error is
    /// returned.
    pub fn try_once<T, F>(
        &self,
        session: &mut dyn Session,
        option: &TxOption,
        work: &mut F,
    ) -> AppResult<T>
    where
        F: FnMut(&mut dyn Session) -> AppResult<T>,
    {
        let label = option.label;
        self.counters.increment(label, CounterName::BeginTx);
        match self.run_and_commit(session, option, work) {
            Ok(value) => {
                self.counters.increment(label, CounterName::Success);
                Ok(value)
            }
            Err(e) => {
                self.counters.increment(label, CounterName::Aborted);
                if let Err(rollback_err) = session.rollback() {
                    warn!("Rollback of {} failed: {}", option, rollback_err);
                }
                Err(e)
            }
        }
    }

    fn run_and_commit<T, F>(
        &self,
        session: &mut dyn Session,
        option: &TxOption,
        work: &mut F,
    ) -> AppResult<T>
    where
        F: FnMut(&mut dyn Session) -> AppResult<T>,
    {
        session.begin(option)?;
        let value = work(&mut *session)?;
        self.counters.increment(option.label, CounterName::TryCommit);
        session.commit()?;
        Ok(value)
    }
}
