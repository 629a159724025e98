//! Test data generation
//!
//! Contracts are laid out in blocks. Every block repeats the same list of
//! contract durations, built once from the configured rates and the run's
//! random seed, so the n-th contract can be rebuilt from `n` alone:
//!
//! - `no_expiration_date_rate` open-ended contracts
//! - `expiration_date_rate` contracts with an end date
//! - `duplicate_phone_number_rate` pairs of contracts sharing one phone
//!   number, the first ending at least one month before the second starts
//!
//! Histories pick a caller and a recipient among the contracts active on the
//! call's day.

use chrono::{Datelike, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime};
use phonebill_core::{
    config::TestDataConfig,
    models::{Contract, History, HistoryKey, PaymentCategory},
    traits::Database,
    AppError, AppResult, TxLabel, TxOption,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::constants::{CHARGE_RULE, MAX_PHONE_NUMBER, TEST_DATA_BATCH_SIZE, TEST_DATA_RETRY_LIMIT};
use crate::transaction::TransactionRunner;

/// Service period of one contract pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContractDuration {
    pub start: NaiveDate,
    pub end: Option<NaiveDate>,
}

impl ContractDuration {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start <= date && self.end.map_or(true, |end| date <= end)
    }
}

/// Uniformly random day in `[min, max]`
fn random_date(min: NaiveDate, max: NaiveDate, rng: &mut impl Rng) -> NaiveDate {
    let days = (max - min).num_days().max(0);
    min + Duration::days(rng.gen_range(0..=days))
}

/// Build the duration list shared by every block
pub fn duration_patterns(config: &TestDataConfig, seed: u64) -> AppResult<Vec<ContractDuration>> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut list = Vec::with_capacity(config.block_size() as usize);

    for _ in 0..config.no_expiration_date_rate {
        let start = random_date(config.min_date, config.max_date, &mut rng);
        list.push(ContractDuration { start, end: None });
    }
    for _ in 0..config.expiration_date_rate {
        let start = random_date(config.min_date, config.max_date, &mut rng);
        let end = random_date(start, config.max_date, &mut rng);
        list.push(ContractDuration {
            start,
            end: Some(end),
        });
    }
    if config.duplicate_phone_number_rate > 0 {
        let last_of_previous_month = config
            .max_date
            .with_day(1)
            .and_then(|d| d.pred_opt())
            .filter(|d| *d >= config.min_date)
            .ok_or_else(|| {
                AppError::Config(format!(
                    "test_data.min_date {} and max_date {} must be at least one month apart for duplicate phone numbers",
                    config.min_date, config.max_date
                ))
            })?;
        for _ in 0..config.duplicate_phone_number_rate {
            let end = random_date(config.min_date, last_of_previous_month, &mut rng);
            let next_month = end
                .with_day(1)
                .and_then(|d| d.checked_add_months(Months::new(1)))
                .ok_or_else(|| AppError::Internal(format!("date out of range: {}", end)))?;
            let start = random_date(next_month, config.max_date, &mut rng);
            list.push(ContractDuration {
                start: config.min_date,
                end: Some(end),
            });
            list.push(ContractDuration { start, end: None });
        }
    }
    Ok(list)
}

/// Hands out contracts by index, shared by every thread that creates contracts
#[derive(Debug)]
pub struct ContractGenerator {
    durations: Vec<ContractDuration>,
    no_duplicate_size: u64,
    next: AtomicU64,
}

impl ContractGenerator {
    pub fn new(config: &TestDataConfig, seed: u64) -> AppResult<Self> {
        let durations = duration_patterns(config, seed)?;
        if durations.is_empty() {
            return Err(AppError::Config("contract block size must be at least 1".to_string()));
        }
        Ok(Self {
            durations,
            no_duplicate_size: u64::from(config.expiration_date_rate)
                + u64::from(config.no_expiration_date_rate),
            next: AtomicU64::new(0),
        })
    }

    /// Continue handing out new contracts from index `n`
    pub fn starting_at(self, n: u64) -> Self {
        self.next.store(n, Ordering::SeqCst);
        self
    }

    pub fn block_size(&self) -> u64 {
        self.durations.len() as u64
    }

    /// Index of the next contract [`new_contract`](Self::new_contract) returns
    pub fn next_index(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn duration(&self, n: u64) -> ContractDuration {
        self.durations[(n % self.block_size()) as usize]
    }

    /// Numeric phone number of the n-th contract
    ///
    /// Both contracts of a duplicate pair map to the number of the second one.
    pub fn phone_number_value(&self, n: u64) -> AppResult<u64> {
        if n > MAX_PHONE_NUMBER {
            return Err(AppError::InvalidInput(format!("Out of phone number range: {}", n)));
        }
        let pos = n % self.block_size();
        if pos >= self.no_duplicate_size && (pos - self.no_duplicate_size) % 2 == 0 {
            return Ok(n + 1);
        }
        Ok(n)
    }

    /// 11-digit phone number of the n-th contract
    pub fn phone_number(&self, n: u64) -> AppResult<String> {
        Ok(format!("{:011}", self.phone_number_value(n)?))
    }

    pub fn contract(&self, n: u64) -> AppResult<Contract> {
        let duration = self.duration(n);
        Ok(Contract::new(
            self.phone_number(n)?,
            duration.start,
            duration.end,
            CHARGE_RULE,
        ))
    }

    /// Next contract that has never been handed out
    pub fn new_contract(&self) -> AppResult<Contract> {
        let n = self.next.fetch_add(1, Ordering::SeqCst);
        self.contract(n)
    }
}

/// Builds call histories between existing contracts
pub struct HistoryGenerator {
    contracts: Arc<ContractGenerator>,
    number_of_contracts: u64,
    max_call_time_secs: i32,
    rng: StdRng,
}

impl HistoryGenerator {
    pub fn new(
        contracts: Arc<ContractGenerator>,
        number_of_contracts: u64,
        max_call_time_secs: i32,
        rng: StdRng,
    ) -> Self {
        Self {
            contracts,
            number_of_contracts,
            max_call_time_secs,
            rng,
        }
    }

    /// Random call duration in `1..=max_call_time_secs`
    pub fn call_time(&mut self) -> i32 {
        self.rng.gen_range(1..=self.max_call_time_secs.max(1))
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }

    /// Phone number of a random contract active on `date`
    ///
    /// Starts at a random contract and walks its block until it finds one.
    fn select_phone_number(&mut self, date: NaiveDate, except: Option<&str>) -> AppResult<String> {
        let block_size = self.contracts.block_size();
        let first = self.rng.gen_range(0..self.number_of_contracts.max(1));
        let block_start = first - first % block_size;
        let pos = first % block_size;
        for i in 0..block_size {
            let n = block_start + (pos + i) % block_size;
            if n >= self.number_of_contracts || !self.contracts.duration(n).is_active_on(date) {
                continue;
            }
            let phone_number = self.contracts.phone_number(n)?;
            if except != Some(phone_number.as_str()) {
                return Ok(phone_number);
            }
        }
        Err(AppError::InvalidData(format!("No active contract found on {}", date)))
    }

    /// Random history placed at `start_time`
    pub fn history_at(&mut self, start_time: NaiveDateTime) -> AppResult<History> {
        let date = start_time.date();
        let caller = self.select_phone_number(date, None)?;
        let recipient = self.select_phone_number(date, Some(&caller))?;
        let payment_category = if self.rng.gen_bool(0.5) {
            PaymentCategory::Caller
        } else {
            PaymentCategory::Recipient
        };
        Ok(History {
            caller_phone_number: caller,
            recipient_phone_number: recipient,
            payment_category,
            start_time,
            time_secs: self.call_time(),
            charge: None,
            df: false,
        })
    }

    /// Random history in `[from, from + span_millis)` whose key is not in `keys`
    ///
    /// The new key is added to `keys`.
    pub fn unique_history(
        &mut self,
        from: NaiveDateTime,
        span_millis: i64,
        keys: &mut HashSet<HistoryKey>,
    ) -> AppResult<History> {
        loop {
            let offset = self.rng.gen_range(0..span_millis.max(1));
            let history = self.history_at(from + Duration::milliseconds(offset))?;
            if keys.insert(history.key()) {
                return Ok(history);
            }
            debug!("Duplicate history key {:?}, creating another one", history.key());
        }
    }
}

/// Rows written by [`create_test_data`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestDataSummary {
    pub contracts: u64,
    pub histories: u64,
}

/// Fill empty contracts and history tables
#[instrument(
    skip_all,
    fields(
        contracts = config.number_of_contracts_records,
        histories = config.number_of_history_records
    )
)]
pub fn create_test_data(
    database: &dyn Database,
    runner: &TransactionRunner,
    config: &TestDataConfig,
    seed: u64,
) -> AppResult<TestDataSummary> {
    let generator = Arc::new(ContractGenerator::new(config, seed)?);
    let block_size = generator.block_size();
    if config.number_of_contracts_records < block_size {
        return Err(AppError::Config(format!(
            "numberOfContractsRecords({}) must be larger than contract block size({}).",
            config.number_of_contracts_records, block_size
        )));
    }
    let option = TxOption::occ(TEST_DATA_RETRY_LIMIT, TxLabel::TestDataGenerator);
    let mut session = database.open_session()?;

    let started = Instant::now();
    let mut batch = Vec::with_capacity(TEST_DATA_BATCH_SIZE);
    for n in 0..config.number_of_contracts_records {
        batch.push(generator.contract(n)?);
        if batch.len() >= TEST_DATA_BATCH_SIZE {
            runner.execute(session.as_mut(), &option, |s| s.contracts().batch_insert(&batch))?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        runner.execute(session.as_mut(), &option, |s| s.contracts().batch_insert(&batch))?;
    }
    info!(
        "{} contracts created in {:.3} sec",
        config.number_of_contracts_records,
        started.elapsed().as_secs_f64()
    );

    let started = Instant::now();
    let from = config.history_min_date.and_time(NaiveTime::MIN);
    let until = config.history_max_date.and_time(NaiveTime::MIN);
    let span_millis = (until - from).num_milliseconds();
    let mut histories = HistoryGenerator::new(
        generator,
        config.number_of_contracts_records,
        config.max_call_time_secs,
        StdRng::seed_from_u64(seed),
    );
    let mut keys = HashSet::new();
    let mut batch = Vec::with_capacity(TEST_DATA_BATCH_SIZE);
    for _ in 0..config.number_of_history_records {
        batch.push(histories.unique_history(from, span_millis, &mut keys)?);
        if batch.len() >= TEST_DATA_BATCH_SIZE {
            runner.execute(session.as_mut(), &option, |s| s.histories().batch_insert(&batch))?;
            batch.clear();
        }
    }
    if !batch.is_empty() {
        runner.execute(session.as_mut(), &option, |s| s.histories().batch_insert(&batch))?;
    }
    info!(
        "{} histories created in {:.3} sec",
        config.number_of_history_records,
        started.elapsed().as_secs_f64()
    );
    session.close()?;

    Ok(TestDataSummary {
        contracts: config.number_of_contracts_records,
        histories: config.number_of_history_records,
    })
}
