//! Batch engine and online load for the phone bill benchmark
//!
//! This crate contains everything that runs transactions against a
//! [`Database`](phonebill_core::traits::Database):
//!
//! - `billing` - the monthly billing batch and its workers
//! - `online` - scheduled load generators that run alongside the batch
//! - `transaction` - transaction runner with retry and per-label counters
//! - `statistics` - latency statistics per transaction label
//! - `testdata` - deterministic contract and history generation
//!
//! Workers and generators run on OS threads and share state only through
//! explicitly passed `Arc`s: the abort flag, the work queue, the counters and
//! the statistics.

pub mod billing;
pub mod online;
pub mod statistics;
pub mod testdata;
pub mod transaction;

pub use billing::{BatchOrchestrator, BatchResult};
pub use online::{create_online_apps, OnlineApps, RunningApps};
pub use statistics::TxStatistics;
pub use testdata::{create_test_data, ContractGenerator, TestDataSummary};
pub use transaction::{CounterName, TransactionRunner, TxCounters};

/// Business constants
pub mod constants {
    use std::time::Duration;

    /// Monthly basic charge
    pub const BASIC_CHARGE: i32 = 3000;

    /// Charge of every started minute of a call
    pub const CHARGE_PER_MINUTE: i32 = 10;

    /// Call charges up to this amount are covered by the basic charge
    pub const FREE_CALL_CHARGE_LIMIT: i32 = 2000;

    /// Work queue capacity per calculation worker
    pub const QUEUE_DEPTH_PER_WORKER: usize = 64;

    /// Interval the orchestrator polls its workers at
    pub const WORKER_POLL_INTERVAL: Duration = Duration::from_millis(100);

    /// Sleep of an online application waiting for its next fire time
    pub const SCHEDULER_SLEEP: Duration = Duration::from_millis(10);

    /// Length of one schedule window
    pub const CREATE_SCHEDULE_INTERVAL_MILLS: i64 = 60 * 1000;

    /// OCC attempts of one online execution
    pub const OCC_TRY_LIMIT: u32 = 3;

    /// LTX attempts of one online execution after the OCC attempts failed
    pub const LTX_TRY_LIMIT: u32 = 3;

    /// Contracts a history update looks at before giving up
    pub const HISTORY_UPDATE_MAX_PICKS: usize = 100;

    /// Candidate end dates a master update tries
    pub const MASTER_UPDATE_MAX_TRIES: usize = 100;

    /// How long the batch waits for the online applications to stop
    pub const GENERATOR_STOP_TIMEOUT: Duration = Duration::from_secs(300);

    /// Largest phone number
    pub const MAX_PHONE_NUMBER: u64 = 99_999_999_999;

    /// Charge rule of generated contracts
    pub const CHARGE_RULE: &str = "dummy";

    /// Rows per test data insert transaction
    pub const TEST_DATA_BATCH_SIZE: usize = 10_000;

    pub const TEST_DATA_RETRY_LIMIT: u32 = 3;
}
