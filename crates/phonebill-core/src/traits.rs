//! Common traits for storage access
//!
//! The engine is written against these traits only. A backend provides a
//! [`Database`] that opens [`Session`]s, and each session exposes the three
//! table DAOs inside its current transaction.
//!
//! All calls are synchronous: workers and load generators run on their own
//! OS threads and block on storage.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::AppError;
use crate::models::{Billing, Contract, ContractKey, History};
use crate::tx::TxOption;

type Result<T> = std::result::Result<T, AppError>;

/// Contracts table access
pub trait ContractDao {
    /// Insert several contracts, returns the number of inserted rows
    fn batch_insert(&mut self, contracts: &[Contract]) -> Result<u64>;

    /// Insert one contract
    fn insert(&mut self, contract: &Contract) -> Result<u64>;

    /// Update end date and charge rule of the contract with the same key
    fn update(&mut self, contract: &Contract) -> Result<u64>;

    /// Delete the contract with the given key
    fn delete(&mut self, key: &ContractKey) -> Result<u64>;

    /// Find contract by key
    fn get(&mut self, key: &ContractKey) -> Result<Option<Contract>>;

    /// All contracts of one phone number, ordered by start date
    fn get_by_phone_number(&mut self, phone_number: &str) -> Result<Vec<Contract>>;

    /// Contracts intersecting `[start, end]`, ordered by phone number
    fn get_by_date_range(&mut self, start: NaiveDate, end: NaiveDate) -> Result<Vec<Contract>>;

    /// Keys of every contract, ordered
    fn get_all_keys(&mut self) -> Result<Vec<ContractKey>>;

    /// Count contracts
    fn count(&mut self) -> Result<i64>;
}

/// History table access
pub trait HistoryDao {
    /// Insert several histories, returns the number of inserted rows
    fn batch_insert(&mut self, histories: &[History]) -> Result<u64>;

    /// Update several histories by key, returns the number of updated rows
    fn batch_update(&mut self, histories: &[History]) -> Result<u64>;

    /// Update one history by key
    fn update(&mut self, history: &History) -> Result<u64>;

    /// Histories placed by the contract's phone number during the contract period
    fn get_by_contract(&mut self, key: &ContractKey) -> Result<Vec<History>>;

    /// Live histories billed to `phone_number` with `start <= start_time < end_exclusive`
    fn get_calculation_targets(
        &mut self,
        phone_number: &str,
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> Result<Vec<History>>;

    /// Every history, ordered by key
    fn get_all(&mut self) -> Result<Vec<History>>;

    /// Delete every history
    fn delete_all(&mut self) -> Result<u64>;

    /// Count histories
    fn count(&mut self) -> Result<i64>;

    /// Latest call start time, None when the table is empty
    fn get_max_start_time(&mut self) -> Result<Option<NaiveDateTime>>;
}

/// Billing table access
pub trait BillingDao {
    /// Insert one billing row
    fn insert(&mut self, billing: &Billing) -> Result<u64>;

    /// Delete every billing row of the month starting at `target_month`
    fn delete_by_month(&mut self, target_month: NaiveDate) -> Result<u64>;

    /// Every billing row, ordered by key
    fn get_all(&mut self) -> Result<Vec<Billing>>;
}

/// One connection to the database with at most one open transaction
///
/// DAO calls outside an explicit `begin` start a transaction with default
/// options, the same way a JDBC connection with auto-commit disabled does.
pub trait Session: Send {
    /// Contracts table inside the current transaction
    fn contracts(&mut self) -> &mut dyn ContractDao;

    /// History table inside the current transaction
    fn histories(&mut self) -> &mut dyn HistoryDao;

    /// Billing table inside the current transaction
    fn billings(&mut self) -> &mut dyn BillingDao;

    /// Start a transaction, fails if one is already open
    fn begin(&mut self, option: &TxOption) -> Result<()>;

    /// Commit the open transaction, a no-op when none is open
    fn commit(&mut self) -> Result<()>;

    /// Roll back the open transaction, a no-op when none is open
    fn rollback(&mut self) -> Result<()>;

    /// Whether a transaction is open
    fn in_transaction(&self) -> bool;

    /// Roll back anything pending and release the connection
    fn close(&mut self) -> Result<()>;
}

/// A storage backend
pub trait Database: Send + Sync {
    /// Backend name for logs
    fn name(&self) -> &'static str;

    /// Open a new session
    fn open_session(&self) -> Result<Box<dyn Session>>;

    /// Drop and recreate the benchmark tables
    fn create_tables(&self) -> Result<()>;
}
