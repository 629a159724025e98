//! In-memory storage backend
//!
//! Keeps the three tables in ordered maps behind one lock. Writes take
//! row-level ownership for the lifetime of the writing transaction: a write to
//! a row owned by another open transaction fails at once with a retriable
//! `SerializationFailure`, which is how the benchmark's conflict handling is
//! exercised without a database server. Reads are not isolated.
//!
//! Each session keeps an undo log holding the value a row had when the session
//! first claimed it. Commit discards the log, rollback replays it. Both release
//! ownership.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use parking_lot::Mutex;
use phonebill_core::{
    models::{Billing, BillingKey, Contract, ContractKey, History, HistoryKey, PaymentCategory},
    traits::{BillingDao, ContractDao, Database, HistoryDao, Session},
    AppError, AppResult, TxOption,
};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, trace};

/// A failure the billing insert of one phone number reports on purpose
#[derive(Debug, Clone)]
struct InjectedFault {
    phone_number: String,
    retriable: bool,
    /// None fails forever
    remaining: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum RowId {
    Contract(ContractKey),
    History(HistoryKey),
    Billing(BillingKey),
}

#[derive(Debug)]
enum Undo {
    Contract(ContractKey, Option<Contract>),
    History(HistoryKey, Option<History>),
    Billing(BillingKey, Option<Billing>),
}

impl Undo {
    fn row_id(&self) -> RowId {
        match self {
            Undo::Contract(key, _) => RowId::Contract(key.clone()),
            Undo::History(key, _) => RowId::History(key.clone()),
            Undo::Billing(key, _) => RowId::Billing(key.clone()),
        }
    }
}

#[derive(Debug, Default)]
struct Tables {
    contracts: BTreeMap<ContractKey, Contract>,
    histories: BTreeMap<HistoryKey, History>,
    billings: BTreeMap<BillingKey, Billing>,
    owners: HashMap<RowId, u64>,
}

impl Tables {
    /// Claims `row` for `session`, returns the undo entry when newly claimed
    fn claim(&mut self, session: u64, row: RowId) -> AppResult<Option<Undo>> {
        match self.owners.get(&row) {
            Some(owner) if *owner == session => return Ok(None),
            Some(owner) => {
                return Err(AppError::SerializationFailure(format!(
                    "{:?} is being written by session {}",
                    row, owner
                )))
            }
            None => {}
        }
        let undo = match &row {
            RowId::Contract(key) => Undo::Contract(key.clone(), self.contracts.get(key).cloned()),
            RowId::History(key) => Undo::History(key.clone(), self.histories.get(key).cloned()),
            RowId::Billing(key) => Undo::Billing(key.clone(), self.billings.get(key).cloned()),
        };
        self.owners.insert(row, session);
        Ok(Some(undo))
    }

    fn restore(&mut self, undo: Undo) {
        match undo {
            Undo::Contract(key, Some(value)) => {
                self.contracts.insert(key, value);
            }
            Undo::Contract(key, None) => {
                self.contracts.remove(&key);
            }
            Undo::History(key, Some(value)) => {
                self.histories.insert(key, value);
            }
            Undo::History(key, None) => {
                self.histories.remove(&key);
            }
            Undo::Billing(key, Some(value)) => {
                self.billings.insert(key, value);
            }
            Undo::Billing(key, None) => {
                self.billings.remove(&key);
            }
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    tables: Mutex<Tables>,
    faults: Mutex<Vec<InjectedFault>>,
    next_session_id: AtomicU64,
}

/// In-process database, cheap to clone
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    shared: Arc<Shared>,
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the billing insert for `phone_number` fail.
    ///
    /// A retriable fault reports a serialization failure, a fatal one a
    /// database error. `times` limits how often the fault fires.
    pub fn fail_billing_insert(&self, phone_number: &str, retriable: bool, times: Option<u32>) {
        self.shared.faults.lock().push(InjectedFault {
            phone_number: phone_number.to_string(),
            retriable,
            remaining: times,
        });
    }

    /// Number of rows currently owned by open transactions
    pub fn owned_rows(&self) -> usize {
        self.shared.tables.lock().owners.len()
    }
}

impl Database for MemoryDatabase {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn open_session(&self) -> AppResult<Box<dyn Session>> {
        let id = self.shared.next_session_id.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Opening memory session {}", id);
        Ok(Box::new(MemorySession {
            id,
            shared: Arc::clone(&self.shared),
            undo: Vec::new(),
            active: None,
        }))
    }

    fn create_tables(&self) -> AppResult<()> {
        let mut tables = self.shared.tables.lock();
        *tables = Tables::default();
        info!("Memory tables created");
        Ok(())
    }
}

/// Session on a [`MemoryDatabase`]
pub struct MemorySession {
    id: u64,
    shared: Arc<Shared>,
    undo: Vec<Undo>,
    /// Options of the open transaction
    active: Option<TxOption>,
}

impl MemorySession {
    fn ensure_active(&mut self) {
        if self.active.is_none() {
            self.active = Some(TxOption::default());
        }
    }

    /// Claims a row and runs `write` on the tables while holding the lock
    fn write<T>(
        &mut self,
        row: RowId,
        write: impl FnOnce(&mut Tables) -> AppResult<T>,
    ) -> AppResult<T> {
        self.ensure_active();
        let mut tables = self.shared.tables.lock();
        if let Some(undo) = tables.claim(self.id, row)? {
            self.undo.push(undo);
        }
        write(&mut tables)
    }

    fn release(&mut self, restore: bool) {
        let mut tables = self.shared.tables.lock();
        while let Some(undo) = self.undo.pop() {
            tables.owners.remove(&undo.row_id());
            if restore {
                tables.restore(undo);
            }
        }
        self.active = None;
    }

    fn take_fault(&self, phone_number: &str) -> Option<AppError> {
        let mut faults = self.shared.faults.lock();
        let fault = faults
            .iter_mut()
            .find(|f| f.phone_number == phone_number && f.remaining != Some(0))?;
        if let Some(remaining) = fault.remaining.as_mut() {
            *remaining -= 1;
        }
        Some(if fault.retriable {
            AppError::SerializationFailure(format!("injected conflict for {}", phone_number))
        } else {
            AppError::Database(format!("injected failure for {}", phone_number))
        })
    }
}

fn start_of(date: NaiveDate) -> NaiveDateTime {
    date.and_time(NaiveTime::MIN)
}

impl ContractDao for MemorySession {
    fn batch_insert(&mut self, contracts: &[Contract]) -> AppResult<u64> {
        let mut inserted = 0;
        for contract in contracts {
            inserted += ContractDao::insert(self, contract)?;
        }
        Ok(inserted)
    }

    fn insert(&mut self, contract: &Contract) -> AppResult<u64> {
        let key = contract.key();
        self.write(RowId::Contract(key.clone()), |tables| {
            if tables.contracts.contains_key(&key) {
                return Err(AppError::AlreadyExists(format!("contract {}", key)));
            }
            tables.contracts.insert(key, contract.clone());
            Ok(1)
        })
    }

    fn update(&mut self, contract: &Contract) -> AppResult<u64> {
        let key = contract.key();
        self.write(RowId::Contract(key.clone()), |tables| {
            Ok(match tables.contracts.get_mut(&key) {
                Some(row) => {
                    row.end_date = contract.end_date;
                    row.charge_rule = contract.charge_rule.clone();
                    1
                }
                None => 0,
            })
        })
    }

    fn delete(&mut self, key: &ContractKey) -> AppResult<u64> {
        self.write(RowId::Contract(key.clone()), |tables| {
            Ok(tables.contracts.remove(key).map_or(0, |_| 1))
        })
    }

    fn get(&mut self, key: &ContractKey) -> AppResult<Option<Contract>> {
        self.ensure_active();
        Ok(self.shared.tables.lock().contracts.get(key).cloned())
    }

    fn get_by_phone_number(&mut self, phone_number: &str) -> AppResult<Vec<Contract>> {
        self.ensure_active();
        let tables = self.shared.tables.lock();
        Ok(tables
            .contracts
            .values()
            .filter(|c| c.phone_number == phone_number)
            .cloned()
            .collect())
    }

    fn get_by_date_range(&mut self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<Contract>> {
        self.ensure_active();
        let tables = self.shared.tables.lock();
        Ok(tables
            .contracts
            .values()
            .filter(|c| c.intersects(start, end))
            .cloned()
            .collect())
    }

    fn get_all_keys(&mut self) -> AppResult<Vec<ContractKey>> {
        self.ensure_active();
        Ok(self.shared.tables.lock().contracts.keys().cloned().collect())
    }

    fn count(&mut self) -> AppResult<i64> {
        self.ensure_active();
        Ok(self.shared.tables.lock().contracts.len() as i64)
    }
}

impl HistoryDao for MemorySession {
    fn batch_insert(&mut self, histories: &[History]) -> AppResult<u64> {
        let mut inserted = 0;
        for history in histories {
            let key = history.key();
            inserted += self.write(RowId::History(key.clone()), |tables| {
                if tables.histories.contains_key(&key) {
                    return Err(AppError::AlreadyExists(format!(
                        "history {} at {}",
                        key.caller_phone_number, key.start_time
                    )));
                }
                tables.histories.insert(key, history.clone());
                Ok(1)
            })?;
        }
        Ok(inserted)
    }

    fn batch_update(&mut self, histories: &[History]) -> AppResult<u64> {
        let mut updated = 0;
        for history in histories {
            updated += HistoryDao::update(self, history)?;
        }
        Ok(updated)
    }

    fn update(&mut self, history: &History) -> AppResult<u64> {
        let key = history.key();
        self.write(RowId::History(key.clone()), |tables| {
            Ok(match tables.histories.get_mut(&key) {
                Some(row) => {
                    *row = history.clone();
                    1
                }
                None => 0,
            })
        })
    }

    fn get_by_contract(&mut self, key: &ContractKey) -> AppResult<Vec<History>> {
        self.ensure_active();
        let tables = self.shared.tables.lock();
        let Some(contract) = tables.contracts.get(key) else {
            return Ok(Vec::new());
        };
        let from = start_of(contract.start_date);
        let until = contract.end_date.and_then(|d| d.succ_opt()).map(start_of);
        Ok(tables
            .histories
            .values()
            .filter(|h| h.caller_phone_number == contract.phone_number)
            .filter(|h| h.start_time >= from && until.map_or(true, |u| h.start_time < u))
            .cloned()
            .collect())
    }

    fn get_calculation_targets(
        &mut self,
        phone_number: &str,
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> AppResult<Vec<History>> {
        self.ensure_active();
        let (from, until) = (start_of(start), start_of(end_exclusive));
        let tables = self.shared.tables.lock();
        Ok(tables
            .histories
            .values()
            .filter(|h| !h.df && h.start_time >= from && h.start_time < until)
            .filter(|h| match h.payment_category {
                PaymentCategory::Caller => h.caller_phone_number == phone_number,
                PaymentCategory::Recipient => h.recipient_phone_number == phone_number,
            })
            .cloned()
            .collect())
    }

    fn get_all(&mut self) -> AppResult<Vec<History>> {
        self.ensure_active();
        Ok(self.shared.tables.lock().histories.values().cloned().collect())
    }

    fn delete_all(&mut self) -> AppResult<u64> {
        let keys: Vec<HistoryKey> = {
            self.ensure_active();
            self.shared.tables.lock().histories.keys().cloned().collect()
        };
        let mut deleted = 0;
        for key in keys {
            deleted += self.write(RowId::History(key.clone()), |tables| {
                Ok(tables.histories.remove(&key).map_or(0, |_| 1))
            })?;
        }
        Ok(deleted)
    }

    fn count(&mut self) -> AppResult<i64> {
        self.ensure_active();
        Ok(self.shared.tables.lock().histories.len() as i64)
    }

    fn get_max_start_time(&mut self) -> AppResult<Option<NaiveDateTime>> {
        self.ensure_active();
        let tables = self.shared.tables.lock();
        Ok(tables.histories.keys().map(|k| k.start_time).max())
    }
}

impl BillingDao for MemorySession {
    fn insert(&mut self, billing: &Billing) -> AppResult<u64> {
        if let Some(err) = self.take_fault(&billing.phone_number) {
            return Err(err);
        }
        let key = billing.key();
        self.write(RowId::Billing(key.clone()), |tables| {
            if tables.billings.contains_key(&key) {
                return Err(AppError::AlreadyExists(format!(
                    "billing {} {} {}",
                    key.target_month, key.phone_number, key.batch_exec_id
                )));
            }
            tables.billings.insert(key, billing.clone());
            Ok(1)
        })
    }

    fn delete_by_month(&mut self, target_month: NaiveDate) -> AppResult<u64> {
        let keys: Vec<BillingKey> = {
            self.ensure_active();
            let tables = self.shared.tables.lock();
            tables
                .billings
                .keys()
                .filter(|k| k.target_month == target_month)
                .cloned()
                .collect()
        };
        let mut deleted = 0;
        for key in keys {
            deleted += self.write(RowId::Billing(key.clone()), |tables| {
                Ok(tables.billings.remove(&key).map_or(0, |_| 1))
            })?;
        }
        Ok(deleted)
    }

    fn get_all(&mut self) -> AppResult<Vec<Billing>> {
        self.ensure_active();
        Ok(self.shared.tables.lock().billings.values().cloned().collect())
    }
}

impl Session for MemorySession {
    fn contracts(&mut self) -> &mut dyn ContractDao {
        self
    }

    fn histories(&mut self) -> &mut dyn HistoryDao {
        self
    }

    fn billings(&mut self) -> &mut dyn BillingDao {
        self
    }

    fn begin(&mut self, option: &TxOption) -> AppResult<()> {
        if let Some(open) = &self.active {
            return Err(AppError::Transaction(format!(
                "session {} already has an open transaction {}",
                self.id, open
            )));
        }
        trace!("Session {} begins {}", self.id, option);
        self.active = Some(option.clone());
        Ok(())
    }

    fn commit(&mut self) -> AppResult<()> {
        trace!("Session {} commits {} rows", self.id, self.undo.len());
        self.release(false);
        Ok(())
    }

    fn rollback(&mut self) -> AppResult<()> {
        trace!("Session {} rolls back {} rows", self.id, self.undo.len());
        self.release(true);
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.active.is_some()
    }

    fn close(&mut self) -> AppResult<()> {
        self.release(true);
        Ok(())
    }
}

impl Drop for MemorySession {
    fn drop(&mut self) {
        if !self.undo.is_empty() {
            self.release(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonebill_core::TxLabel;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn history(caller: &str, recipient: &str, category: PaymentCategory, day: u32) -> History {
        History {
            caller_phone_number: caller.to_string(),
            recipient_phone_number: recipient.to_string(),
            payment_category: category,
            start_time: date(2020, 12, day).and_hms_opt(9, 0, 0).unwrap(),
            time_secs: 30,
            charge: None,
            df: false,
        }
    }

    #[test]
    fn test_rollback_restores_rows() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let contract = Contract::new("00000000001", date(2020, 1, 1), None, "r");
        session.contracts().insert(&contract).unwrap();
        session.commit().unwrap();

        session.begin(&TxOption::occ(0, TxLabel::Test)).unwrap();
        session.contracts().delete(&contract.key()).unwrap();
        session
            .contracts()
            .insert(&Contract::new("00000000002", date(2020, 1, 1), None, "r"))
            .unwrap();
        assert_eq!(session.contracts().count().unwrap(), 1);
        session.rollback().unwrap();

        assert_eq!(session.contracts().get_all_keys().unwrap(), vec![contract.key()]);
        assert_eq!(db.owned_rows(), 0);
    }

    #[test]
    fn test_write_conflict_is_retriable() {
        let db = MemoryDatabase::new();
        let mut first = db.open_session().unwrap();
        let mut second = db.open_session().unwrap();
        let contract = Contract::new("00000000001", date(2020, 1, 1), None, "r");
        first.contracts().insert(&contract).unwrap();

        let err = second.contracts().update(&contract).unwrap_err();
        assert!(err.is_retriable());

        first.commit().unwrap();
        assert_eq!(second.contracts().update(&contract).unwrap(), 1);
        second.commit().unwrap();
    }

    #[test]
    fn test_begin_twice_fails() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        session.begin(&TxOption::default()).unwrap();
        assert!(session.in_transaction());
        assert!(session.begin(&TxOption::default()).is_err());
        session.commit().unwrap();
        assert!(!session.in_transaction());
    }

    #[test]
    fn test_calculation_targets_filter() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let mut deleted = history("00000000001", "00000000003", PaymentCategory::Caller, 5);
        deleted.df = true;
        let rows = vec![
            history("00000000001", "00000000002", PaymentCategory::Caller, 1),
            history("00000000002", "00000000001", PaymentCategory::Recipient, 31),
            history("00000000002", "00000000001", PaymentCategory::Caller, 2),
            history("00000000001", "00000000002", PaymentCategory::Recipient, 3),
            deleted,
        ];
        session.histories().batch_insert(&rows).unwrap();
        let targets = session
            .histories()
            .get_calculation_targets("00000000001", date(2020, 12, 1), date(2021, 1, 1))
            .unwrap();
        assert_eq!(targets.len(), 2);
        assert!(targets.iter().all(|h| h.payer() == "00000000001"));
    }

    #[test]
    fn test_get_by_contract_respects_contract_period() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let contract =
            Contract::new("00000000001", date(2020, 12, 2), Some(date(2020, 12, 3)), "r");
        session.contracts().insert(&contract).unwrap();
        let rows: Vec<History> = (1..=5)
            .map(|d| history("00000000001", "00000000002", PaymentCategory::Caller, d))
            .collect();
        session.histories().batch_insert(&rows).unwrap();

        let found = session.histories().get_by_contract(&contract.key()).unwrap();
        let days: Vec<u32> = found.iter().map(|h| chrono::Datelike::day(&h.start_time)).collect();
        assert_eq!(days, vec![2, 3]);
    }

    #[test]
    fn test_injected_fault_fires_limited_times() {
        let db = MemoryDatabase::new();
        db.fail_billing_insert("00000000001", true, Some(1));
        let mut session = db.open_session().unwrap();
        let billing = Billing {
            phone_number: "00000000001".to_string(),
            target_month: date(2020, 12, 1),
            basic_charge: 3000,
            metered_charge: 0,
            billing_amount: 3000,
            batch_exec_id: "run".to_string(),
        };
        assert!(session.billings().insert(&billing).unwrap_err().is_retriable());
        assert_eq!(session.billings().insert(&billing).unwrap(), 1);
    }

    #[test]
    fn test_dropped_session_releases_rows() {
        let db = MemoryDatabase::new();
        {
            let mut session = db.open_session().unwrap();
            session
                .contracts()
                .insert(&Contract::new("00000000001", date(2020, 1, 1), None, "r"))
                .unwrap();
        }
        assert_eq!(db.owned_rows(), 0);
        let mut session = db.open_session().unwrap();
        assert_eq!(session.contracts().count().unwrap(), 0);
    }
}
