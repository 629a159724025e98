//! PostgreSQL storage backend
//!
//! Sessions are synchronous. Each one owns a handle to a shared tokio runtime
//! and blocks on the sqlx futures, holding at most one open
//! `Transaction<'static, Postgres>` taken from the pool. LTX mode is emulated
//! by locking the write set at the start of the transaction.

use chrono::{NaiveDate, NaiveDateTime};
use phonebill_core::{
    config::{DatabaseConfig, IsolationLevel},
    models::{Billing, Contract, ContractKey, History, PaymentCategory},
    traits::{BillingDao, ContractDao, Database, HistoryDao, Session},
    AppError, AppResult, TxMode, TxOption,
};
use sqlx::{PgPool, Postgres, Transaction};
use std::sync::Arc;
use tokio::runtime::Runtime;
use tracing::{debug, error, info, trace};

use crate::pool::create_pool;

const DDL: &[&str] = &[
    "DROP TABLE IF EXISTS history",
    "DROP TABLE IF EXISTS contracts",
    "DROP TABLE IF EXISTS billing",
    r#"CREATE TABLE history (
        caller_phone_number VARCHAR(15) NOT NULL,
        recipient_phone_number VARCHAR(15) NOT NULL,
        payment_category CHAR(1) NOT NULL,
        start_time TIMESTAMP NOT NULL,
        time_secs INTEGER NOT NULL,
        charge INTEGER,
        df BOOLEAN NOT NULL DEFAULT FALSE,
        PRIMARY KEY (caller_phone_number, start_time)
    )"#,
    "CREATE INDEX idx_df ON history(df)",
    "CREATE INDEX idx_st ON history(start_time)",
    "CREATE INDEX idx_rp ON history(recipient_phone_number, payment_category, start_time)",
    r#"CREATE TABLE contracts (
        phone_number VARCHAR(15) NOT NULL,
        start_date DATE NOT NULL,
        end_date DATE,
        charge_rule VARCHAR(255) NOT NULL,
        PRIMARY KEY (phone_number, start_date)
    )"#,
    r#"CREATE TABLE billing (
        phone_number VARCHAR(15) NOT NULL,
        target_month DATE NOT NULL,
        basic_charge INTEGER NOT NULL,
        metered_charge INTEGER NOT NULL,
        billing_amount INTEGER NOT NULL,
        batch_exec_id VARCHAR(36) NOT NULL,
        PRIMARY KEY (target_month, phone_number, batch_exec_id)
    )"#,
];

/// Database row for contracts
#[derive(Debug, sqlx::FromRow)]
struct ContractRow {
    phone_number: String,
    start_date: NaiveDate,
    end_date: Option<NaiveDate>,
    charge_rule: String,
}

impl From<ContractRow> for Contract {
    fn from(row: ContractRow) -> Self {
        Contract {
            phone_number: row.phone_number,
            start_date: row.start_date,
            end_date: row.end_date,
            charge_rule: row.charge_rule,
        }
    }
}

/// Database row for history
#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    caller_phone_number: String,
    recipient_phone_number: String,
    payment_category: String,
    start_time: NaiveDateTime,
    time_secs: i32,
    charge: Option<i32>,
    df: bool,
}

impl TryFrom<HistoryRow> for History {
    type Error = AppError;

    fn try_from(row: HistoryRow) -> Result<Self, Self::Error> {
        Ok(History {
            caller_phone_number: row.caller_phone_number,
            recipient_phone_number: row.recipient_phone_number,
            payment_category: PaymentCategory::from_code(row.payment_category.trim())?,
            start_time: row.start_time,
            time_secs: row.time_secs,
            charge: row.charge,
            df: row.df,
        })
    }
}

fn into_histories(rows: Vec<HistoryRow>) -> AppResult<Vec<History>> {
    rows.into_iter().map(History::try_from).collect()
}

/// Database row for billing
#[derive(Debug, sqlx::FromRow)]
struct BillingRow {
    phone_number: String,
    target_month: NaiveDate,
    basic_charge: i32,
    metered_charge: i32,
    billing_amount: i32,
    batch_exec_id: String,
}

impl From<BillingRow> for Billing {
    fn from(row: BillingRow) -> Self {
        Billing {
            phone_number: row.phone_number,
            target_month: row.target_month,
            basic_charge: row.basic_charge,
            metered_charge: row.metered_charge,
            billing_amount: row.billing_amount,
            batch_exec_id: row.batch_exec_id,
        }
    }
}

/// PostgreSQL backend
pub struct PgDatabase {
    runtime: Arc<Runtime>,
    pool: PgPool,
    isolation_level: IsolationLevel,
}

impl PgDatabase {
    /// Start the runtime and connect the pool
    pub fn connect(config: &DatabaseConfig) -> AppResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("phonebill-sqlx")
            .build()?;
        let pool = runtime.block_on(create_pool(config))?;
        Ok(Self {
            runtime: Arc::new(runtime),
            pool,
            isolation_level: config.isolation_level,
        })
    }
}

impl Database for PgDatabase {
    fn name(&self) -> &'static str {
        "postgresql"
    }

    fn open_session(&self) -> AppResult<Box<dyn Session>> {
        Ok(Box::new(PgSession {
            runtime: Arc::clone(&self.runtime),
            pool: self.pool.clone(),
            isolation_level: self.isolation_level,
            tx: None,
        }))
    }

    fn create_tables(&self) -> AppResult<()> {
        self.runtime.block_on(async {
            let mut tx = self.pool.begin().await?;
            for statement in DDL {
                debug!("Executing: {}", statement);
                sqlx::query(statement).execute(&mut *tx).await?;
            }
            tx.commit().await?;
            Ok::<_, sqlx::Error>(())
        })?;
        info!("Tables created");
        Ok(())
    }
}

/// Session on a [`PgDatabase`]
pub struct PgSession {
    runtime: Arc<Runtime>,
    pool: PgPool,
    isolation_level: IsolationLevel,
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgSession {
    fn start(&mut self, option: &TxOption) -> AppResult<()> {
        let isolation = format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            self.isolation_level.as_sql()
        );
        let lock = match option.mode {
            TxMode::Ltx if !option.write_preserve.is_empty() => {
                let tables: Vec<&str> =
                    option.write_preserve.iter().map(|t| t.table_name()).collect();
                Some(format!(
                    "LOCK TABLE {} IN SHARE ROW EXCLUSIVE MODE",
                    tables.join(", ")
                ))
            }
            _ => None,
        };
        let pool = self.pool.clone();
        let tx = self.runtime.block_on(async move {
            let mut tx = pool.begin().await?;
            sqlx::query(&isolation).execute(&mut *tx).await?;
            if let Some(lock) = &lock {
                sqlx::query(lock).execute(&mut *tx).await?;
            }
            Ok::<_, sqlx::Error>(tx)
        })?;
        trace!("Transaction started: {}", option);
        self.tx = Some(tx);
        Ok(())
    }

    /// Runtime handle and the open transaction, starting one if needed
    fn active(&mut self) -> AppResult<(Arc<Runtime>, &mut Transaction<'static, Postgres>)> {
        if self.tx.is_none() {
            self.start(&TxOption::default())?;
        }
        let runtime = Arc::clone(&self.runtime);
        let tx = self
            .tx
            .as_mut()
            .ok_or_else(|| AppError::Internal("transaction was not started".to_string()))?;
        Ok((runtime, tx))
    }
}

impl ContractDao for PgSession {
    fn batch_insert(&mut self, contracts: &[Contract]) -> AppResult<u64> {
        let mut inserted = 0;
        for contract in contracts {
            inserted += ContractDao::insert(self, contract)?;
        }
        Ok(inserted)
    }

    fn insert(&mut self, contract: &Contract) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query(
                "INSERT INTO contracts (phone_number, start_date, end_date, charge_rule) VALUES ($1, $2, $3, $4)",
            )
            .bind(&contract.phone_number)
            .bind(contract.start_date)
            .bind(contract.end_date)
            .bind(&contract.charge_rule)
            .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn update(&mut self, contract: &Contract) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query(
                "UPDATE contracts SET end_date = $3, charge_rule = $4 WHERE phone_number = $1 AND start_date = $2",
            )
            .bind(&contract.phone_number)
            .bind(contract.start_date)
            .bind(contract.end_date)
            .bind(&contract.charge_rule)
            .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn delete(&mut self, key: &ContractKey) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query("DELETE FROM contracts WHERE phone_number = $1 AND start_date = $2")
                .bind(&key.phone_number)
                .bind(key.start_date)
                .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn get(&mut self, key: &ContractKey) -> AppResult<Option<Contract>> {
        let (rt, tx) = self.active()?;
        let row = rt.block_on(
            sqlx::query_as::<_, ContractRow>(
                "SELECT phone_number, start_date, end_date, charge_rule FROM contracts WHERE phone_number = $1 AND start_date = $2",
            )
            .bind(&key.phone_number)
            .bind(key.start_date)
            .fetch_optional(&mut **tx),
        )?;
        Ok(row.map(Contract::from))
    }

    fn get_by_phone_number(&mut self, phone_number: &str) -> AppResult<Vec<Contract>> {
        let (rt, tx) = self.active()?;
        let rows = rt.block_on(
            sqlx::query_as::<_, ContractRow>(
                "SELECT phone_number, start_date, end_date, charge_rule FROM contracts WHERE phone_number = $1 ORDER BY start_date",
            )
            .bind(phone_number)
            .fetch_all(&mut **tx),
        )?;
        Ok(rows.into_iter().map(Contract::from).collect())
    }

    fn get_by_date_range(&mut self, start: NaiveDate, end: NaiveDate) -> AppResult<Vec<Contract>> {
        let (rt, tx) = self.active()?;
        let rows = rt.block_on(
            sqlx::query_as::<_, ContractRow>(
                r#"
                SELECT phone_number, start_date, end_date, charge_rule
                FROM contracts
                WHERE start_date <= $2 AND (end_date IS NULL OR end_date >= $1)
                ORDER BY phone_number, start_date
                "#,
            )
            .bind(start)
            .bind(end)
            .fetch_all(&mut **tx),
        )?;
        Ok(rows.into_iter().map(Contract::from).collect())
    }

    fn get_all_keys(&mut self) -> AppResult<Vec<ContractKey>> {
        let (rt, tx) = self.active()?;
        let rows: Vec<(String, NaiveDate)> = rt.block_on(
            sqlx::query_as(
                "SELECT phone_number, start_date FROM contracts ORDER BY phone_number, start_date",
            )
            .fetch_all(&mut **tx),
        )?;
        Ok(rows
            .into_iter()
            .map(|(phone_number, start_date)| ContractKey::new(phone_number, start_date))
            .collect())
    }

    fn count(&mut self) -> AppResult<i64> {
        let (rt, tx) = self.active()?;
        let count: (i64,) =
            rt.block_on(sqlx::query_as("SELECT COUNT(*) FROM contracts").fetch_one(&mut **tx))?;
        Ok(count.0)
    }
}

const HISTORY_COLUMNS: &str = "caller_phone_number, recipient_phone_number, payment_category, start_time, time_secs, charge, df";

impl HistoryDao for PgSession {
    fn batch_insert(&mut self, histories: &[History]) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let sql = format!(
            "INSERT INTO history ({}) VALUES ($1, $2, $3, $4, $5, $6, $7)",
            HISTORY_COLUMNS
        );
        rt.block_on(async {
            let mut inserted = 0;
            for history in histories {
                inserted += sqlx::query(&sql)
                    .bind(&history.caller_phone_number)
                    .bind(&history.recipient_phone_number)
                    .bind(history.payment_category.code())
                    .bind(history.start_time)
                    .bind(history.time_secs)
                    .bind(history.charge)
                    .bind(history.df)
                    .execute(&mut **tx)
                    .await?
                    .rows_affected();
            }
            Ok::<_, sqlx::Error>(inserted)
        })
        .map_err(AppError::from)
    }

    fn batch_update(&mut self, histories: &[History]) -> AppResult<u64> {
        let mut updated = 0;
        for history in histories {
            updated += HistoryDao::update(self, history)?;
        }
        Ok(updated)
    }

    fn update(&mut self, history: &History) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query(
                r#"
                UPDATE history
                SET recipient_phone_number = $3, payment_category = $4, time_secs = $5, charge = $6, df = $7
                WHERE caller_phone_number = $1 AND start_time = $2
                "#,
            )
            .bind(&history.caller_phone_number)
            .bind(history.start_time)
            .bind(&history.recipient_phone_number)
            .bind(history.payment_category.code())
            .bind(history.time_secs)
            .bind(history.charge)
            .bind(history.df)
            .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn get_by_contract(&mut self, key: &ContractKey) -> AppResult<Vec<History>> {
        let (rt, tx) = self.active()?;
        let sql = format!(
            r#"
            SELECT {cols} FROM history h
            WHERE h.caller_phone_number = $1
              AND h.start_time >= $2::date
              AND EXISTS (
                SELECT 1 FROM contracts c
                WHERE c.phone_number = $1 AND c.start_date = $2
                  AND (c.end_date IS NULL OR h.start_time < c.end_date + 1)
              )
            ORDER BY h.start_time
            "#,
            cols = HISTORY_COLUMNS
        );
        let rows = rt.block_on(
            sqlx::query_as::<_, HistoryRow>(&sql)
                .bind(&key.phone_number)
                .bind(key.start_date)
                .fetch_all(&mut **tx),
        )?;
        into_histories(rows)
    }

    fn get_calculation_targets(
        &mut self,
        phone_number: &str,
        start: NaiveDate,
        end_exclusive: NaiveDate,
    ) -> AppResult<Vec<History>> {
        let (rt, tx) = self.active()?;
        let sql = format!(
            r#"
            SELECT {cols} FROM history
            WHERE start_time >= $2::date AND start_time < $3::date
              AND ((caller_phone_number = $1 AND payment_category = 'C')
                OR (recipient_phone_number = $1 AND payment_category = 'R'))
              AND df = FALSE
            ORDER BY caller_phone_number, start_time
            "#,
            cols = HISTORY_COLUMNS
        );
        let rows = rt.block_on(
            sqlx::query_as::<_, HistoryRow>(&sql)
                .bind(phone_number)
                .bind(start)
                .bind(end_exclusive)
                .fetch_all(&mut **tx),
        )?;
        into_histories(rows)
    }

    fn get_all(&mut self) -> AppResult<Vec<History>> {
        let (rt, tx) = self.active()?;
        let sql = format!(
            "SELECT {} FROM history ORDER BY caller_phone_number, start_time",
            HISTORY_COLUMNS
        );
        let rows = rt.block_on(sqlx::query_as::<_, HistoryRow>(&sql).fetch_all(&mut **tx))?;
        into_histories(rows)
    }

    fn delete_all(&mut self) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(sqlx::query("DELETE FROM history").execute(&mut **tx))?;
        Ok(result.rows_affected())
    }

    fn count(&mut self) -> AppResult<i64> {
        let (rt, tx) = self.active()?;
        let count: (i64,) =
            rt.block_on(sqlx::query_as("SELECT COUNT(*) FROM history").fetch_one(&mut **tx))?;
        Ok(count.0)
    }

    fn get_max_start_time(&mut self) -> AppResult<Option<NaiveDateTime>> {
        let (rt, tx) = self.active()?;
        let max: (Option<NaiveDateTime>,) = rt.block_on(
            sqlx::query_as("SELECT MAX(start_time) FROM history").fetch_one(&mut **tx),
        )?;
        Ok(max.0)
    }
}

impl BillingDao for PgSession {
    fn insert(&mut self, billing: &Billing) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query(
                r#"
                INSERT INTO billing (phone_number, target_month, basic_charge, metered_charge, billing_amount, batch_exec_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(&billing.phone_number)
            .bind(billing.target_month)
            .bind(billing.basic_charge)
            .bind(billing.metered_charge)
            .bind(billing.billing_amount)
            .bind(&billing.batch_exec_id)
            .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn delete_by_month(&mut self, target_month: NaiveDate) -> AppResult<u64> {
        let (rt, tx) = self.active()?;
        let result = rt.block_on(
            sqlx::query("DELETE FROM billing WHERE target_month = $1")
                .bind(target_month)
                .execute(&mut **tx),
        )?;
        Ok(result.rows_affected())
    }

    fn get_all(&mut self) -> AppResult<Vec<Billing>> {
        let (rt, tx) = self.active()?;
        let rows = rt.block_on(
            sqlx::query_as::<_, BillingRow>(
                r#"
                SELECT phone_number, target_month, basic_charge, metered_charge, billing_amount, batch_exec_id
                FROM billing
                ORDER BY target_month, phone_number, batch_exec_id
                "#,
            )
            .fetch_all(&mut **tx),
        )?;
        Ok(rows.into_iter().map(Billing::from).collect())
    }
}

impl Session for PgSession {
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
        if self.tx.is_some() {
            return Err(AppError::Transaction(
                "session already has an open transaction".to_string(),
            ));
        }
        self.start(option)
    }

    fn commit(&mut self) -> AppResult<()> {
        if let Some(tx) = self.tx.take() {
            self.runtime.block_on(tx.commit())?;
        }
        Ok(())
    }

    fn rollback(&mut self) -> AppResult<()> {
        if let Some(tx) = self.tx.take() {
            self.runtime.block_on(tx.rollback())?;
        }
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.tx.is_some()
    }

    fn close(&mut self) -> AppResult<()> {
        self.rollback()
    }
}

impl Drop for PgSession {
    fn drop(&mut self) {
        // the connection must go back to the pool inside the runtime
        if let Some(tx) = self.tx.take() {
            if let Err(e) = self.runtime.block_on(tx.rollback()) {
                error!("Failed to roll back on session drop: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonebill_core::{Table, TxLabel};

    fn connect() -> PgDatabase {
        let mut config = DatabaseConfig::default();
        if let Ok(url) = std::env::var("DATABASE_URL") {
            config.url = url;
        }
        PgDatabase::connect(&config).unwrap()
    }

    #[test]
    fn test_history_row_conversion() {
        let row = HistoryRow {
            caller_phone_number: "00000000001".to_string(),
            recipient_phone_number: "00000000002".to_string(),
            payment_category: "R".to_string(),
            start_time: NaiveDate::from_ymd_opt(2020, 12, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            time_secs: 61,
            charge: None,
            df: false,
        };
        let history = History::try_from(row).unwrap();
        assert_eq!(history.payment_category, PaymentCategory::Recipient);
        assert_eq!(history.payer(), "00000000002");
    }

    #[test]
    fn test_history_row_rejects_unknown_category() {
        let row = HistoryRow {
            caller_phone_number: "00000000001".to_string(),
            recipient_phone_number: "00000000002".to_string(),
            payment_category: "X".to_string(),
            start_time: NaiveDate::from_ymd_opt(2020, 12, 1)
                .unwrap()
                .and_hms_opt(0, 0, 0)
                .unwrap(),
            time_secs: 1,
            charge: None,
            df: false,
        };
        assert!(History::try_from(row).is_err());
    }

    #[test]
    #[ignore] // Requires database
    fn test_contract_round_trip() {
        let db = connect();
        db.create_tables().unwrap();
        let mut session = db.open_session().unwrap();
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let contract = Contract::new("00000000001", start, None, "rule");
        session.contracts().insert(&contract).unwrap();
        session.commit().unwrap();

        let found = session.contracts().get(&contract.key()).unwrap();
        assert_eq!(found, Some(contract));
        session.commit().unwrap();
    }

    #[test]
    #[ignore] // Requires database
    fn test_ltx_locks_write_set() {
        let db = connect();
        db.create_tables().unwrap();
        let mut session = db.open_session().unwrap();
        session
            .begin(&TxOption::ltx(0, TxLabel::Test, &[Table::History, Table::Billing]))
            .unwrap();
        assert!(session.in_transaction());
        assert!(session.begin(&TxOption::default()).is_err());
        session.rollback().unwrap();
        assert!(!session.in_transaction());
    }
}
