//! Integration tests for the billing batch
//!
//! These tests run the orchestrator against the in-memory backend.

use chrono::NaiveDate;
use phonebill_core::{
    config::{BatchConfig, TransactionScope},
    models::{Billing, Contract, History, PaymentCategory},
    traits::Database,
    TxLabel, TxMode,
};
use phonebill_db::MemoryDatabase;
use phonebill_core::AppError;
use phonebill_services::{
    BatchOrchestrator, CounterName, TransactionRunner, TxCounters, TxStatistics,
};
use rstest::rstest;
use std::collections::HashSet;
use std::sync::Arc;

fn date(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

fn phone(n: usize) -> String {
    format!("{:011}", n)
}

/// `contracts` open-ended contracts with one 30 second call each in December 2020
fn seeded(contracts: usize) -> MemoryDatabase {
    let db = MemoryDatabase::new();
    let mut session = db.open_session().unwrap();
    let rows: Vec<Contract> = (0..contracts)
        .map(|n| Contract::new(phone(n), date(2020, 1, 1), None, "dummy"))
        .collect();
    let histories: Vec<History> = (0..contracts)
        .map(|n| History {
            caller_phone_number: phone(n),
            recipient_phone_number: phone((n + 1) % contracts),
            payment_category: PaymentCategory::Caller,
            start_time: date(2020, 12, 1 + (n % 28) as u32).and_hms_opt(10, 0, 0).unwrap(),
            time_secs: 30,
            charge: None,
            df: false,
        })
        .collect();
    session.contracts().batch_insert(&rows).unwrap();
    session.histories().batch_insert(&histories).unwrap();
    session.commit().unwrap();
    db
}

fn batch_config(threads: usize, shared: bool, scope: TransactionScope) -> BatchConfig {
    BatchConfig {
        target_month: date(2020, 12, 1),
        thread_count: threads,
        shared_connection: shared,
        transaction_scope: scope,
        transaction_option: TxMode::Occ,
    }
}

fn orchestrator(db: &MemoryDatabase, config: BatchConfig) -> (BatchOrchestrator, Arc<TxCounters>) {
    let counters = Arc::new(TxCounters::new());
    let orchestrator = BatchOrchestrator::new(
        Arc::new(db.clone()),
        config,
        TransactionRunner::new(Arc::clone(&counters)),
        Arc::new(TxStatistics::new()),
    );
    (orchestrator, counters)
}

fn billings(db: &MemoryDatabase) -> Vec<Billing> {
    let mut session = db.open_session().unwrap();
    session.billings().get_all().unwrap()
}

#[rstest]
#[case(1, true, TransactionScope::Whole)]
#[case(3, true, TransactionScope::Whole)]
#[case(4, false, TransactionScope::Whole)]
#[case(1, false, TransactionScope::Contract)]
#[case(4, false, TransactionScope::Contract)]
#[case(8, false, TransactionScope::Contract)]
fn test_every_contract_billed_once(
    #[case] threads: usize,
    #[case] shared: bool,
    #[case] scope: TransactionScope,
) {
    let db = seeded(300);
    let (orchestrator, _) = orchestrator(&db, batch_config(threads, shared, scope));

    let result = orchestrator.run().unwrap();

    assert_eq!(result.contracts, 300);
    let rows = billings(&db);
    assert_eq!(rows.len(), 300);
    let phones: HashSet<&str> = rows.iter().map(|b| b.phone_number.as_str()).collect();
    assert_eq!(phones.len(), 300);
    assert!(rows.iter().all(|b| b.batch_exec_id == result.batch_exec_id));
    assert!(rows.iter().all(|b| b.metered_charge == 10 && b.billing_amount == 3000));

    let mut session = db.open_session().unwrap();
    let histories = session.histories().get_all().unwrap();
    assert!(histories.iter().all(|h| h.charge == Some(10)));
    assert_eq!(db.owned_rows(), 0);
}

#[test]
fn test_rerun_replaces_billings_of_month() {
    let db = seeded(50);
    let (orchestrator, _) = orchestrator(&db, batch_config(2, false, TransactionScope::Contract));

    orchestrator.run().unwrap();
    let second = orchestrator.run().unwrap();

    let rows = billings(&db);
    assert_eq!(rows.len(), 50);
    assert!(rows.iter().all(|b| b.batch_exec_id == second.batch_exec_id));
}

#[test]
fn test_fatal_error_rolls_back_whole_run() {
    let db = seeded(200);
    let (first, _) = orchestrator(&db, batch_config(1, true, TransactionScope::Whole));
    let previous = first.run().unwrap();

    db.fail_billing_insert(&phone(120), false, None);
    let (orchestrator, counters) =
        orchestrator(&db, batch_config(4, false, TransactionScope::Whole));
    let err = orchestrator.run().unwrap_err();

    assert!(err.to_string().contains(&phone(120)));
    let rows = billings(&db);
    assert_eq!(rows.len(), 200);
    assert!(rows.iter().all(|b| b.batch_exec_id == previous.batch_exec_id));
    assert_eq!(db.owned_rows(), 0);
    assert_eq!(counters.get(TxLabel::BatchMain, CounterName::Success), 0);
    assert!(counters.get(TxLabel::BatchMain, CounterName::Aborted) > 0);
}

#[test]
fn test_contract_scope_keeps_committed_contracts() {
    let db = seeded(1000);
    let failing = phone(999);
    db.fail_billing_insert(&failing, false, None);
    let (orchestrator, _) = orchestrator(&db, batch_config(4, false, TransactionScope::Contract));

    let err = orchestrator.run().unwrap_err();

    assert!(err.to_string().contains(&failing));
    let rows = billings(&db);
    assert_eq!(rows.len(), 999);
    assert!(rows.iter().all(|b| b.phone_number != failing));
    assert_eq!(db.owned_rows(), 0);
}

#[test]
fn test_retriable_failures_are_retried() {
    let db = seeded(20);
    db.fail_billing_insert(&phone(7), true, Some(3));
    let (orchestrator, counters) =
        orchestrator(&db, batch_config(2, false, TransactionScope::Contract));

    orchestrator.run().unwrap();

    assert_eq!(billings(&db).len(), 20);
    assert_eq!(counters.get(TxLabel::BatchMain, CounterName::Aborted), 3);
    assert_eq!(counters.get(TxLabel::BatchMain, CounterName::Success), 20);
}

#[test]
fn test_negative_call_time_is_fatal() {
    let db = seeded(10);
    let mut session = db.open_session().unwrap();
    let mut history = session.histories().get_all().unwrap().remove(3);
    history.time_secs = -1;
    session.histories().update(&history).unwrap();
    session.commit().unwrap();

    let (orchestrator, _) = orchestrator(&db, batch_config(1, true, TransactionScope::Whole));
    let err = orchestrator.run().unwrap_err();

    assert!(err.to_string().contains("Negative time: -1"));
    assert!(billings(&db).is_empty());
}

#[test]
fn test_empty_month() {
    let db = MemoryDatabase::new();
    let (orchestrator, _) = orchestrator(&db, batch_config(3, false, TransactionScope::Contract));
    assert_eq!(orchestrator.run().unwrap().contracts, 0);
}

#[test]
fn test_contract_scope_on_shared_connection_rejected() {
    let db = seeded(5);
    let (orchestrator, _) = orchestrator(&db, batch_config(2, true, TransactionScope::Contract));

    let err = orchestrator.run().unwrap_err();

    assert!(matches!(err, AppError::Config(_)));
    assert!(billings(&db).is_empty());
    assert_eq!(db.owned_rows(), 0);
}
