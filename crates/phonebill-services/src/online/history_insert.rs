//! Inserts new call histories
//!
//! Every application of this kind owns a slice of the one-minute window so
//! that applications never create the same history key.

use chrono::{Duration, NaiveDateTime};
use phonebill_core::{
    models::{History, HistoryKey},
    traits::Session,
    AppResult, Table, TxLabel,
};
use std::collections::HashSet;
use tracing::debug;

use super::app::LoadGenerator;
use crate::constants::CREATE_SCHEDULE_INTERVAL_MILLS;
use crate::testdata::HistoryGenerator;

pub struct HistoryInsert {
    histories: HistoryGenerator,
    records_per_transaction: usize,
    base_time: NaiveDateTime,
    duration_millis: i64,
    keys: HashSet<HistoryKey>,
    pending: Vec<History>,
}

impl HistoryInsert {
    pub fn new(
        histories: HistoryGenerator,
        records_per_transaction: usize,
        base_time: NaiveDateTime,
        duration_millis: i64,
    ) -> Self {
        Self {
            histories,
            records_per_transaction,
            base_time,
            duration_millis,
            keys: HashSet::new(),
            pending: Vec::with_capacity(records_per_transaction),
        }
    }

    pub fn base_time(&self) -> NaiveDateTime {
        self.base_time
    }
}

impl LoadGenerator for HistoryInsert {
    fn name(&self) -> &'static str {
        "HistoryInsertApp"
    }

    fn label(&self) -> TxLabel {
        TxLabel::OnlineHistoryInsert
    }

    fn write_preserve(&self) -> &'static [Table] {
        &[Table::History]
    }

    fn create_data(&mut self, _session: &mut dyn Session) -> AppResult<()> {
        self.pending.clear();
        for _ in 0..self.records_per_transaction {
            let history =
                self.histories
                    .unique_history(self.base_time, self.duration_millis, &mut self.keys)?;
            self.pending.push(history);
        }
        Ok(())
    }

    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()> {
        session.histories().batch_insert(&self.pending)?;
        debug!("ONLINE APP: Insert {} records to history", self.pending.len());
        Ok(())
    }

    fn on_schedule_rebuilt(&mut self, _schedule: &[i64]) -> AppResult<()> {
        // keys of earlier windows can no longer collide
        self.base_time += Duration::milliseconds(CREATE_SCHEDULE_INTERVAL_MILLS);
        self.keys.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testdata::ContractGenerator;
    use chrono::NaiveDate;
    use phonebill_core::config::TestDataConfig;
    use phonebill_core::traits::Database;
    use phonebill_db::MemoryDatabase;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::sync::Arc;

    fn generator(base_time: NaiveDateTime) -> HistoryInsert {
        let contracts = Arc::new(ContractGenerator::new(&TestDataConfig::default(), 0).unwrap());
        let histories = HistoryGenerator::new(contracts, 1000, 3600, StdRng::seed_from_u64(5));
        HistoryInsert::new(histories, 10, base_time, 30_000)
    }

    fn base() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2021, 1, 11).unwrap().and_hms_opt(0, 0, 0).unwrap()
    }

    #[test]
    fn test_histories_stay_in_own_slice() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let mut app = generator(base());

        app.create_data(session.as_mut()).unwrap();
        app.update_database(session.as_mut()).unwrap();
        session.commit().unwrap();

        let inserted = session.histories().get_all().unwrap();
        assert_eq!(inserted.len(), 10);
        let end = base() + Duration::milliseconds(30_000);
        assert!(inserted.iter().all(|h| base() <= h.start_time && h.start_time < end));
    }

    #[test]
    fn test_rebuild_shifts_window_and_forgets_keys() {
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let mut app = generator(base());
        app.create_data(session.as_mut()).unwrap();
        assert_eq!(app.keys.len(), 10);

        app.on_schedule_rebuilt(&[]).unwrap();
        assert!(app.keys.is_empty());
        assert_eq!(app.base_time(), base() + Duration::milliseconds(60_000));
    }
}
