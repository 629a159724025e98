//! Inserts contracts for phone numbers that never existed

use phonebill_core::{models::Contract, traits::Session, AppResult, Table, TxLabel};
use std::sync::Arc;
use tracing::debug;

use super::app::LoadGenerator;
use crate::testdata::ContractGenerator;

pub struct MasterInsert {
    contracts: Arc<ContractGenerator>,
    contract: Option<Contract>,
}

impl MasterInsert {
    pub fn new(contracts: Arc<ContractGenerator>) -> Self {
        Self {
            contracts,
            contract: None,
        }
    }
}

impl LoadGenerator for MasterInsert {
    fn name(&self) -> &'static str {
        "MasterInsertApp"
    }

    fn label(&self) -> TxLabel {
        TxLabel::OnlineMasterInsert
    }

    fn write_preserve(&self) -> &'static [Table] {
        &[Table::Contracts]
    }

    fn create_data(&mut self, _session: &mut dyn Session) -> AppResult<()> {
        self.contract = Some(self.contracts.new_contract()?);
        Ok(())
    }

    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()> {
        if let Some(contract) = &self.contract {
            let inserted = session.contracts().insert(contract)?;
            debug!(
                "ONLINE APP: Insert {} record to contracts(phoneNumber = {}, startDate = {})",
                inserted, contract.phone_number, contract.start_date
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use phonebill_core::config::TestDataConfig;
    use phonebill_core::traits::Database;
    use phonebill_db::MemoryDatabase;

    #[test]
    fn test_inserts_next_contract() {
        let generator = ContractGenerator::new(&TestDataConfig::default(), 0)
            .unwrap()
            .starting_at(1000);
        let db = MemoryDatabase::new();
        let mut session = db.open_session().unwrap();
        let mut app = MasterInsert::new(Arc::new(generator));

        for _ in 0..2 {
            app.create_data(session.as_mut()).unwrap();
            app.update_database(session.as_mut()).unwrap();
        }
        session.commit().unwrap();

        let keys = session.contracts().get_all_keys().unwrap();
        let phones: Vec<&str> = keys.iter().map(|k| k.phone_number.as_str()).collect();
        assert_eq!(phones, vec!["00000001000", "00000001001"]);
    }
}
