//! Deletes a random contract, then inserts it back
//!
//! Executions alternate between the two phases. The phase only advances
//! after a commit, so a retried delete works on the same key and a retried
//! insert writes the same row.

use phonebill_core::{
    models::{Contract, ContractKey},
    traits::Session,
    AppError, AppResult, Table, TxLabel,
};
use std::sync::Arc;
use tracing::{debug, warn};

use super::app::LoadGenerator;
use super::key_selector::RandomKeySelector;

#[derive(Debug)]
enum Phase {
    /// Next execution deletes `pending`, picking a key first when it is None
    Delete { pending: Option<ContractKey> },
    /// Next execution inserts the deleted contract back
    Insert { deleted: Contract },
}

pub struct MasterDeleteInsert {
    selector: Arc<RandomKeySelector<ContractKey>>,
    phase: Phase,
    deleting: Option<Contract>,
}

impl MasterDeleteInsert {
    pub fn new(selector: Arc<RandomKeySelector<ContractKey>>) -> Self {
        Self {
            selector,
            phase: Phase::Delete { pending: None },
            deleting: None,
        }
    }

    fn delete(&mut self, session: &mut dyn Session) -> AppResult<()> {
        let Phase::Delete { pending } = &mut self.phase else {
            return Ok(());
        };
        if pending.is_none() {
            *pending = self.selector.get_and_remove();
        }
        let Some(key) = pending.as_ref() else {
            warn!("No contract key to delete");
            return Ok(());
        };
        let contract = session
            .contracts()
            .get(key)?
            .ok_or_else(|| AppError::NotFound(format!("contract {}", key)))?;
        let deleted = session.contracts().delete(key)?;
        debug!(
            "ONLINE_APP: Delete {} record from contracts(phoneNumber = {}, startDate = {})",
            deleted, key.phone_number, key.start_date
        );
        self.deleting = Some(contract);
        Ok(())
    }

    fn insert(&self, session: &mut dyn Session) -> AppResult<()> {
        let Phase::Insert { deleted } = &self.phase else {
            return Ok(());
        };
        let inserted = session.contracts().insert(deleted)?;
        debug!(
            "ONLINE_APP: Insert {} record to contracts(phoneNumber = {}, startDate = {})",
            inserted, deleted.phone_number, deleted.start_date
        );
        Ok(())
    }
}

impl LoadGenerator for MasterDeleteInsert {
    fn name(&self) -> &'static str {
        "MasterDeleteInsertApp"
    }

    fn label(&self) -> TxLabel {
        match self.phase {
            Phase::Delete { .. } => TxLabel::OnlineMasterDelete,
            Phase::Insert { .. } => TxLabel::OnlineMasterInsert,
        }
    }

    fn write_preserve(&self) -> &'static [Table] {
        &[Table::Contracts]
    }

    fn create_data(&mut self, _session: &mut dyn Session) -> AppResult<()> {
        Ok(())
    }

    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()> {
        match self.phase {
            Phase::Delete { .. } => self.delete(session),
            Phase::Insert { .. } => self.insert(session),
        }
    }

    fn after_commit_success(&mut self) {
        match &self.phase {
            Phase::Delete { .. } => {
                if let Some(deleted) = self.deleting.take() {
                    self.phase = Phase::Insert { deleted };
                }
            }
            Phase::Insert { deleted } => {
                self.selector.add(deleted.key());
                self.phase = Phase::Delete { pending: None };
            }
        }
    }
}
