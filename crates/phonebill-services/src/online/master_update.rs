//! Changes the end date of a random contract
//!
//! The new end date is either cleared or drawn from `[start_date, max_date]`.
//! A candidate is only written when it shares no month with the other
//! contracts of the same phone number.

use chrono::{Duration, NaiveDate};
use phonebill_core::{
    models::{Contract, ContractKey},
    traits::Session,
    AppError, AppResult, Table, TxLabel,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

use super::app::LoadGenerator;
use super::key_selector::RandomKeySelector;
use crate::constants::MASTER_UPDATE_MAX_TRIES;

pub struct MasterUpdate {
    selector: Arc<RandomKeySelector<ContractKey>>,
    rng: StdRng,
    max_date: NaiveDate,
}

impl MasterUpdate {
    pub fn new(
        selector: Arc<RandomKeySelector<ContractKey>>,
        rng: StdRng,
        max_date: NaiveDate,
    ) -> Self {
        Self {
            selector,
            rng,
            max_date,
        }
    }

    fn updated_contract(&mut self, contracts: &[Contract]) -> Option<Contract> {
        for _ in 0..MASTER_UPDATE_MAX_TRIES {
            let i = self.rng.gen_range(0..contracts.len());
            let mut contract = contracts[i].clone();
            if self.rng.gen_bool(0.5) {
                contract.end_date = None;
            } else {
                let days = (self.max_date - contract.start_date).num_days().max(0);
                let offset = Duration::days(self.rng.gen_range(0..=days));
                contract.end_date = Some(contract.start_date + offset);
            }
            let others = contracts
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, c)| c);
            if !contract.shares_month_with(others) {
                return Some(contract);
            }
        }
        None
    }
}

impl LoadGenerator for MasterUpdate {
    fn name(&self) -> &'static str {
        "MasterUpdateApp"
    }

    fn label(&self) -> TxLabel {
        TxLabel::OnlineMasterUpdate
    }

    fn write_preserve(&self) -> &'static [Table] {
        &[Table::Contracts]
    }

    fn create_data(&mut self, _session: &mut dyn Session) -> AppResult<()> {
        Ok(())
    }

    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()> {
        let Some(key) = self.selector.get() else {
            warn!("No contract key to select");
            return Ok(());
        };
        let contracts = session.contracts().get_by_phone_number(&key.phone_number)?;
        if contracts.is_empty() {
            warn!("No contract found for phoneNumber = {}", key.phone_number);
            return Ok(());
        }
        let Some(contract) = self.updated_contract(&contracts) else {
            warn!(
                "Fail to create valid update contracts for phone number: {}",
                key.phone_number
            );
            for c in &contracts {
                warn!("   {:?}", c);
            }
            return Ok(());
        };
        let updated = session.contracts().update(&contract)?;
        if updated != 1 {
            return Err(AppError::UnexpectedRowCount {
                expected: 1,
                actual: updated,
                context: format!("update of contract {}", contract.key()),
            });
        }
        debug!(
            "ONLINE_APP: Update 1 record from contracts(phoneNumber = {}, startDate = {}, endDate = {:?})",
            contract.phone_number, contract.start_date, contract.end_date
        );
        Ok(())
    }
}
