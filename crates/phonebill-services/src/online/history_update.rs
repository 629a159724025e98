//! Updates one call history of a random contract
//!
//! The history is either logically deleted or gets a new call duration. In
//! both cases its charge is cleared so the next batch prices it again.

use phonebill_core::{
    models::{ContractKey, History},
    traits::Session,
    AppResult, Table, TxLabel,
};
use rand::rngs::StdRng;
use rand::Rng;
use std::sync::Arc;
use tracing::{debug, warn};

use super::app::LoadGenerator;
use super::key_selector::RandomKeySelector;
use crate::constants::HISTORY_UPDATE_MAX_PICKS;

pub struct HistoryUpdate {
    selector: Arc<RandomKeySelector<ContractKey>>,
    rng: StdRng,
    max_call_time_secs: i32,
    skip_database_access: bool,
    history: Option<History>,
}

impl HistoryUpdate {
    pub fn new(
        selector: Arc<RandomKeySelector<ContractKey>>,
        rng: StdRng,
        max_call_time_secs: i32,
        skip_database_access: bool,
    ) -> Self {
        Self {
            selector,
            rng,
            max_call_time_secs,
            skip_database_access,
            history: None,
        }
    }

    fn update(&mut self, history: &mut History) {
        if self.rng.gen_bool(0.5) {
            history.df = true;
        } else {
            history.time_secs = self.rng.gen_range(1..=self.max_call_time_secs.max(1));
        }
        history.charge = None;
    }
}

impl LoadGenerator for HistoryUpdate {
    fn name(&self) -> &'static str {
        "HistoryUpdateApp"
    }

    fn label(&self) -> TxLabel {
        TxLabel::OnlineHistoryUpdate
    }

    fn write_preserve(&self) -> &'static [Table] {
        &[Table::History]
    }

    fn create_data(&mut self, session: &mut dyn Session) -> AppResult<()> {
        self.history = None;
        for _ in 0..HISTORY_UPDATE_MAX_PICKS {
            let Some(key) = self.selector.get() else {
                warn!("No contract key to select");
                return Ok(());
            };
            if self.skip_database_access {
                return Ok(());
            }
            let mut histories = session.histories().get_by_contract(&key)?;
            if histories.is_empty() {
                continue;
            }
            let i = self.rng.gen_range(0..histories.len());
            let mut history = histories.swap_remove(i);
            self.update(&mut history);
            self.history = Some(history);
            return Ok(());
        }
        debug!("No contract with histories found in {} picks", HISTORY_UPDATE_MAX_PICKS);
        Ok(())
    }

    fn update_database(&mut self, session: &mut dyn Session) -> AppResult<()> {
        let Some(history) = &self.history else {
            return Ok(());
        };
        session.histories().update(history)?;
        debug!(
            "ONLINE_APP: Update 1 record from history(callerPhoneNumber = {}, startTime = {})",
            history.caller_phone_number, history.start_time
        );
        Ok(())
    }
}
