//! Charge calculators used by the billing batch

use phonebill_core::{AppError, AppResult};

use crate::constants::{BASIC_CHARGE, CHARGE_PER_MINUTE, FREE_CALL_CHARGE_LIMIT};

/// Computes the charge of one call from its duration
pub trait CallChargeCalculator: Send {
    fn calc(&self, time_secs: i32) -> AppResult<i32>;
}

/// Accumulates call charges of one contract into its monthly bill
pub trait BillingCalculator: Send {
    /// Reset the accumulated charges
    fn init(&mut self);

    fn add_call_charge(&mut self, charge: i32);

    fn basic_charge(&self) -> i32;

    fn metered_charge(&self) -> i32;

    fn billing_amount(&self) -> i32;
}

/// 10 per started minute, at least 10
#[derive(Debug, Clone, Copy, Default)]
pub struct SimpleCallChargeCalculator;

impl CallChargeCalculator for SimpleCallChargeCalculator {
    fn calc(&self, time_secs: i32) -> AppResult<i32> {
        if time_secs < 0 {
            return Err(AppError::NegativeCallTime(time_secs));
        }
        if time_secs < 60 {
            return Ok(CHARGE_PER_MINUTE);
        }
        Ok(((time_secs - 1) / 60 + 1) * CHARGE_PER_MINUTE)
    }
}

/// Flat basic charge, metered part billed on top once it passes the free limit
#[derive(Debug, Clone, Default)]
pub struct SimpleBillingCalculator {
    total_call_charge: i32,
}

impl BillingCalculator for SimpleBillingCalculator {
    fn init(&mut self) {
        self.total_call_charge = 0;
    }

    fn add_call_charge(&mut self, charge: i32) {
        self.total_call_charge += charge;
    }

    fn basic_charge(&self) -> i32 {
        BASIC_CHARGE
    }

    fn metered_charge(&self) -> i32 {
        self.total_call_charge
    }

    fn billing_amount(&self) -> i32 {
        if self.total_call_charge < FREE_CALL_CHARGE_LIMIT {
            BASIC_CHARGE
        } else {
            self.total_call_charge + BASIC_CHARGE - FREE_CALL_CHARGE_LIMIT
        }
    }
}
