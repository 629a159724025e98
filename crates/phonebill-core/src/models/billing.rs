//! Billing model and billing period helpers

use chrono::{Datelike, Months, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::error::AppError;

/// Primary key of the billing table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BillingKey {
    pub target_month: NaiveDate,
    pub phone_number: String,
    pub batch_exec_id: String,
}

/// Monthly bill of one phone number, produced by one batch run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Billing {
    /// 11-digit phone number
    pub phone_number: String,

    /// First day of the billed month
    pub target_month: NaiveDate,

    /// Fixed monthly charge
    pub basic_charge: i32,

    /// Sum of call charges
    pub metered_charge: i32,

    /// Amount billed
    pub billing_amount: i32,

    /// Identifier of the batch run that produced this row
    pub batch_exec_id: String,
}

impl Billing {
    pub fn key(&self) -> BillingKey {
        BillingKey {
            target_month: self.target_month,
            phone_number: self.phone_number.clone(),
            batch_exec_id: self.batch_exec_id.clone(),
        }
    }
}

/// Inclusive date range of one billed month
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BillingPeriod {
    /// First day of the month
    pub start: NaiveDate,
    /// Last day of the month
    pub end: NaiveDate,
}

impl BillingPeriod {
    /// Builds the period covering the month that contains `date`
    pub fn of_month(date: NaiveDate) -> Result<Self, AppError> {
        let start = date
            .with_day(1)
            .ok_or_else(|| AppError::InvalidInput(format!("invalid target month: {}", date)))?;
        let end = start
            .checked_add_months(Months::new(1))
            .and_then(|d| d.pred_opt())
            .ok_or_else(|| AppError::InvalidInput(format!("target month out of range: {}", date)))?;
        Ok(Self { start, end })
    }

    /// Day after `end`, the exclusive upper bound for call start times
    pub fn end_exclusive(&self) -> NaiveDate {
        self.end.succ_opt().unwrap_or(NaiveDate::MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("2020-12-15", "2020-12-01", "2020-12-31")]
    #[case("2021-02-01", "2021-02-01", "2021-02-28")]
    #[case("2020-02-29", "2020-02-01", "2020-02-29")]
    fn test_period_of_month(#[case] date: &str, #[case] start: &str, #[case] end: &str) {
        let parse = |s: &str| NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap();
        let period = BillingPeriod::of_month(parse(date)).unwrap();
        assert_eq!(period.start, parse(start));
        assert_eq!(period.end, parse(end));
    }

    #[test]
    fn test_end_exclusive() {
        let month = NaiveDate::from_ymd_opt(2020, 12, 1).unwrap();
        let period = BillingPeriod::of_month(month).unwrap();
        assert_eq!(period.end_exclusive(), NaiveDate::from_ymd_opt(2021, 1, 1).unwrap());
    }
}
