//! Contract master model
//!
//! A contract binds a phone number to a service period. One phone number may
//! own several contracts as long as their periods never share a month.

use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Primary key of the contracts table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ContractKey {
    /// 11-digit phone number
    pub phone_number: String,

    /// First day of the contract
    pub start_date: NaiveDate,
}

impl ContractKey {
    pub fn new(phone_number: impl Into<String>, start_date: NaiveDate) -> Self {
        Self {
            phone_number: phone_number.into(),
            start_date,
        }
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.phone_number, self.start_date)
    }
}

/// Contract master record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Contract {
    /// 11-digit phone number
    pub phone_number: String,

    /// First day of the contract
    pub start_date: NaiveDate,

    /// Last day of the contract (None if open-ended)
    pub end_date: Option<NaiveDate>,

    /// Charge rule name
    pub charge_rule: String,
}

impl Contract {
    pub fn new(
        phone_number: impl Into<String>,
        start_date: NaiveDate,
        end_date: Option<NaiveDate>,
        charge_rule: impl Into<String>,
    ) -> Self {
        Self {
            phone_number: phone_number.into(),
            start_date,
            end_date,
            charge_rule: charge_rule.into(),
        }
    }

    pub fn key(&self) -> ContractKey {
        ContractKey::new(self.phone_number.clone(), self.start_date)
    }

    /// Check whether the contract is in effect on the given day
    #[inline]
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        self.start_date <= date && self.end_date.map_or(true, |end| end >= date)
    }

    /// Check whether the contract intersects the period `[start, end]`
    #[inline]
    pub fn intersects(&self, start: NaiveDate, end: NaiveDate) -> bool {
        self.start_date <= end && self.end_date.map_or(true, |e| e >= start)
    }

    /// Check whether this contract shares at least one calendar month with any of `others`
    pub fn shares_month_with<'a>(&self, others: impl IntoIterator<Item = &'a Contract>) -> bool {
        let start = epoch_month(Some(self.start_date));
        let end = epoch_month(self.end_date);
        others.into_iter().any(|other| {
            let other_start = epoch_month(Some(other.start_date));
            let other_end = epoch_month(other.end_date);
            start <= other_end && other_start <= end
        })
    }
}

impl Default for Contract {
    fn default() -> Self {
        Self {
            phone_number: "00000000000".to_string(),
            start_date: NaiveDate::MIN,
            end_date: None,
            charge_rule: "dummy".to_string(),
        }
    }
}

/// Months since year 0, open end maps to `i64::MAX`
fn epoch_month(date: Option<NaiveDate>) -> i64 {
    match date {
        Some(d) => d.year() as i64 * 12 + d.month0() as i64,
        None => i64::MAX,
    }
}
