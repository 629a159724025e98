//! Call history model

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::AppError;

/// Who pays for a call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PaymentCategory {
    /// Caller pays (`C`)
    Caller,
    /// Recipient pays (`R`)
    Recipient,
}

impl PaymentCategory {
    pub fn code(&self) -> &'static str {
        match self {
            PaymentCategory::Caller => "C",
            PaymentCategory::Recipient => "R",
        }
    }

    pub fn from_code(code: &str) -> Result<Self, AppError> {
        match code {
            "C" => Ok(PaymentCategory::Caller),
            "R" => Ok(PaymentCategory::Recipient),
            other => Err(AppError::InvalidData(format!(
                "unknown payment category: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for PaymentCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Primary key of the history table
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HistoryKey {
    pub caller_phone_number: String,
    pub start_time: NaiveDateTime,
}

/// Call history record
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct History {
    /// Caller phone number
    pub caller_phone_number: String,

    /// Recipient phone number
    pub recipient_phone_number: String,

    /// Who pays for the call
    pub payment_category: PaymentCategory,

    /// Call start timestamp
    pub start_time: NaiveDateTime,

    /// Call duration in seconds
    pub time_secs: i32,

    /// Computed charge (None until the batch prices the call)
    pub charge: Option<i32>,

    /// Logical delete flag
    pub df: bool,
}

impl History {
    pub fn key(&self) -> HistoryKey {
        HistoryKey {
            caller_phone_number: self.caller_phone_number.clone(),
            start_time: self.start_time,
        }
    }

    /// Phone number of the party billed for this call
    #[inline]
    pub fn payer(&self) -> &str {
        match self.payment_category {
            PaymentCategory::Caller => &self.caller_phone_number,
            PaymentCategory::Recipient => &self.recipient_phone_number,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn sample(category: PaymentCategory) -> History {
        History {
            caller_phone_number: "00000000001".to_string(),
            recipient_phone_number: "00000000002".to_string(),
            payment_category: category,
            start_time: NaiveDate::from_ymd_opt(2020, 12, 1)
                .unwrap()
                .and_hms_opt(10, 0, 0)
                .unwrap(),
            time_secs: 61,
            charge: None,
            df: false,
        }
    }

    #[test]
    fn test_payer_follows_category() {
        assert_eq!(sample(PaymentCategory::Caller).payer(), "00000000001");
        assert_eq!(sample(PaymentCategory::Recipient).payer(), "00000000002");
    }

    #[test]
    fn test_category_codes() {
        assert_eq!(PaymentCategory::from_code("C").unwrap(), PaymentCategory::Caller);
        assert_eq!(PaymentCategory::Recipient.code(), "R");
        assert!(PaymentCategory::from_code("X").is_err());
    }
}
