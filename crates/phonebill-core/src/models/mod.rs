//! Domain models for the phone bill benchmark
//!
//! The three tables of the benchmark schema: contracts, history and billing.

pub mod billing;
pub mod contract;
pub mod history;

pub use billing::{Billing, BillingKey, BillingPeriod};
pub use contract::{Contract, ContractKey};
pub use history::{History, HistoryKey, PaymentCategory};
