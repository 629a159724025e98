//! Monthly billing batch
//!
//! The orchestrator queues one work item per contract of the target month
//! and the calculation workers price every call and write one billing row
//! per contract.

pub mod calculator;
pub mod orchestrator;
pub mod queue;
pub mod worker;

pub use calculator::{
    BillingCalculator, CallChargeCalculator, SimpleBillingCalculator, SimpleCallChargeCalculator,
};
pub use orchestrator::{BatchOrchestrator, BatchResult};
pub use queue::{CalculationTarget, WorkItem, WorkQueue};
pub use worker::{calculate, CalculationWorker, SharedSession};
