//! Phone Bill Benchmark Core Library
//!
//! This crate provides the foundational types, traits, and error handling
//! for the phone bill benchmark. It includes:
//!
//! - Domain models (Contract, History, Billing)
//! - Storage traits the engine is written against
//! - Transaction options and labels
//! - Unified error handling with retriable/fatal classification
//! - Application configuration

pub mod config;
pub mod error;
pub mod models;
pub mod traits;
pub mod tx;

pub use config::AppConfig;
pub use error::{AppError, ErrorKind};
pub use tx::{Table, TxLabel, TxMode, TxOption};

/// Result type alias using AppError
pub type AppResult<T> = Result<T, AppError>;
