//! Phone Bill Benchmark Database Layer
//!
//! This crate provides the storage backends behind the session traits of
//! `phonebill-core`:
//!
//! - An in-memory backend with row-level write conflicts, used for tests and
//!   for runs without a database server
//! - A PostgreSQL backend on sqlx, driven through a private tokio runtime
//! - Connection pool management

pub mod memory;
pub mod pool;
pub mod postgres;

pub use memory::{MemoryDatabase, MemorySession};
pub use pool::create_pool;
pub use postgres::{PgDatabase, PgSession};

pub use phonebill_core::{AppError, AppResult};

use phonebill_core::config::{DatabaseConfig, DbmsType};
use phonebill_core::traits::Database;
use std::sync::Arc;
use tracing::info;

/// Open the backend selected by the configuration
pub fn connect(config: &DatabaseConfig) -> AppResult<Arc<dyn Database>> {
    let database: Arc<dyn Database> = match config.dbms_type {
        DbmsType::Memory => Arc::new(MemoryDatabase::new()),
        DbmsType::Postgresql => Arc::new(PgDatabase::connect(config)?),
    };
    info!("Using {} backend", database.name());
    Ok(database)
}
