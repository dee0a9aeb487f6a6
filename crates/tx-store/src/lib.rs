//! Transactional store abstraction.
//!
//! Everything above this crate (the outbox, the saga state store, the unit of
//! work) is written against [`Database`] and [`Transaction`], never against a
//! concrete driver. Two backends are provided:
//!
//! - [`PgDatabase`]: PostgreSQL through `sqlx`
//! - [`MemoryDatabase`]: serialized in-memory transactions for tests

pub mod database;
pub mod error;
pub mod memory;
pub mod postgres;

pub use database::{Database, Transaction};
pub use error::{Result, StoreError};
pub use memory::{MemoryDatabase, MemoryTables, MemoryTransaction};
pub use postgres::{PgDatabase, PgTransaction};
