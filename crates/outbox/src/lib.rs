//! Transactional outbox.
//!
//! Messages are never sent to the bus from inside a business transaction.
//! A [`UnitOfWork`] turns every `publish` into an outbox row written with the
//! same transaction as the state change, and the [`Dispatcher`] relays
//! committed rows to the bus afterwards:
//!
//! ```text
//! UnitOfWork::publish ──► outbox row ──(commit)──► Dispatcher ──► MessagePublisher
//! ```
//!
//! Delivery is at-least-once: a crash between the bus send and the
//! `sent_at` update redelivers the batch.

pub mod bus;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod memory;
pub mod memory_bus;
pub mod message;
pub mod postgres;
pub mod store;
pub mod uow;

pub use bus::{Delivery, DeliveryStream, MessagePublisher, MessageSubscriber};
pub use dispatcher::{BatchOutcome, Dispatcher, DispatcherConfig};
pub use engine::Engine;
pub use error::{BusError, OutboxError, Result};
pub use memory::MemoryOutboxStore;
pub use memory_bus::InMemoryBroker;
pub use message::{Message, Metadata};
pub use postgres::PgOutboxStore;
pub use store::{OutboxEntry, OutboxStore};
pub use uow::{UnitOfWork, run_in_tx};
