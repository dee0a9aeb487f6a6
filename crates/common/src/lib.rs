//! Shared types used across the saga engine crates.

pub mod document;
pub mod types;

pub use document::{Document, merge, merged};
pub use types::SagaId;
