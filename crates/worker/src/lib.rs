//! Worker process support: configuration and telemetry setup.

pub mod config;
pub mod telemetry;

pub use config::{Config, LogFormat};
