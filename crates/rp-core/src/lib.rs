//! # rp-core
//!
//! Core types shared by the repodb crates.
//!
//! This crate provides:
//! - The request-level error type every business operation is normalized to
//! - Configuration types and the YAML configuration loader
//! - Tracing subscriber setup for binaries

pub mod config;
pub mod error;
pub mod logging;

pub use config::{AppConfig, ConfigError, DatabaseConfig, LoggingConfig, TableMap};
pub use error::{AppError, AppResult};
