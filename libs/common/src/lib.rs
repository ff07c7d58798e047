//! Shared plumbing for the PLC link workspace
//!
//! Provides:
//! - logging setup (console + daily rolling file)
//! - layered configuration loading (defaults, file, environment)
//! - hex helpers for frame dumps

pub mod config_loader;
pub mod error;
pub mod hex;
pub mod logging;

pub use config_loader::load_config;
pub use error::{Error, Result};
pub use logging::{init_logging, LoggingConfig};
