//! Utility modules for the recovery engine.

pub mod errors;
pub mod atomic;
pub mod logger;

pub use errors::{RecoveryError, Result};
