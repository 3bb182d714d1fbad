//! Recovery Core Library
//!
//! Point-in-time, multi-component backups with a durable on-disk catalog.
//! Each backable subsystem is a [`adapter::ComponentAdapter`]; the
//! [`orchestrator`] captures them into one self-describing backup directory
//! and the [`restore`] coordinator applies a verified subset back.

pub mod adapter;
pub mod catalog;
pub mod config;
pub mod fs;
pub mod ledger;
pub mod locks;
pub mod manager;
pub mod orchestrator;
pub mod recovery;
pub mod restore;
pub mod utils;

// Re-export commonly used types
pub use adapter::{AdapterError, AdapterRegistry, ComponentAdapter};
pub use catalog::{BackupProgress, Catalog, CatalogEntry};
pub use config::Config;
pub use ledger::{BackupDescriptor, BackupStatus, Ledger};
pub use manager::BackupManager;
pub use orchestrator::BackupOrchestrator;
pub use recovery::{ProcedureStatus, RecoveryManager};
pub use restore::{RestoreCoordinator, RestoreReport, VerificationReport};
pub use utils::errors::RecoveryError;
pub type Result<T> = std::result::Result<T, RecoveryError>;
