//! Export Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared types, storage error taxonomy, and logging for the export fan-out
//! workspace.
//!
//! - **Types**: size tiers, pending/completed data file records, per-command
//!   file state records
//! - **Errors**: [`StorageError`], the transient / non-transient split that
//!   decides whether a writer fault poisons its command
//! - **Logging**: [`logging::init_logging`] and its configuration
//!
//! # Example
//!
//! ```no_run
//! use export_common::types::FileSizeThresholds;
//! use export_common::SizeTier;
//!
//! let thresholds = FileSizeThresholds::default();
//! assert_eq!(thresholds.tier_for(0), SizeTier::Empty);
//! ```

pub mod error;
pub mod logging;
pub mod types;

// Re-export commonly used types
pub use error::StorageError;
pub use types::SizeTier;
