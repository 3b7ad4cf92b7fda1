//! Export Fan-out Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Splits per-agent export data files into per-command outputs.
//!
//! - **Processor**: a pool of worker instances, each pulling data files from
//!   the size tiers it is assigned and fanning their rows out to one writer
//!   per command
//! - **Collaborators**: the queue, lock, file system, writer and sink
//!   contracts the processor runs against
//! - **Local**: file system and in-memory implementations of those contracts
//!
//! # Example
//!
//! ```no_run
//! use export_fanout::config::{FileProcessorConfig, LocalConfig};
//! use export_fanout::local;
//! use export_fanout::processor::FileProcessor;
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = FileProcessorConfig::from_env()?;
//!     let local = LocalConfig::from_env()?;
//!     let deps = local::collaborators(&config, &local).await?;
//!
//!     let processor = Arc::new(FileProcessor::new(config, deps.collaborators)?);
//!     let cancel = CancellationToken::new();
//!     for handle in processor.start(cancel.clone()) {
//!         handle.await?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod collaborators;
pub mod config;
pub mod error;
pub mod local;
pub mod processor;

pub use config::FileProcessorConfig;
pub use error::StreamError;
pub use processor::{Collaborators, FileProcessor, ProcessingResult};
