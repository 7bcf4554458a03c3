//! csvetl Pipeline Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Loads delimited files from an input directory into a relational table.
//!
//! # Stages
//!
//! - **Extract**: streams each file into bounded batches of raw records
//! - **Transform**: coerces records to the target column schema, applies transformations
//!   and validates them against the rules
//! - **Load**: commits batches to a [`load::Sink`] with retry and backoff
//! - **Pipeline**: claims files, drives them through the stages and places them in the
//!   archive or error directory
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use csvetl_pipeline::config::PipelineConfig;
//! use csvetl_pipeline::load::PostgresSink;
//! use csvetl_pipeline::pipeline::Orchestrator;
//! use csvetl_pipeline::transform::Extensions;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = PipelineConfig::load(Some("config/csvetl.yaml".as_ref()))?;
//!     let validator = config.validator(&Extensions::default())?;
//!     let sink = PostgresSink::connect(
//!         &config.connect_options(),
//!         config.target.schema.as_deref(),
//!         &config.target.table,
//!         validator.schema(),
//!     )
//!     .await?;
//!
//!     let orchestrator =
//!         Orchestrator::with_validator(&config, validator, Arc::new(sink), CancellationToken::new())?;
//!     let summary = orchestrator.run().await?;
//!     println!("{} archived, {} errored", summary.archived(), summary.errored());
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod extract;
pub mod load;
pub mod pipeline;
pub mod transform;
pub mod types;

pub use error::{EtlError, Result};
pub use types::{FileOutcome, Placement, RecordCounts, RunStatus, RunSummary};
