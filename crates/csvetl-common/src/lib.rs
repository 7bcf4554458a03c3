//! csvetl Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared utilities and error handling for the csvetl workspace.
//!
//! # Overview
//!
//! - **Error Handling**: Common error type and result alias
//! - **Checksums**: SHA-256 fingerprints for source files
//! - **Logging**: Tracing subscriber setup (console, rolling file, JSON)
//!
//! # Example
//!
//! ```no_run
//! use csvetl_common::checksum::fingerprint_file;
//! use csvetl_common::Result;
//!
//! fn describe(path: &str) -> Result<()> {
//!     let fingerprint = fingerprint_file(path)?;
//!     tracing::info!(%fingerprint, "fingerprinted source file");
//!     Ok(())
//! }
//! ```

pub mod checksum;
pub mod error;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
