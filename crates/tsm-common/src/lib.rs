//! TSM Common Library
#![deny(clippy::unwrap_used, clippy::expect_used)]
//!
//! Shared building blocks for the TSM migration workspace.
//!
//! # Overview
//!
//! - **Error Handling**: [`CommonError`] and the crate [`Result`] alias
//! - **Logging**: tracing subscriber configuration shared by every binary
//! - **Identity**: the stable row identity digest used as the progress key
//!
//! # Example
//!
//! ```no_run
//! use tsm_common::identity::RowIdentity;
//!
//! let id = RowIdentity::derive(1, "data/plant.csv", 7);
//! assert_eq!(id.as_str().len(), 43);
//! ```

pub mod error;
pub mod identity;
pub mod logging;

// Re-export commonly used types
pub use error::{CommonError, Result};
pub use identity::RowIdentity;
