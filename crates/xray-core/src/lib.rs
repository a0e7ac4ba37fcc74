//! Core types and utilities for chest X-ray pneumonia classification.
//!
//! This crate provides the error type, domain types, configuration, metric
//! math and logging helpers shared by the dataset, training and tool crates.

pub mod backend;
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use backend::*;
pub use cli::*;
pub use config::*;
pub use error::{Error, ErrorKind, Result, ResultExt};
pub use metrics::*;
pub use types::*;

/// Re-export commonly used burn types
pub mod prelude {
    pub use crate::backend::*;
    pub use crate::config::*;
    pub use crate::error::{Error, ErrorKind, Result, ResultExt};
    pub use crate::metrics::*;
    pub use crate::types::*;
    pub use burn::prelude::*;
}
