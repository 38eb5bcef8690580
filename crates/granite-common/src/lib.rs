//! # Granite Common
//!
//! Common types, errors, and utilities shared across all GraniteDB crates.

pub mod config;
pub mod error;
pub mod metrics;
pub mod types;

pub use config::*;
pub use error::{Error, Result};
pub use types::*;

/// Re-export commonly used external types
pub mod prelude {
    pub use super::config::*;
    pub use super::error::{Error, Result};
    pub use super::types::*;
    pub use tracing::{debug, error, info, trace, warn};
}
