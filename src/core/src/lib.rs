//! Gantry Core - Foundational Types
//!
//! This module provides the error taxonomy and result alias shared by the
//! gantry image puller crates.

pub mod error;

// Re-export commonly used types
pub use error::{GantryError, Result};

/// Gantry version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
