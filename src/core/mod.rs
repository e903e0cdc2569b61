//! Core runtime infrastructure.
//!
//! - `config` - Configuration parsing and validation
//! - `runtime` - Wiring and lifecycle of one gateway instance

pub mod config;
pub mod runtime;

pub use config::*;
pub use runtime::*;
