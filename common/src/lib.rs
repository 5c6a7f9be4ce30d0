//! Shared types and utilities for the USDT exporter
//!
//! This crate holds the parts of USDT handling that need no kernel access:
//! stapsdt note parsing, argument spec parsing and generation of the C
//! argument-reader preamble prepended to instrumentation code.

pub mod args;
pub mod codegen;
pub mod constants;
pub mod error;
pub mod stapsdt;
pub mod types;

// Re-export commonly used types
pub use constants::*;
pub use error::StapsdtError;
pub use types::{UprobeLocation, UsdtNote};
