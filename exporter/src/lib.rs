//! USDT Exporter Library
//!
//! Attaches eBPF instrumentation to USDT probes and uprobes of running
//! processes and exposes the contents of its tables as Prometheus metrics.

pub mod collector;
pub mod config;
pub mod context;
pub mod decoder;
pub mod exporter;
pub mod histogram;
pub mod loader;
mod maps;
pub mod process;
pub mod runtime;
pub mod scanner;
pub mod types;

#[cfg(test)]
pub(crate) mod testing;

pub use collector::Exporter;
pub use config::Config;
pub use context::{ContextError, ContextState, ProbeContext};
pub use loader::AyaRuntime;
pub use process::{ProcessError, ProcessLocator};
pub use runtime::{Module, Runtime};
pub use types::*;
