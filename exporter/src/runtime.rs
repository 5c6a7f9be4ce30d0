//! Native instrumentation runtime
//!
//! The exporter drives instrumentation through two traits: [`Runtime`]
//! opens per-process USDT contexts and compiles instrumentation source, and
//! [`Module`] is the compiled result, loaded into the kernel and scoped to
//! one process. The production implementation lives in
//! [`crate::loader`]; tests substitute a recording stub.

use std::path::Path;

use anyhow::Result;
use usdt_common::UprobeLocation;

use crate::types::TableEntry;

/// Receives the uprobe locations resolved for a USDT context.
///
/// This is a plain function: the runtime gives no indication of which
/// context a location belongs to, so results must be collected in shared
/// storage. See [`crate::context`].
pub type UprobeSink = fn(UprobeLocation);

/// USDT resolution and compilation
pub trait Runtime: Send + Sync {
    /// Per-process USDT context
    type Handle: Send + Sync;
    /// Compiled instrumentation
    type Module: Module;

    /// Open a USDT context for a process
    fn open(&self, pid: i32) -> Result<Self::Handle>;

    /// Enable the probe `provider:name` (any provider if `None`) and route
    /// its argument reads to `fn_name`. Fails if the process has no such
    /// probe.
    fn enable_probe(
        &self,
        handle: &mut Self::Handle,
        provider: Option<&str>,
        name: &str,
        fn_name: &str,
    ) -> Result<()>;

    /// C source of the argument readers for every enabled probe
    fn generate_preamble(&self, handle: &Self::Handle) -> Result<String>;

    /// Compile instrumentation source. `None` when the compiler produced no
    /// module; the reason is logged by the runtime.
    fn compile(&self, source: &str, cflags: &[String]) -> Option<Self::Module>;

    /// Report every uprobe location of the enabled probes to `sink`
    fn foreach_uprobe(&self, handle: &Self::Handle, sink: UprobeSink);

    /// Release a USDT context
    fn close(&self, handle: Self::Handle);
}

/// Compiled instrumentation loaded for one process
pub trait Module: Send + Sync {
    /// Loaded program descriptor
    type Program;

    /// Load the program named `fn_name` as a uprobe. Loading the same
    /// program twice returns the same descriptor.
    fn load_uprobe(&mut self, fn_name: &str) -> Result<Self::Program>;

    /// Attach a loaded program at a virtual address of `path`
    fn attach_uprobe_at(
        &mut self,
        program: &Self::Program,
        path: &Path,
        address: u64,
        pid: i32,
    ) -> Result<()>;

    /// Attach a loaded program at a symbol of `path`
    fn attach_uprobe_by_symbol(
        &mut self,
        program: &Self::Program,
        path: &Path,
        symbol: &str,
        pid: i32,
    ) -> Result<()>;

    /// Read every row of a table
    fn table(&self, name: &str) -> Result<Vec<TableEntry>>;

    /// Detach and unload everything. Idempotent.
    fn close(&mut self);
}
