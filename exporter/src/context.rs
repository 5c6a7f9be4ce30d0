//! Per-process probe contexts
//!
//! A [`ProbeContext`] takes one process from an opened USDT handle to a
//! compiled module with every enabled probe attached:
//!
//! ```text
//! open ─▶ enable_probe* ─▶ compile ─▶ attach_uprobes ─▶ close
//! ```
//!
//! Attachment is all-or-nothing. If any uprobe fails to load or attach the
//! module is closed, so no uprobe stays behind in the target.

use std::{
    collections::HashSet,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::{Context, Result};
use log::{debug, warn};
use thiserror::Error;
use usdt_common::UprobeLocation;

use crate::runtime::{Module, Runtime};

/// Serializes uprobe resolution for every [`ProbeContext`] in the process.
///
/// [`Runtime::foreach_uprobe`] reports locations through a plain function
/// that cannot tell contexts apart, so they are gathered in
/// [`RESOLVED_UPROBES`]. Whoever triggers resolution must hold this lock
/// until the buffer has been drained and reset.
static RESOLUTION_LOCK: Mutex<()> = Mutex::new(());

/// Uprobe locations reported by the runtime, owned by the holder of
/// [`RESOLUTION_LOCK`].
static RESOLVED_UPROBES: Mutex<Vec<UprobeLocation>> = Mutex::new(Vec::new());

/// Errors of the context state machine
#[derive(Error, Debug)]
pub enum ContextError {
    #[error("probe context for pid {0} is closed")]
    Closed(i32),

    #[error("probe {probe} is already enabled for {fn_name}")]
    AlreadyEnabled { probe: String, fn_name: String },

    #[error("probes cannot be enabled after compilation")]
    AlreadyCompiled,

    #[error("probe context for pid {0} has not been compiled")]
    NotCompiled(i32),

    #[error("compiler produced no module for pid {0}")]
    NoModule(i32),
}

/// Lifecycle state of a [`ProbeContext`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    Open,
    Compiled,
    Closed,
}

/// Instrumentation of one process
pub struct ProbeContext<R: Runtime> {
    runtime: Arc<R>,
    pid: i32,
    code: String,
    cflags: Vec<String>,
    handle: Option<R::Handle>,
    state: ContextState,
    enabled: HashSet<(String, String)>,
    module: Option<R::Module>,
}

impl<R: Runtime> fmt::Debug for ProbeContext<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeContext")
            .field("pid", &self.pid)
            .field("state", &self.state)
            .field("enabled", &self.enabled)
            .field("compiled", &self.module.is_some())
            .finish()
    }
}

impl<R: Runtime> ProbeContext<R> {
    /// Open a USDT context for `pid`
    ///
    /// # Arguments
    ///
    /// * `runtime` - Runtime compiling and attaching the instrumentation
    /// * `pid` - Process to instrument
    /// * `code` - Instrumentation source, without argument readers
    /// * `cflags` - Extra compiler flags
    pub fn open(runtime: Arc<R>, pid: i32, code: &str, cflags: &[String]) -> Result<Self> {
        let handle = runtime
            .open(pid)
            .with_context(|| format!("Failed to open USDT context for pid {}", pid))?;

        Ok(Self {
            runtime,
            pid,
            code: code.to_string(),
            cflags: cflags.to_vec(),
            handle: Some(handle),
            state: ContextState::Open,
            enabled: HashSet::new(),
            module: None,
        })
    }

    pub fn pid(&self) -> i32 {
        self.pid
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    /// Enabled (probe, function) pairs
    pub fn enabled(&self) -> &HashSet<(String, String)> {
        &self.enabled
    }

    /// Compiled module, if any
    pub fn module(&self) -> Option<&R::Module> {
        self.module.as_ref()
    }

    pub fn module_mut(&mut self) -> Option<&mut R::Module> {
        self.module.as_mut()
    }

    /// Enable a USDT probe, given as `name` or `provider:name`, and route
    /// its argument reads to `fn_name`
    pub fn enable_probe(&mut self, probe: &str, fn_name: &str) -> Result<()> {
        let handle = match (self.state, self.handle.as_mut()) {
            (ContextState::Closed, _) | (_, None) => {
                return Err(ContextError::Closed(self.pid).into())
            }
            (ContextState::Compiled, _) => return Err(ContextError::AlreadyCompiled.into()),
            (ContextState::Open, Some(handle)) => handle,
        };

        let pair = (probe.to_string(), fn_name.to_string());
        if self.enabled.contains(&pair) {
            return Err(ContextError::AlreadyEnabled {
                probe: pair.0,
                fn_name: pair.1,
            }
            .into());
        }

        let (provider, name) = match probe.split_once(':') {
            Some((provider, name)) => (Some(provider), name),
            None => (None, probe),
        };
        self.runtime
            .enable_probe(handle, provider, name, fn_name)
            .with_context(|| format!("Failed to enable probe {} in pid {}", probe, self.pid))?;

        debug!("Enabled probe {} -> {} in pid {}", probe, fn_name, self.pid);
        self.enabled.insert(pair);
        Ok(())
    }

    /// Compile the instrumentation, prefixed with the argument readers of
    /// the enabled probes. Later calls return the same module.
    pub fn compile(&mut self) -> Result<&R::Module> {
        if self.state == ContextState::Closed {
            return Err(ContextError::Closed(self.pid).into());
        }

        if self.module.is_none() {
            let handle = self.handle.as_ref().ok_or(ContextError::Closed(self.pid))?;
            let preamble = self
                .runtime
                .generate_preamble(handle)
                .with_context(|| {
                    format!("Failed to generate argument readers for pid {}", self.pid)
                })?;
            let source = format!("{}\n{}", preamble, self.code);

            let module = self
                .runtime
                .compile(&source, &self.cflags)
                .ok_or(ContextError::NoModule(self.pid))?;
            self.module = Some(module);
            self.state = ContextState::Compiled;
        }

        Ok(self.module.as_ref().ok_or(ContextError::NotCompiled(self.pid))?)
    }

    /// Attach the compiled programs at every resolved probe location.
    ///
    /// Returns the number of uprobes attached. On failure the module is
    /// closed and the context returns to [`ContextState::Open`].
    pub fn attach_uprobes(&mut self) -> Result<usize> {
        if self.state == ContextState::Closed {
            return Err(ContextError::Closed(self.pid).into());
        }
        let handle = self.handle.as_ref().ok_or(ContextError::Closed(self.pid))?;
        let module = self.module.as_mut().ok_or(ContextError::NotCompiled(self.pid))?;

        let locations = resolve_uprobes(self.runtime.as_ref(), handle);

        if let Err(e) = attach_locations(module, &locations) {
            module.close();
            self.module = None;
            self.state = ContextState::Open;
            return Err(e.context(format!("Failed to attach uprobes to pid {}", self.pid)));
        }

        Ok(locations.len())
    }

    /// Release the module, then the USDT handle. Idempotent.
    pub fn close(&mut self) {
        if self.state == ContextState::Closed {
            return;
        }

        if let Some(mut module) = self.module.take() {
            module.close();
        }
        if let Some(handle) = self.handle.take() {
            self.runtime.close(handle);
        }
        self.state = ContextState::Closed;
        debug!("Closed probe context for pid {}", self.pid);
    }
}

impl<R: Runtime> Drop for ProbeContext<R> {
    fn drop(&mut self) {
        self.close();
    }
}

fn attach_locations<M: Module>(module: &mut M, locations: &[UprobeLocation]) -> Result<()> {
    for location in locations {
        let program = module
            .load_uprobe(&location.fn_name)
            .with_context(|| format!("Failed to load {}", location.fn_name))?;
        module
            .attach_uprobe_at(&program, &location.path, location.address, location.pid)
            .with_context(|| format!("Failed to attach {}", location))?;
        debug!("Attached {}", location);
    }
    Ok(())
}

/// Clears [`RESOLVED_UPROBES`] when dropped
struct ResetResolved;

impl Drop for ResetResolved {
    fn drop(&mut self) {
        let mut resolved = RESOLVED_UPROBES.lock().unwrap_or_else(PoisonError::into_inner);
        if !resolved.is_empty() {
            warn!("Discarding {} unclaimed uprobe locations", resolved.len());
        }
        resolved.clear();
    }
}

fn record_uprobe(location: UprobeLocation) {
    RESOLVED_UPROBES
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(location);
}

/// Resolve, drain and reset under [`RESOLUTION_LOCK`]
fn resolve_uprobes<R: Runtime>(runtime: &R, handle: &R::Handle) -> Vec<UprobeLocation> {
    let _serialized = RESOLUTION_LOCK.lock().unwrap_or_else(PoisonError::into_inner);
    // Declared after the lock guard so the buffer is reset before unlocking
    let _reset = ResetResolved;

    runtime.foreach_uprobe(handle, record_uprobe);

    let mut resolved = RESOLVED_UPROBES.lock().unwrap_or_else(PoisonError::into_inner);
    std::mem::take(&mut *resolved)
}
