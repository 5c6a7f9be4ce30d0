//! Recording runtime for tests
//!
//! [`StubRuntime`] resolves a fixed set of probes, never touches the kernel
//! and records every call in a shared [`StubLog`].

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    thread,
    time::Duration,
};

use anyhow::{anyhow, bail, Result};
use usdt_common::UprobeLocation;

use crate::{
    runtime::{Module, Runtime, UprobeSink},
    types::TableEntry,
};

/// Behaviour of a [`StubRuntime`]
#[derive(Clone, Debug)]
pub(crate) struct StubConfig {
    /// (provider, name) of the probes every process exposes
    pub probes: Vec<(String, String)>,
    /// Locations reported per enabled probe
    pub locations_per_probe: usize,
    /// Fail the K-th attach of each module (1-based)
    pub fail_attach_at: Option<usize>,
    /// Symbol whose attach fails
    pub fail_symbol: Option<String>,
    /// Fail to open a context for this pid
    pub fail_open: Option<i32>,
    /// Return no module from compile
    pub fail_compile: bool,
    /// Sleep before each reported location
    pub resolve_delay: Option<Duration>,
    /// Table contents of every module
    pub tables: HashMap<String, Vec<TableEntry>>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            probes: vec![
                ("python".to_string(), "gc__start".to_string()),
                ("python".to_string(), "gc__done".to_string()),
            ],
            locations_per_probe: 1,
            fail_attach_at: None,
            fail_symbol: None,
            fail_open: None,
            fail_compile: false,
            resolve_delay: None,
            tables: HashMap::new(),
        }
    }
}

/// A live attachment
#[derive(Clone, Debug)]
pub(crate) struct StubAttach {
    pub module_id: usize,
    /// Pid the module was compiled for
    pub module_pid: i32,
    /// Pid the uprobe is scoped to
    pub pid: i32,
    pub path: PathBuf,
    /// Hex address or symbol name
    pub target: String,
    pub fn_name: String,
}

/// Everything the stub has been asked to do
#[derive(Clone, Debug, Default)]
pub(crate) struct StubLog {
    pub opened: Vec<i32>,
    pub enabled: Vec<(Option<String>, String, String)>,
    pub sources: Vec<String>,
    pub compiles: usize,
    /// Attachments of modules that have not been closed
    pub attached: Vec<StubAttach>,
    pub closed_modules: usize,
    pub closed_handles: Vec<i32>,
    /// Close calls in order
    pub events: Vec<String>,
}

pub(crate) struct StubRuntime {
    config: StubConfig,
    log: Arc<Mutex<StubLog>>,
    next_module: AtomicUsize,
}

#[derive(Debug)]
pub(crate) struct StubHandle {
    pid: i32,
    enabled: Vec<String>,
}

#[derive(Debug)]
pub(crate) struct StubModule {
    id: usize,
    pid: i32,
    log: Arc<Mutex<StubLog>>,
    attaches: usize,
    fail_attach_at: Option<usize>,
    fail_symbol: Option<String>,
    tables: HashMap<String, Vec<TableEntry>>,
    closed: bool,
}

impl StubRuntime {
    pub fn new(config: StubConfig) -> Self {
        Self {
            config,
            log: Arc::new(Mutex::new(StubLog::default())),
            next_module: AtomicUsize::new(0),
        }
    }

    /// Snapshot of the call log
    pub fn log(&self) -> StubLog {
        self.log.lock().unwrap().clone()
    }

    /// Uprobes currently attached for `pid`
    pub fn live_uprobes(&self, pid: i32) -> usize {
        self.log
            .lock()
            .unwrap()
            .attached
            .iter()
            .filter(|a| a.pid == pid)
            .count()
    }
}

impl Runtime for StubRuntime {
    type Handle = StubHandle;
    type Module = StubModule;

    fn open(&self, pid: i32) -> Result<StubHandle> {
        if self.config.fail_open == Some(pid) {
            bail!("process {} is gone", pid);
        }
        self.log.lock().unwrap().opened.push(pid);
        Ok(StubHandle {
            pid,
            enabled: Vec::new(),
        })
    }

    fn enable_probe(
        &self,
        handle: &mut StubHandle,
        provider: Option<&str>,
        name: &str,
        fn_name: &str,
    ) -> Result<()> {
        let known = self
            .config
            .probes
            .iter()
            .any(|(p, n)| n == name && provider.map_or(true, |provider| provider == p));
        if !known {
            bail!("probe {} not found in pid {}", name, handle.pid);
        }

        self.log.lock().unwrap().enabled.push((
            provider.map(str::to_string),
            name.to_string(),
            fn_name.to_string(),
        ));
        handle.enabled.push(fn_name.to_string());
        Ok(())
    }

    fn generate_preamble(&self, handle: &StubHandle) -> Result<String> {
        let mut preamble = format!("// preamble pid {}\n", handle.pid);
        for fn_name in &handle.enabled {
            preamble.push_str(&format!("// reader {}\n", fn_name));
        }
        Ok(preamble)
    }

    fn compile(&self, source: &str, _cflags: &[String]) -> Option<StubModule> {
        {
            let mut log = self.log.lock().unwrap();
            log.compiles += 1;
            log.sources.push(source.to_string());
        }
        if self.config.fail_compile {
            return None;
        }

        let pid = source
            .strip_prefix("// preamble pid ")
            .and_then(|rest| rest.split_whitespace().next())
            .and_then(|pid| pid.parse().ok())
            .unwrap_or(-1);

        Some(StubModule {
            id: self.next_module.fetch_add(1, Ordering::SeqCst),
            pid,
            log: Arc::clone(&self.log),
            attaches: 0,
            fail_attach_at: self.config.fail_attach_at,
            fail_symbol: self.config.fail_symbol.clone(),
            tables: self.config.tables.clone(),
            closed: false,
        })
    }

    fn foreach_uprobe(&self, handle: &StubHandle, sink: UprobeSink) {
        for fn_name in &handle.enabled {
            for i in 0..self.config.locations_per_probe {
                if let Some(delay) = self.config.resolve_delay {
                    thread::sleep(delay);
                }
                sink(UprobeLocation {
                    path: PathBuf::from("/stub/bin/python3"),
                    fn_name: fn_name.clone(),
                    address: 0x1000 + 0x10 * i as u64,
                    pid: handle.pid,
                });
            }
        }
    }

    fn close(&self, handle: StubHandle) {
        let mut log = self.log.lock().unwrap();
        log.closed_handles.push(handle.pid);
        log.events.push(format!("close handle {}", handle.pid));
    }
}

impl StubModule {
    fn attach(&mut self, path: &Path, target: String, fn_name: &str, pid: i32) -> Result<()> {
        self.attaches += 1;
        if self.fail_attach_at == Some(self.attaches) {
            bail!("stub attach {} failed", self.attaches);
        }

        self.log.lock().unwrap().attached.push(StubAttach {
            module_id: self.id,
            module_pid: self.pid,
            pid,
            path: path.to_path_buf(),
            target,
            fn_name: fn_name.to_string(),
        });
        Ok(())
    }
}

impl Module for StubModule {
    type Program = String;

    fn load_uprobe(&mut self, fn_name: &str) -> Result<String> {
        if self.closed {
            bail!("module is closed");
        }
        Ok(fn_name.to_string())
    }

    fn attach_uprobe_at(
        &mut self,
        program: &String,
        path: &Path,
        address: u64,
        pid: i32,
    ) -> Result<()> {
        self.attach(path, format!("{:#x}", address), program, pid)
    }

    fn attach_uprobe_by_symbol(
        &mut self,
        program: &String,
        path: &Path,
        symbol: &str,
        pid: i32,
    ) -> Result<()> {
        if self.fail_symbol.as_deref() == Some(symbol) {
            bail!("symbol {} not found", symbol);
        }
        self.attach(path, symbol.to_string(), program, pid)
    }

    fn table(&self, name: &str) -> Result<Vec<TableEntry>> {
        self.tables
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("table {} not found", name))
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let mut log = self.log.lock().unwrap();
        log.attached.retain(|a| a.module_id != self.id);
        log.closed_modules += 1;
        log.events.push(format!("close module {}", self.pid));
    }
}
