//! Aya-backed instrumentation runtime
//!
//! Resolves USDT probes from the stapsdt notes of a process's mapped
//! binaries, compiles instrumentation source with clang and loads the
//! resulting object with aya. Enabled probes with a semaphore have it
//! incremented in the target so that the probe sites actually fire.

use std::{
    collections::HashSet,
    fs::{self, OpenOptions},
    os::{fd::AsFd, unix::fs::FileExt},
    path::{Path, PathBuf},
    process::Command,
    sync::{Mutex, PoisonError},
};

use anyhow::{bail, Context, Result};
use aya::{maps::Map, programs::UProbe, Ebpf, EbpfLoader};
use aya_log::EbpfLogger;
use log::{debug, error, info, warn};
use usdt_common::{
    args::{parse_args, ArgSpec},
    codegen::{generate_preamble, EnabledProbe, ProbeSite},
    stapsdt::{file_offset, parse_notes, vaddr_to_offset},
    StapsdtError, UprobeLocation, UsdtNote, PROC_ROOT,
};

use crate::{
    maps,
    runtime::{Module, Runtime, UprobeSink},
    types::TableEntry,
};

/// Runtime compiling with clang and loading with aya
#[derive(Debug, Clone)]
pub struct AyaRuntime {
    clang: PathBuf,
    proc_root: PathBuf,
}

impl AyaRuntime {
    /// Create a runtime compiling with the given clang binary
    pub fn new(clang: impl Into<PathBuf>) -> Self {
        Self {
            clang: clang.into(),
            proc_root: PathBuf::from(PROC_ROOT),
        }
    }

    /// Read process state from a procfs mounted elsewhere
    pub fn with_proc_root(mut self, proc_root: impl Into<PathBuf>) -> Self {
        self.proc_root = proc_root.into();
        self
    }

    fn pid_dir(&self, pid: i32) -> PathBuf {
        self.proc_root.join(pid.to_string())
    }

    /// Path of a file of the target's mount namespace, reachable from ours
    fn host_path(&self, pid: i32, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        self.pid_dir(pid).join("root").join(relative)
    }
}

/// A file-backed region of a process's address space
#[derive(Debug, Clone, PartialEq, Eq)]
struct Mapping {
    start: u64,
    end: u64,
    offset: u64,
    executable: bool,
    path: PathBuf,
}

/// A stapsdt note with its addresses translated to file offsets
#[derive(Debug, Clone)]
struct ResolvedNote {
    note: UsdtNote,
    pc_offset: u64,
    semaphore_offset: Option<u64>,
}

/// A mapped binary carrying stapsdt notes
#[derive(Debug, Clone)]
struct TracedBinary {
    /// Path as seen by the target
    path: PathBuf,
    /// Path as seen by the exporter
    host_path: PathBuf,
    notes: Vec<ResolvedNote>,
}

/// One call site of an enabled probe
#[derive(Debug, Clone)]
struct Site {
    host_path: PathBuf,
    /// Link-time address of the probe instruction
    vaddr: u64,
    /// Address of the probe instruction in the target
    ip: u64,
    args: Vec<ArgSpec>,
}

#[derive(Debug, Clone)]
struct EnabledUsdt {
    fn_name: String,
    sites: Vec<Site>,
}

/// USDT state of one process
#[derive(Debug)]
pub struct UsdtHandle {
    pid: i32,
    mem_path: PathBuf,
    mappings: Vec<Mapping>,
    binaries: Vec<TracedBinary>,
    enabled: Vec<EnabledUsdt>,
    /// Semaphore addresses incremented in the target, once per increment
    semaphores: Vec<u64>,
}

fn parse_maps_line(line: &str) -> Option<Mapping> {
    let mut fields = line.splitn(6, ' ');
    let range = fields.next()?;
    let perms = fields.next()?;
    let offset = fields.next()?;
    let _dev = fields.next()?;
    let _inode = fields.next()?;
    let path = fields.next()?.trim_start();

    if !path.starts_with('/') || path.ends_with(" (deleted)") {
        return None;
    }

    let (start, end) = range.split_once('-')?;
    Some(Mapping {
        start: u64::from_str_radix(start, 16).ok()?,
        end: u64::from_str_radix(end, 16).ok()?,
        offset: u64::from_str_radix(offset, 16).ok()?,
        executable: perms.as_bytes().get(2) == Some(&b'x'),
        path: PathBuf::from(path),
    })
}

/// Address at which a file offset of `path` is mapped
fn runtime_address(mappings: &[Mapping], path: &Path, file_offset: u64) -> Option<u64> {
    mappings
        .iter()
        .filter(|m| m.path == path)
        .find(|m| file_offset >= m.offset && file_offset - m.offset < m.end - m.start)
        .map(|m| m.start + (file_offset - m.offset))
}

fn read_binary(path: &Path) -> Result<Vec<ResolvedNote>, StapsdtError> {
    let data = fs::read(path).map_err(|source| StapsdtError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    parse_notes(&data)?
        .into_iter()
        .map(|note| {
            let pc_offset = vaddr_to_offset(&data, note.pc)?;
            let semaphore_offset = match note.semaphore {
                0 => None,
                address => Some(vaddr_to_offset(&data, address)?),
            };
            Ok(ResolvedNote {
                note,
                pc_offset,
                semaphore_offset,
            })
        })
        .collect()
}

/// Add `delta` to a 2-byte probe semaphore in a process's memory file
fn adjust_semaphore(mem_path: &Path, address: u64, delta: i16) -> Result<()> {
    let mem = OpenOptions::new()
        .read(true)
        .write(true)
        .open(mem_path)
        .with_context(|| format!("Failed to open {:?}", mem_path))?;

    let mut buf = [0u8; 2];
    mem.read_exact_at(&mut buf, address)
        .with_context(|| format!("Failed to read semaphore at {:#x}", address))?;
    let value = u16::from_ne_bytes(buf).wrapping_add_signed(delta);
    mem.write_all_at(&value.to_ne_bytes(), address)
        .with_context(|| format!("Failed to write semaphore at {:#x}", address))?;
    Ok(())
}

impl Runtime for AyaRuntime {
    type Handle = UsdtHandle;
    type Module = AyaModule;

    fn open(&self, pid: i32) -> Result<UsdtHandle> {
        let pid_dir = self.pid_dir(pid);

        let maps_path = pid_dir.join("maps");
        let maps = fs::read_to_string(&maps_path)
            .with_context(|| format!("Failed to read {:?}", maps_path))?;
        let mappings: Vec<Mapping> = maps.lines().filter_map(parse_maps_line).collect();

        let exe = fs::read_link(pid_dir.join("exe"))
            .with_context(|| format!("Failed to resolve executable of pid {}", pid))?;

        let mut paths = vec![exe];
        for mapping in mappings.iter().filter(|m| m.executable) {
            if !paths.contains(&mapping.path) {
                paths.push(mapping.path.clone());
            }
        }

        let mut binaries = Vec::new();
        for path in paths {
            let host_path = self.host_path(pid, &path);
            match read_binary(&host_path) {
                Ok(notes) if notes.is_empty() => {}
                Ok(notes) => {
                    debug!("{}: {} USDT notes", path.display(), notes.len());
                    binaries.push(TracedBinary {
                        path,
                        host_path,
                        notes,
                    });
                }
                Err(e) => debug!("Skipping {}: {}", path.display(), e),
            }
        }

        info!(
            "  ✓ Opened USDT context for pid {} ({} binaries with probes)",
            pid,
            binaries.len()
        );

        Ok(UsdtHandle {
            pid,
            mem_path: pid_dir.join("mem"),
            mappings,
            binaries,
            enabled: Vec::new(),
            semaphores: Vec::new(),
        })
    }

    fn enable_probe(
        &self,
        handle: &mut UsdtHandle,
        provider: Option<&str>,
        name: &str,
        fn_name: &str,
    ) -> Result<()> {
        let spec = match provider {
            Some(provider) => format!("{}:{}", provider, name),
            None => name.to_string(),
        };
        let mut sites = Vec::new();
        let mut semaphores = Vec::new();

        for binary in &handle.binaries {
            let matching = binary.notes.iter().filter(|n| n.note.matches(&spec));

            for resolved in matching {
                let note = &resolved.note;
                let ip = runtime_address(&handle.mappings, &binary.path, resolved.pc_offset)
                    .unwrap_or(note.pc);
                let args = parse_args(&note.args).unwrap_or_else(|e| {
                    warn!(
                        "Arguments of {} at {:#x} in {} cannot be read: {}",
                        note,
                        note.pc,
                        binary.path.display(),
                        e
                    );
                    Vec::new()
                });

                sites.push(Site {
                    host_path: binary.host_path.clone(),
                    vaddr: note.pc,
                    ip,
                    args,
                });

                if let Some(offset) = resolved.semaphore_offset {
                    let address = runtime_address(&handle.mappings, &binary.path, offset)
                        .with_context(|| {
                            format!("Semaphore of {} is not mapped in pid {}", note, handle.pid)
                        })?;
                    if !semaphores.contains(&address) {
                        semaphores.push(address);
                    }
                }
            }
        }

        if sites.is_empty() {
            bail!("USDT probe {} not found", spec);
        }

        for address in semaphores {
            adjust_semaphore(&handle.mem_path, address, 1)?;
            handle.semaphores.push(address);
        }

        debug!(
            "Enabled {} ({} sites) -> {} in pid {}",
            spec,
            sites.len(),
            fn_name,
            handle.pid
        );
        handle.enabled.push(EnabledUsdt {
            fn_name: fn_name.to_string(),
            sites,
        });
        Ok(())
    }

    fn generate_preamble(&self, handle: &UsdtHandle) -> Result<String> {
        let probes: Vec<EnabledProbe> = handle
            .enabled
            .iter()
            .map(|enabled| EnabledProbe {
                fn_name: enabled.fn_name.clone(),
                sites: enabled
                    .sites
                    .iter()
                    .map(|site| ProbeSite {
                        ip: site.ip,
                        args: site.args.clone(),
                    })
                    .collect(),
            })
            .collect();

        Ok(generate_preamble(&probes))
    }

    fn compile(&self, source: &str, cflags: &[String]) -> Option<AyaModule> {
        match self.build(source, cflags) {
            Ok(module) => Some(module),
            Err(e) => {
                error!("Failed to compile instrumentation: {:#}", e);
                None
            }
        }
    }

    fn foreach_uprobe(&self, handle: &UsdtHandle, sink: UprobeSink) {
        for enabled in &handle.enabled {
            for site in &enabled.sites {
                sink(UprobeLocation {
                    path: site.host_path.clone(),
                    fn_name: enabled.fn_name.clone(),
                    address: site.vaddr,
                    pid: handle.pid,
                });
            }
        }
    }

    fn close(&self, handle: UsdtHandle) {
        for address in &handle.semaphores {
            if let Err(e) = adjust_semaphore(&handle.mem_path, *address, -1) {
                warn!(
                    "Failed to release semaphore {:#x} in pid {}: {:#}",
                    address, handle.pid, e
                );
            }
        }
    }
}

impl AyaRuntime {
    /// Compile `source` to a BPF object and load it
    fn build(&self, source: &str, cflags: &[String]) -> Result<AyaModule> {
        let dir = tempfile::tempdir().context("Failed to create build directory")?;
        let source_path = dir.path().join("program.bpf.c");
        let object_path = dir.path().join("program.bpf.o");
        fs::write(&source_path, source).context("Failed to write instrumentation source")?;

        let output = Command::new(&self.clang)
            .args(["-O2", "-g", "-target", "bpf", "-D__TARGET_ARCH_x86"])
            .args(cflags)
            .arg("-c")
            .arg(&source_path)
            .arg("-o")
            .arg(&object_path)
            .output()
            .with_context(|| format!("Failed to run {:?}", self.clang))?;
        if !output.status.success() {
            bail!(
                "{:?} exited with {}:\n{}",
                self.clang,
                output.status,
                String::from_utf8_lossy(&output.stderr)
            );
        }

        let object = fs::read(&object_path).context("Failed to read compiled object")?;
        let mut ebpf = EbpfLoader::new()
            .load(&object)
            .context("Failed to load compiled object")?;

        // aya-log forwards records from a tokio task
        if tokio::runtime::Handle::try_current().is_ok() {
            if let Err(e) = EbpfLogger::init(&mut ebpf) {
                debug!("eBPF logger not initialized: {}", e);
            }
        }

        Ok(AyaModule {
            ebpf: Some(Mutex::new(ebpf)),
            loaded: HashSet::new(),
        })
    }
}

/// Instrumentation object loaded with aya
pub struct AyaModule {
    /// `None` once closed
    ebpf: Option<Mutex<Ebpf>>,
    /// Programs already loaded into the kernel
    loaded: HashSet<String>,
}

fn uprobe<'a>(ebpf: &'a mut Ebpf, name: &str) -> Result<&'a mut UProbe> {
    ebpf.program_mut(name)
        .with_context(|| format!("Program {} not found in compiled module", name))?
        .try_into()
        .with_context(|| format!("Program {} is not a uprobe", name))
}

impl AyaModule {
    fn ebpf_mut(&mut self) -> Result<&mut Ebpf> {
        Ok(self
            .ebpf
            .as_mut()
            .context("Module is closed")?
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner))
    }
}

impl Module for AyaModule {
    type Program = String;

    fn load_uprobe(&mut self, fn_name: &str) -> Result<String> {
        if !self.loaded.contains(fn_name) {
            uprobe(self.ebpf_mut()?, fn_name)?
                .load()
                .with_context(|| format!("Failed to load {}", fn_name))?;
            self.loaded.insert(fn_name.to_string());
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
        let offset = file_offset(path, address)
            .with_context(|| format!("Failed to locate {:#x} in {}", address, path.display()))?;

        uprobe(self.ebpf_mut()?, program)?
            .attach(None, offset, path, Some(pid))
            .with_context(|| {
                format!(
                    "Failed to attach {} at {}+{:#x}",
                    program,
                    path.display(),
                    offset
                )
            })?;
        Ok(())
    }

    fn attach_uprobe_by_symbol(
        &mut self,
        program: &String,
        path: &Path,
        symbol: &str,
        pid: i32,
    ) -> Result<()> {
        uprobe(self.ebpf_mut()?, program)?
            .attach(Some(symbol), 0, path, Some(pid))
            .with_context(|| {
                format!("Failed to attach {} at {}:{}", program, path.display(), symbol)
            })?;
        Ok(())
    }

    fn table(&self, name: &str) -> Result<Vec<TableEntry>> {
        let ebpf = self
            .ebpf
            .as_ref()
            .context("Module is closed")?
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let map = ebpf
            .map(name)
            .with_context(|| format!("Table {} not found in compiled module", name))?;
        let data = match map {
            Map::HashMap(data) | Map::LruHashMap(data) | Map::Array(data) => data,
            _ => bail!("Table {} is not a hash, LRU hash or array map", name),
        };

        let info = data
            .info()
            .with_context(|| format!("Failed to query table {}", name))?;
        if info.value_size() != 8 {
            bail!(
                "Table {} has {}-byte values, expected 8",
                name,
                info.value_size()
            );
        }

        maps::entries(
            data.fd().as_fd(),
            info.key_size() as usize,
            info.max_entries() as usize,
        )
        .with_context(|| format!("Failed to read table {}", name))
    }

    fn close(&mut self) {
        if let Some(ebpf) = self.ebpf.take() {
            // Dropping the object detaches every link and unloads the programs
            drop(ebpf);
            debug!("Unloaded module ({} programs)", self.loaded.len());
        }
        self.loaded.clear();
    }
}

impl Drop for AyaModule {
    fn drop(&mut self) {
        self.close();
    }
}
