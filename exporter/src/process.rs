//! Process table lookups
//!
//! Finds the processes running a given binary by reading procfs. Every call
//! takes a fresh snapshot; nothing is cached.

use std::{
    fs, io,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use thiserror::Error;
use usdt_common::{PROC_ROOT, TASK_COMM_LEN};

/// Errors reading the process table
#[derive(Error, Debug)]
pub enum ProcessError {
    /// The process table could not be enumerated at all
    #[error("unable to list processes in {path:?}: {source}")]
    ListError { path: PathBuf, source: io::Error },

    /// A listed process's command name could not be read
    #[error("unable to read command name of process {pid}: {reason}")]
    StatUnreadable { pid: i32, reason: String },
}

/// A running process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: i32,
    /// Kernel command name, at most 15 bytes
    pub comm: String,
}

/// procfs-backed process finder
#[derive(Debug, Clone)]
pub struct ProcessLocator {
    root: PathBuf,
}

impl Default for ProcessLocator {
    fn default() -> Self {
        Self::new(PROC_ROOT)
    }
}

impl ProcessLocator {
    /// Create a locator reading the procfs mounted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// procfs mount point
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Find every process whose command name matches `name`.
    ///
    /// The kernel truncates command names to 15 bytes, so a longer `name`
    /// matches on its first 15 bytes. Fails as soon as one process's command
    /// name cannot be read. Results are sorted by pid.
    pub fn find_by_binary_name(&self, name: &str) -> Result<Vec<ProcessEntry>, ProcessError> {
        let list_error = |source| ProcessError::ListError {
            path: self.root.clone(),
            source,
        };

        let mut found = Vec::new();
        for entry in fs::read_dir(&self.root).map_err(list_error)? {
            let entry = entry.map_err(list_error)?;
            let Some(pid) = entry
                .file_name()
                .to_str()
                .filter(|s| s.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };

            let comm = self.comm(pid)?;
            if comm_matches(&comm, name) {
                found.push(ProcessEntry { pid, comm });
            }
        }

        found.sort_by_key(|p| p.pid);
        Ok(found)
    }

    /// Command name of a process, from the `comm` field of its stat file
    pub fn comm(&self, pid: i32) -> Result<String, ProcessError> {
        let path = self.root.join(pid.to_string()).join("stat");
        let stat = fs::read_to_string(&path).map_err(|e| ProcessError::StatUnreadable {
            pid,
            reason: e.to_string(),
        })?;

        // comm may itself contain parentheses and spaces
        match (stat.find('('), stat.rfind(')')) {
            (Some(start), Some(end)) if start < end => Ok(stat[start + 1..end].to_string()),
            _ => Err(ProcessError::StatUnreadable {
                pid,
                reason: format!("malformed stat line {:?}", stat.trim_end()),
            }),
        }
    }

    /// Path of the executable a process is running
    pub fn exe_path(&self, pid: i32) -> Result<PathBuf> {
        let link = self.root.join(pid.to_string()).join("exe");
        fs::read_link(&link).with_context(|| format!("Failed to resolve {:?}", link))
    }
}

fn comm_matches(comm: &str, name: &str) -> bool {
    let limit = TASK_COMM_LEN - 1;
    if comm == name {
        return true;
    }
    name.len() > limit && name.as_bytes().get(..limit) == Some(comm.as_bytes())
}
