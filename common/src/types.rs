//! Data structures shared between note resolution and the daemon

use std::{fmt, path::PathBuf};

/// One entry of a binary's `.note.stapsdt` section, i.e. one USDT call site.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UsdtNote {
    /// Provider name
    pub provider: String,
    /// Probe name
    pub name: String,
    /// Virtual address of the probe instruction, already compensated for
    /// prelinking
    pub pc: u64,
    /// Link-time address of `.stapsdt.base` as recorded in the note
    pub base: u64,
    /// Virtual address of the probe semaphore, 0 when the probe has none
    pub semaphore: u64,
    /// Raw argument format, e.g. `-4@%edi 8@-16(%rbp)`
    pub args: String,
}

impl UsdtNote {
    /// Whether this note matches a probe spec of the form `name` or
    /// `provider:name`.
    pub fn matches(&self, spec: &str) -> bool {
        match spec.split_once(':') {
            Some((provider, name)) => self.provider == provider && self.name == name,
            None => self.name == spec,
        }
    }
}

impl fmt::Display for UsdtNote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.provider, self.name)
    }
}

/// A resolved uprobe attach point for an enabled USDT probe
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UprobeLocation {
    /// Binary (executable or shared object) holding the probe
    pub path: PathBuf,
    /// Instrumentation function to run when the probe fires
    pub fn_name: String,
    /// Virtual address of the probe inside `path`
    pub address: u64,
    /// Process the uprobe is scoped to
    pub pid: i32,
}

impl fmt::Display for UprobeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} -> {}:{:#x} (pid {})",
            self.fn_name,
            self.path.display(),
            self.address,
            self.pid
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(provider: &str, name: &str) -> UsdtNote {
        UsdtNote {
            provider: provider.to_string(),
            name: name.to_string(),
            pc: 0x1000,
            base: 0,
            semaphore: 0,
            args: String::new(),
        }
    }

    #[test]
    fn test_note_matches_spec() {
        let n = note("python", "gc__start");

        assert!(n.matches("gc__start"));
        assert!(n.matches("python:gc__start"));
        assert!(!n.matches("ruby:gc__start"));
        assert!(!n.matches("gc__done"));
    }
}
