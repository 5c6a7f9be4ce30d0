//! Shared constants for the USDT exporter
//!
//! These are used both by the note parser in this crate and by the
//! daemon, so that section names, limits and exported names stay in sync.

// ============================================================================
// stapsdt ELF notes
// ============================================================================

/// Section holding one note per USDT call site
pub const STAPSDT_NOTE_SECTION: &str = ".note.stapsdt";

/// Section whose link-time address is recorded in every note, used to
/// compensate for prelinking
pub const STAPSDT_BASE_SECTION: &str = ".stapsdt.base";

/// Owner name of stapsdt notes
pub const STAPSDT_NOTE_OWNER: &[u8] = b"stapsdt";

/// Note type of stapsdt notes
pub const STAPSDT_NOTE_TYPE: u32 = 3;

// ============================================================================
// Process table
// ============================================================================

/// Kernel limit for a task's command name, including the trailing NUL
pub const TASK_COMM_LEN: usize = 16;

/// Default procfs mount point
pub const PROC_ROOT: &str = "/proc";

// ============================================================================
// Exposition
// ============================================================================

/// Prefix of every exported metric name
pub const PROMETHEUS_NAMESPACE: &str = "userspace_exporter";

/// Label carrying the pid of the instrumented process
pub const PID_LABEL: &str = "pid";

/// Default HTTP listen address
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:8080";

/// Default path of the metrics endpoint
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

// ============================================================================
// Code generation
// ============================================================================

/// Headers and helper macro placed before the generated argument readers.
///
/// `bpf_usdt_readarg(fn, n, ctx, dest)` reads the n-th (1-based) argument of
/// the probe `fn` is enabled on into `*dest`.
pub const PREAMBLE_HEADER: &str = "\
#include <linux/types.h>
#include <linux/ptrace.h>
#include <bpf/bpf_helpers.h>

#define bpf_usdt_readarg(fn, n, ctx, dest) \\
\t_bpf_readarg_##fn##_##n((ctx), (dest), sizeof(*(dest)))
";
