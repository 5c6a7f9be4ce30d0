//! Raw map iteration
//!
//! Table keys are declared in the configuration, not in Rust, so maps are
//! walked as raw bytes with `BPF_MAP_GET_NEXT_KEY` and
//! `BPF_MAP_LOOKUP_ELEM`.

use std::{
    collections::HashSet,
    io, mem,
    os::fd::{AsRawFd, BorrowedFd},
};

use crate::types::TableEntry;

const BPF_MAP_LOOKUP_ELEM: libc::c_long = 1;
const BPF_MAP_GET_NEXT_KEY: libc::c_long = 4;

/// Prefix of `union bpf_attr` used by the map element commands
#[repr(C)]
#[derive(Default)]
struct MapElemAttr {
    map_fd: u32,
    _pad: u32,
    key: u64,
    /// `value` for lookups, `next_key` for key iteration
    value: u64,
    flags: u64,
}

fn sys_bpf(cmd: libc::c_long, attr: &mut MapElemAttr) -> io::Result<()> {
    // SAFETY: `attr` is a valid `bpf_attr` prefix and the buffers it points
    // to are live for the duration of the call.
    let ret = unsafe {
        libc::syscall(
            libc::SYS_bpf,
            cmd,
            attr as *mut MapElemAttr,
            mem::size_of::<MapElemAttr>(),
        )
    };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Store the key following `key` (the first key if `None`) in `next`.
/// Returns false past the last key.
fn next_key(fd: BorrowedFd<'_>, key: Option<&[u8]>, next: &mut [u8]) -> io::Result<bool> {
    let mut attr = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key.map_or(0, |k| k.as_ptr() as u64),
        value: next.as_mut_ptr() as u64,
        ..Default::default()
    };
    match sys_bpf(BPF_MAP_GET_NEXT_KEY, &mut attr) {
        Ok(()) => Ok(true),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(false),
        Err(e) => Err(e),
    }
}

/// Look up `key`. Returns `None` if it was deleted meanwhile.
fn lookup(fd: BorrowedFd<'_>, key: &[u8]) -> io::Result<Option<u64>> {
    let mut value = [0u8; 8];
    let mut attr = MapElemAttr {
        map_fd: fd.as_raw_fd() as u32,
        key: key.as_ptr() as u64,
        value: value.as_mut_ptr() as u64,
        ..Default::default()
    };
    match sys_bpf(BPF_MAP_LOOKUP_ELEM, &mut attr) {
        Ok(()) => Ok(Some(u64::from_ne_bytes(value))),
        Err(e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Read every entry of a map with 8-byte values.
///
/// When a key is deleted during the walk the kernel restarts from the first
/// key, so keys already returned are skipped and the walk takes at most
/// `max_entries` steps.
pub(crate) fn entries(
    fd: BorrowedFd<'_>,
    key_size: usize,
    max_entries: usize,
) -> io::Result<Vec<TableEntry>> {
    let mut entries = Vec::new();
    let mut seen = HashSet::new();
    let mut key: Option<Vec<u8>> = None;

    for _ in 0..max_entries {
        let mut next = vec![0u8; key_size];
        if !next_key(fd, key.as_deref(), &mut next)? {
            break;
        }
        if !seen.insert(next.clone()) {
            key = Some(next);
            continue;
        }
        if let Some(value) = lookup(fd, &next)? {
            entries.push(TableEntry {
                key: next.clone(),
                value,
            });
        }
        key = Some(next);
    }

    Ok(entries)
}
