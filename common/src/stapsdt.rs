//! stapsdt note resolution
//!
//! Reads the `.note.stapsdt` section of an ELF binary and turns each note
//! into a [`UsdtNote`]. The binary layout of a note descriptor is:
//!
//! - probe PC address (8 bytes)
//! - link-time address of `.stapsdt.base` (8 bytes)
//! - semaphore address, 0 if the probe has none (8 bytes)
//! - provider name, probe name and argument format, each NUL-terminated
//!
//! Only 64-bit ELF files are supported.

use std::path::Path;

use object::{
    read::elf::{ElfFile64, SectionHeader},
    Endian, Endianness, Object, ObjectSection, ObjectSegment,
};

use crate::{
    constants::{STAPSDT_BASE_SECTION, STAPSDT_NOTE_OWNER, STAPSDT_NOTE_SECTION, STAPSDT_NOTE_TYPE},
    error::StapsdtError,
    types::UsdtNote,
};

const ADDRESS_SIZE: usize = 8;

/// Parse every stapsdt note of an in-memory ELF image.
///
/// A binary without a `.note.stapsdt` section yields an empty list.
pub fn parse_notes(data: &[u8]) -> Result<Vec<UsdtNote>, StapsdtError> {
    let file = ElfFile64::<Endianness>::parse(data)?;
    let endian = file.endian();

    // The base section only exists in binaries that may be prelinked.
    let actual_base = file
        .section_by_name(STAPSDT_BASE_SECTION)
        .map(|section| section.address());

    let mut notes = Vec::new();
    for section in file.sections() {
        if section.name().ok() != Some(STAPSDT_NOTE_SECTION) {
            continue;
        }
        let Some(mut iter) = section.elf_section_header().notes(endian, data)? else {
            continue;
        };
        while let Some(note) = iter.next()? {
            if note.name() != STAPSDT_NOTE_OWNER || note.n_type(endian) != STAPSDT_NOTE_TYPE {
                continue;
            }
            notes.push(parse_descriptor(
                note.desc(),
                endian.is_little_endian(),
                actual_base,
            )?);
        }
    }

    Ok(notes)
}

/// Decode one note descriptor.
///
/// `actual_base` is the address of `.stapsdt.base` in the file being read;
/// when present, the probe PC is shifted by the difference with the link-time
/// base recorded in the note.
pub fn parse_descriptor(
    desc: &[u8],
    little_endian: bool,
    actual_base: Option<u64>,
) -> Result<UsdtNote, StapsdtError> {
    if desc.len() < 3 * ADDRESS_SIZE {
        return Err(StapsdtError::MalformedNote(format!(
            "descriptor is {} bytes long",
            desc.len()
        )));
    }

    let word = |index: usize| {
        let mut raw = [0u8; ADDRESS_SIZE];
        raw.copy_from_slice(&desc[index * ADDRESS_SIZE..(index + 1) * ADDRESS_SIZE]);
        if little_endian {
            u64::from_le_bytes(raw)
        } else {
            u64::from_be_bytes(raw)
        }
    };

    let mut pc = word(0);
    let base = word(1);
    let semaphore = word(2);

    if let Some(actual) = actual_base {
        if base != 0 {
            pc = pc.wrapping_add(actual).wrapping_sub(base);
        }
    }

    let mut strings = desc[3 * ADDRESS_SIZE..]
        .split(|b| *b == 0)
        .map(|s| String::from_utf8_lossy(s).into_owned());

    let provider = strings
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StapsdtError::MalformedNote("missing provider".to_string()))?;
    let name = strings
        .next()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| StapsdtError::MalformedNote(format!("missing probe name ({provider})")))?;
    let args = strings.next().unwrap_or_default();

    Ok(UsdtNote {
        provider,
        name,
        pc,
        base,
        semaphore,
        args,
    })
}

/// Convert a virtual address of the binary at `path` to a file offset.
pub fn file_offset(path: &Path, vaddr: u64) -> Result<u64, StapsdtError> {
    let data = std::fs::read(path).map_err(|source| StapsdtError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    vaddr_to_offset(&data, vaddr)
}

/// Convert a virtual address to a file offset using the PT_LOAD segments of
/// an in-memory ELF image.
pub fn vaddr_to_offset(data: &[u8], vaddr: u64) -> Result<u64, StapsdtError> {
    let file = ElfFile64::<Endianness>::parse(data)?;

    file.segments()
        .find_map(|segment| {
            let delta = vaddr.checked_sub(segment.address())?;
            if delta >= segment.size() {
                return None;
            }
            segment.file_range().0.checked_add(delta)
        })
        .ok_or(StapsdtError::Unmapped(vaddr))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor(pc: u64, base: u64, sema: u64, strings: &[&str]) -> Vec<u8> {
        let mut desc = Vec::new();
        desc.extend_from_slice(&pc.to_le_bytes());
        desc.extend_from_slice(&base.to_le_bytes());
        desc.extend_from_slice(&sema.to_le_bytes());
        for s in strings {
            desc.extend_from_slice(s.as_bytes());
            desc.push(0);
        }
        desc
    }

    #[test]
    fn test_parse_descriptor() {
        let desc = descriptor(0x1234, 0, 0x4010, &["python", "gc__start", "-4@%edi"]);
        let note = parse_descriptor(&desc, true, None).unwrap();

        assert_eq!(note.provider, "python");
        assert_eq!(note.name, "gc__start");
        assert_eq!(note.pc, 0x1234);
        assert_eq!(note.semaphore, 0x4010);
        assert_eq!(note.args, "-4@%edi");
        assert_eq!(note.to_string(), "python:gc__start");
    }

    #[test]
    fn test_prelink_adjustment() {
        let desc = descriptor(0x2000, 0x500, 0, &["libc", "setjmp", ""]);

        let note = parse_descriptor(&desc, true, Some(0x700)).unwrap();
        assert_eq!(note.pc, 0x2200);
        assert_eq!(note.args, "");

        // Without a base section the address is used as is.
        let note = parse_descriptor(&desc, true, None).unwrap();
        assert_eq!(note.pc, 0x2000);
    }

    #[test]
    fn test_malformed_descriptor() {
        assert!(parse_descriptor(&[0u8; 10], true, None).is_err());

        let desc = descriptor(0x1000, 0, 0, &["provider"]);
        assert!(parse_descriptor(&desc, true, None).is_err());
    }

    #[test]
    fn test_read_current_executable() {
        let data = std::fs::read(std::env::current_exe().unwrap()).unwrap();

        // Test binaries carry no USDT notes, but must parse cleanly.
        assert!(parse_notes(&data).is_ok());
    }

    #[test]
    fn test_entry_point_offset() {
        let exe = std::env::current_exe().unwrap();
        let data = std::fs::read(&exe).unwrap();
        let entry = ElfFile64::<Endianness>::parse(data.as_slice())
            .unwrap()
            .entry();

        let offset = vaddr_to_offset(&data, entry).unwrap();
        assert!(offset < data.len() as u64);

        assert!(matches!(
            vaddr_to_offset(&data, u64::MAX - 1),
            Err(StapsdtError::Unmapped(_))
        ));
    }

    /// Minimal little-endian ELF64 image with a single PT_LOAD segment
    fn elf_with_segment(vaddr: u64, memsz: u64, offset: u64) -> Vec<u8> {
        let mut elf = vec![0x7f, b'E', b'L', b'F', 2, 1, 1];
        elf.resize(16, 0);
        elf.extend_from_slice(&2u16.to_le_bytes()); // ET_EXEC
        elf.extend_from_slice(&62u16.to_le_bytes()); // EM_X86_64
        elf.extend_from_slice(&1u32.to_le_bytes());
        elf.extend_from_slice(&vaddr.to_le_bytes()); // e_entry
        elf.extend_from_slice(&64u64.to_le_bytes()); // e_phoff
        elf.extend_from_slice(&0u64.to_le_bytes()); // e_shoff
        elf.extend_from_slice(&0u32.to_le_bytes());
        elf.extend_from_slice(&64u16.to_le_bytes());
        elf.extend_from_slice(&56u16.to_le_bytes());
        elf.extend_from_slice(&1u16.to_le_bytes()); // e_phnum
        elf.extend_from_slice(&64u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());
        elf.extend_from_slice(&0u16.to_le_bytes());

        elf.extend_from_slice(&1u32.to_le_bytes()); // PT_LOAD
        elf.extend_from_slice(&5u32.to_le_bytes());
        elf.extend_from_slice(&offset.to_le_bytes());
        elf.extend_from_slice(&vaddr.to_le_bytes());
        elf.extend_from_slice(&vaddr.to_le_bytes());
        elf.extend_from_slice(&0u64.to_le_bytes()); // p_filesz
        elf.extend_from_slice(&memsz.to_le_bytes());
        elf.extend_from_slice(&0x1000u64.to_le_bytes());
        elf
    }

    #[test]
    fn test_segment_at_top_of_address_space() {
        let data = elf_with_segment(u64::MAX - 0xff, 0x1000, 0x2000);
        assert_eq!(vaddr_to_offset(&data, u64::MAX - 0x10).unwrap(), 0x20ef);
        assert!(matches!(
            vaddr_to_offset(&data, 0x1000),
            Err(StapsdtError::Unmapped(_))
        ));

        // The file offset itself would overflow
        let data = elf_with_segment(0x1000, 0x1000, u64::MAX);
        assert!(matches!(
            vaddr_to_offset(&data, 0x1010),
            Err(StapsdtError::Unmapped(0x1010))
        ));
    }

    #[test]
    fn test_not_an_elf() {
        assert!(matches!(
            parse_notes(b"definitely not an ELF file"),
            Err(StapsdtError::Elf(_))
        ));
    }
}
