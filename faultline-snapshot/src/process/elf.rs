// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Minimal in-memory ELF walk: enough of the image format to validate a
//! mapped module and pull its GNU build id out of the PT_NOTE segments.
//! Reads only the target's memory, never the file on disk, so it sees the
//! image exactly as the loader left it.

use super::memory::Memory;
use faultline_common::{Error, Result};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const PT_NOTE: u32 = 4;
const NT_GNU_BUILD_ID: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ElfImage {
    pub is_64_bit: bool,
    pub build_id: Vec<u8>,
}

/// Reads the ELF image mapped at `base`. Fails with [`Error::Corrupt`] when
/// the mapping does not hold a loaded ELF header yet, which happens when a
/// module list races an in-flight `dlopen`.
pub(crate) fn read_elf_image(memory: &Memory, base: u64) -> Result<ElfImage> {
    let mut ident = [0u8; 64];
    memory.read_exact(base, &mut ident)?;
    if ident[0..4] != ELF_MAGIC {
        return Err(Error::Corrupt(format!("no ELF magic at {base:#x}")));
    }

    let is_64_bit = match ident[4] {
        ELFCLASS64 => true,
        ELFCLASS32 => false,
        other => return Err(Error::Corrupt(format!("bad ELF class {other}"))),
    };
    if !is_64_bit {
        // 32-bit targets keep their headers in the ILP32 layout; only the
        // native 64-bit layout is captured here.
        return Ok(ElfImage {
            is_64_bit,
            build_id: Vec::new(),
        });
    }

    let e_type = u16::from_le_bytes([ident[16], ident[17]]);
    let e_phoff = u64::from_le_bytes(ident[32..40].try_into().unwrap_or_default());
    let e_phentsize = u16::from_le_bytes([ident[54], ident[55]]) as u64;
    let e_phnum = u16::from_le_bytes([ident[56], ident[57]]) as u64;
    if e_phentsize < 56 || e_phnum == 0 || e_phnum > 512 {
        return Err(Error::Corrupt("implausible program header table".into()));
    }

    // ET_DYN images are loaded at an arbitrary base; their p_vaddr values
    // are slid by it. ET_EXEC addresses are absolute.
    let bias = match e_type {
        ET_DYN => base,
        ET_EXEC => 0,
        other => return Err(Error::Corrupt(format!("unexpected ELF type {other}"))),
    };

    let mut build_id = Vec::new();
    for i in 0..e_phnum {
        let mut phdr = [0u8; 56];
        memory.read_exact(base + e_phoff + i * e_phentsize, &mut phdr)?;
        let p_type = u32::from_le_bytes(phdr[0..4].try_into().unwrap_or_default());
        if p_type != PT_NOTE {
            continue;
        }
        let p_vaddr = u64::from_le_bytes(phdr[16..24].try_into().unwrap_or_default());
        let p_memsz = u64::from_le_bytes(phdr[40..48].try_into().unwrap_or_default());
        if let Some(id) = find_build_id_note(memory, p_vaddr + bias, p_memsz)? {
            build_id = id;
            break;
        }
    }

    Ok(ElfImage {
        is_64_bit,
        build_id,
    })
}

fn find_build_id_note(memory: &Memory, address: u64, size: u64) -> Result<Option<Vec<u8>>> {
    if size > 64 * 1024 {
        return Ok(None);
    }
    let mut notes = vec![0u8; size as usize];
    memory.read_exact(address, &mut notes)?;
    Ok(parse_build_id(&notes))
}

/// Walks a note area: each note is `namesz, descsz, type` (u32 LE each)
/// followed by the 4-aligned name and descriptor.
pub(crate) fn parse_build_id(notes: &[u8]) -> Option<Vec<u8>> {
    let mut at = 0usize;
    while at + 12 <= notes.len() {
        let namesz = u32::from_le_bytes(notes[at..at + 4].try_into().ok()?) as usize;
        let descsz = u32::from_le_bytes(notes[at + 4..at + 8].try_into().ok()?) as usize;
        let n_type = u32::from_le_bytes(notes[at + 8..at + 12].try_into().ok()?);
        at += 12;

        let name_end = at.checked_add(namesz)?;
        let desc_start = align4(name_end);
        let desc_end = desc_start.checked_add(descsz)?;
        if desc_end > notes.len() {
            return None;
        }

        if n_type == NT_GNU_BUILD_ID && namesz == 4 && &notes[at..at + 4] == b"GNU\0" {
            return Some(notes[desc_start..desc_end].to_vec());
        }
        at = align4(desc_end);
    }
    None
}

fn align4(n: usize) -> usize {
    (n + 3) & !3
}

#[cfg(test)]
mod tests {
    use super::*;

    fn note(name: &[u8], n_type: u32, desc: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(name.len() as u32).to_le_bytes());
        out.extend_from_slice(&(desc.len() as u32).to_le_bytes());
        out.extend_from_slice(&n_type.to_le_bytes());
        out.extend_from_slice(name);
        out.resize(align4(out.len()), 0);
        out.extend_from_slice(desc);
        out.resize(align4(out.len()), 0);
        out
    }

    #[test]
    fn test_parse_build_id_note() {
        let id = [0xab; 20];
        let mut notes = note(b"FOO\0", 7, b"xyz");
        notes.extend(note(b"GNU\0", NT_GNU_BUILD_ID, &id));
        assert_eq!(parse_build_id(&notes).unwrap(), id);
    }

    #[test]
    fn test_ignores_non_gnu_build_id_type() {
        let notes = note(b"GNU\0", 1, b"gold 1.11");
        assert!(parse_build_id(&notes).is_none());
    }

    #[test]
    fn test_truncated_note_area() {
        let mut notes = note(b"GNU\0", NT_GNU_BUILD_ID, &[0xcd; 16]);
        notes.truncate(notes.len() - 4);
        assert!(parse_build_id(&notes).is_none());
    }

    #[test]
    fn test_empty_area() {
        assert!(parse_build_id(&[]).is_none());
    }
}
