// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::format::*;
use crate::process::ThreadContext;
use crate::snapshot::{CpuArchitecture, OsKind, ProcessSnapshot};
use faultline_common::Result;
use std::io::Write;

/// Serializes `snapshot` as a crash-dump file.
///
/// Writing is two-pass: every stream body is encoded first, then the
/// header and directory are laid out with the final sizes and offsets, and
/// the bytes are emitted in directory order. The output is write-once; a
/// dump is never amended after this returns.
pub fn write_minidump<W: Write>(out: &mut W, snapshot: &ProcessSnapshot) -> Result<()> {
    // Pass one: stream bodies.
    let mut streams: Vec<(u32, Vec<u8>)> = vec![
        (STREAM_SYSTEM_INFO, encode_system_info(snapshot)),
        (STREAM_MISC_INFO, encode_misc_info(snapshot)),
        (STREAM_THREAD_LIST, encode_thread_list(snapshot)),
        (STREAM_MODULE_LIST, encode_module_list(snapshot)),
        (STREAM_MEMORY_LIST, encode_memory_list(snapshot)),
    ];
    if let Some(exception) = &snapshot.exception {
        let mut enc = Enc::new();
        enc.put_u32(exception.thread_id);
        enc.put_u32(exception.kind);
        enc.put_u32(exception.codes.len() as u32);
        for code in &exception.codes {
            enc.put_u64(*code);
        }
        enc.put_u64(exception.fault_address);
        encode_context(&mut enc, &exception.context);
        streams.push((STREAM_EXCEPTION, enc.into_bytes()));
    }
    streams.push((STREAM_HANDLE_DATA, encode_handle_data(snapshot)));
    streams.push((STREAM_ANNOTATIONS, encode_annotations(snapshot)));

    // Pass two: layout. Bodies start after the directory, aligned.
    let directory_offset = HEADER_LEN;
    let mut offset = align_up(directory_offset + streams.len() * DIRECTORY_ENTRY_LEN);
    let mut directory = Vec::with_capacity(streams.len());
    for (stream_type, body) in &streams {
        directory.push(DirectoryEntry {
            stream_type: *stream_type,
            length: body.len() as u32,
            offset: offset as u32,
        });
        offset = align_up(offset + body.len());
    }

    let mut header = Enc::new();
    header.put_u32(DUMP_MAGIC);
    header.put_u32(DUMP_VERSION);
    header.put_u32(streams.len() as u32);
    header.put_u32(directory_offset as u32);
    header.put_u32(0); // checksum, reserved
    header.put_u32(now_seconds());
    header.put_u64(0); // flags
    debug_assert_eq!(header.len(), HEADER_LEN);
    out.write_all(&header.into_bytes())?;

    let mut dir = Enc::new();
    for entry in &directory {
        dir.put_u32(entry.stream_type);
        dir.put_u32(entry.length);
        dir.put_u32(entry.offset);
    }
    out.write_all(&dir.into_bytes())?;

    let mut written = directory_offset + streams.len() * DIRECTORY_ENTRY_LEN;
    for (entry, (_, body)) in directory.iter().zip(&streams) {
        let pad = entry.offset as usize - written;
        out.write_all(&[0u8; STREAM_ALIGN][..pad])?;
        out.write_all(body)?;
        written = entry.offset as usize + body.len();
    }
    // Trailing alignment so concatenated tooling sees a whole last block.
    out.write_all(&[0u8; STREAM_ALIGN][..align_up(written) - written])?;
    Ok(())
}

fn encode_system_info(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(match snapshot.system.os {
        OsKind::Linux => 0,
        OsKind::MacOs => 1,
        OsKind::Windows => 2,
        OsKind::Other => u32::MAX,
    });
    enc.put_u32(match snapshot.system.cpu_architecture {
        CpuArchitecture::X86_64 => CONTEXT_TAG_X86_64,
        CpuArchitecture::Aarch64 => CONTEXT_TAG_AARCH64,
    });
    enc.put_u32(snapshot.system.little_endian as u32);
    enc.put_u32(snapshot.system.bits as u32);
    enc.put_string(&snapshot.system.os_version);
    enc.into_bytes()
}

fn encode_misc_info(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.process_id);
    enc.put_u32(snapshot.parent_process_id);
    enc.put_u64(snapshot.start_time);
    enc.put_u64(snapshot.user_cpu_time_ms);
    enc.put_u64(snapshot.system_cpu_time_ms);
    enc.into_bytes()
}

fn encode_thread_list(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.threads.len() as u32);
    for thread in &snapshot.threads {
        enc.put_u32(thread.thread_id);
        enc.put_i32(thread.priority);
        enc.put_i32(thread.nice);
        enc.put_u64(thread.stack_base);
        enc.put_u64(thread.stack_size);
        enc.put_u64(thread.tls_address);
        encode_context(&mut enc, &thread.context);
    }
    enc.into_bytes()
}

fn encode_module_list(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.modules.len() as u32);
    for module in &snapshot.modules {
        enc.put_u64(module.base_address);
        enc.put_u64(module.size);
        enc.put_string(&module.name);
        enc.put_bytes(&module.debug_id);
        enc.put_string(&module.version);
        enc.put_u32(module.annotations.len() as u32);
        for (key, value) in &module.annotations {
            enc.put_string(key);
            enc.put_string(value);
        }
    }
    enc.into_bytes()
}

fn encode_memory_list(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.memory.len() as u32);
    for range in &snapshot.memory {
        enc.put_u64(range.base_address);
        enc.put_bytes(&range.bytes);
    }
    enc.into_bytes()
}

fn encode_handle_data(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.handles.len() as u32);
    for handle in &snapshot.handles {
        enc.put_u32(handle.handle);
        enc.put_string(&handle.target);
    }
    enc.into_bytes()
}

fn encode_annotations(snapshot: &ProcessSnapshot) -> Vec<u8> {
    let mut enc = Enc::new();
    enc.put_u32(snapshot.annotations.len() as u32);
    for (key, value) in &snapshot.annotations {
        enc.put_string(key);
        enc.put_string(value);
    }
    enc.put_u32(snapshot.typed_annotations.len() as u32);
    for annotation in &snapshot.typed_annotations {
        enc.put_string(&annotation.name);
        enc.put_u16(annotation.type_tag);
        enc.put_bytes(&annotation.value);
    }
    enc.into_bytes()
}

pub(crate) fn encode_context(enc: &mut Enc, context: &ThreadContext) {
    match context {
        ThreadContext::X86_64(c) => {
            enc.put_u32(CONTEXT_TAG_X86_64);
            for v in [
                c.rax, c.rbx, c.rcx, c.rdx, c.rsi, c.rdi, c.rbp, c.rsp, c.r8, c.r9, c.r10, c.r11,
                c.r12, c.r13, c.r14, c.r15, c.rip, c.eflags, c.cs, c.ss, c.fs_base, c.gs_base,
            ] {
                enc.put_u64(v);
            }
        }
        ThreadContext::Aarch64(c) => {
            enc.put_u32(CONTEXT_TAG_AARCH64);
            for v in c.regs {
                enc.put_u64(v);
            }
            enc.put_u64(c.sp);
            enc.put_u64(c.pc);
            enc.put_u64(c.pstate);
            enc.put_u64(c.tpidr);
        }
    }
}

fn now_seconds() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}
