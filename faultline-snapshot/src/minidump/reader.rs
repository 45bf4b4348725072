// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::format::*;
use crate::process::{ContextAarch64, ContextX86_64, ThreadContext};
use crate::snapshot::{
    CpuArchitecture, ExceptionSnapshot, HandleSnapshot, MemorySnapshot, ModuleSnapshot, OsKind,
    ProcessSnapshot, SystemSnapshot, ThreadSnapshot, TypedAnnotation,
};
use faultline_common::{Error, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// Parses a crash-dump file back into a [`ProcessSnapshot`].
///
/// Unknown stream types are skipped so newer writers stay readable; a bad
/// magic or a different major version is rejected as [`Error::Corrupt`].
pub fn read_minidump(bytes: &[u8]) -> Result<ProcessSnapshot> {
    let mut header = Dec::new(bytes.get(..HEADER_LEN).ok_or_else(short_file)?);
    let magic = header.get_u32()?;
    if magic != DUMP_MAGIC {
        return Err(Error::Corrupt(format!("bad dump magic {magic:#010x}")));
    }
    let version = header.get_u32()?;
    if major_version(version) != major_version(DUMP_VERSION) {
        return Err(Error::Corrupt(format!(
            "unsupported dump major version {}",
            major_version(version)
        )));
    }
    let num_streams = header.get_u32()? as usize;
    let directory_offset = header.get_u32()? as usize;

    let directory_len = num_streams
        .checked_mul(DIRECTORY_ENTRY_LEN)
        .and_then(|len| directory_offset.checked_add(len))
        .filter(|&end| end <= bytes.len())
        .ok_or_else(short_file)?;
    let mut directory = Dec::new(&bytes[directory_offset..directory_len]);

    let mut system = None;
    let mut misc = None;
    let mut threads = Vec::new();
    let mut modules = Vec::new();
    let mut memory = Vec::new();
    let mut exception = None;
    let mut handles = Vec::new();
    let mut annotations = BTreeMap::new();
    let mut typed_annotations = Vec::new();

    for _ in 0..num_streams {
        let stream_type = directory.get_u32()?;
        let length = directory.get_u32()? as usize;
        let offset = directory.get_u32()? as usize;
        let body = offset
            .checked_add(length)
            .filter(|&end| end <= bytes.len())
            .map(|end| &bytes[offset..end])
            .ok_or_else(short_file)?;
        let mut dec = Dec::new(body);

        match stream_type {
            STREAM_SYSTEM_INFO => system = Some(decode_system_info(&mut dec)?),
            STREAM_MISC_INFO => misc = Some(decode_misc_info(&mut dec)?),
            STREAM_THREAD_LIST => {
                for _ in 0..dec.get_u32()? {
                    threads.push(ThreadSnapshot {
                        thread_id: dec.get_u32()?,
                        priority: dec.get_i32()?,
                        nice: dec.get_i32()?,
                        stack_base: dec.get_u64()?,
                        stack_size: dec.get_u64()?,
                        tls_address: dec.get_u64()?,
                        context: decode_context(&mut dec)?,
                    });
                }
            }
            STREAM_MODULE_LIST => {
                for _ in 0..dec.get_u32()? {
                    let base_address = dec.get_u64()?;
                    let size = dec.get_u64()?;
                    let name = dec.get_string()?;
                    let debug_id = dec.get_vec()?;
                    let version = dec.get_string()?;
                    let mut module_annotations = BTreeMap::new();
                    for _ in 0..dec.get_u32()? {
                        let key = dec.get_string()?;
                        module_annotations.insert(key, dec.get_string()?);
                    }
                    modules.push(ModuleSnapshot {
                        base_address,
                        size,
                        name,
                        debug_id,
                        version,
                        annotations: module_annotations,
                    });
                }
            }
            STREAM_MEMORY_LIST => {
                for _ in 0..dec.get_u32()? {
                    memory.push(MemorySnapshot {
                        base_address: dec.get_u64()?,
                        bytes: dec.get_vec()?,
                    });
                }
            }
            STREAM_EXCEPTION => {
                let thread_id = dec.get_u32()?;
                let kind = dec.get_u32()?;
                let mut codes = Vec::new();
                for _ in 0..dec.get_u32()? {
                    codes.push(dec.get_u64()?);
                }
                exception = Some(ExceptionSnapshot {
                    thread_id,
                    kind,
                    codes,
                    fault_address: dec.get_u64()?,
                    context: decode_context(&mut dec)?,
                });
            }
            STREAM_HANDLE_DATA => {
                for _ in 0..dec.get_u32()? {
                    handles.push(HandleSnapshot {
                        handle: dec.get_u32()?,
                        target: dec.get_string()?,
                    });
                }
            }
            STREAM_ANNOTATIONS => {
                for _ in 0..dec.get_u32()? {
                    let key = dec.get_string()?;
                    annotations.insert(key, dec.get_string()?);
                }
                for _ in 0..dec.get_u32()? {
                    typed_annotations.push(TypedAnnotation {
                        name: dec.get_string()?,
                        type_tag: dec.get_u16()?,
                        value: dec.get_vec()?,
                    });
                }
            }
            unknown => {
                debug!(stream_type = unknown, length, "skipping unknown dump stream");
            }
        }
    }

    let system = system.ok_or_else(|| Error::Corrupt("dump has no system info stream".into()))?;
    let misc = misc.ok_or_else(|| Error::Corrupt("dump has no misc info stream".into()))?;

    Ok(ProcessSnapshot {
        process_id: misc.process_id,
        parent_process_id: misc.parent_process_id,
        start_time: misc.start_time,
        user_cpu_time_ms: misc.user_cpu_time_ms,
        system_cpu_time_ms: misc.system_cpu_time_ms,
        system,
        modules,
        threads,
        exception,
        memory,
        handles,
        annotations,
        typed_annotations,
    })
}

struct MiscInfo {
    process_id: u32,
    parent_process_id: u32,
    start_time: u64,
    user_cpu_time_ms: u64,
    system_cpu_time_ms: u64,
}

fn decode_misc_info(dec: &mut Dec) -> Result<MiscInfo> {
    Ok(MiscInfo {
        process_id: dec.get_u32()?,
        parent_process_id: dec.get_u32()?,
        start_time: dec.get_u64()?,
        user_cpu_time_ms: dec.get_u64()?,
        system_cpu_time_ms: dec.get_u64()?,
    })
}

fn decode_system_info(dec: &mut Dec) -> Result<SystemSnapshot> {
    let os = match dec.get_u32()? {
        0 => OsKind::Linux,
        1 => OsKind::MacOs,
        2 => OsKind::Windows,
        _ => OsKind::Other,
    };
    let cpu_architecture = match dec.get_u32()? {
        CONTEXT_TAG_X86_64 => CpuArchitecture::X86_64,
        CONTEXT_TAG_AARCH64 => CpuArchitecture::Aarch64,
        other => return Err(Error::Corrupt(format!("unknown cpu architecture {other}"))),
    };
    Ok(SystemSnapshot {
        os,
        cpu_architecture,
        little_endian: dec.get_u32()? != 0,
        bits: dec.get_u32()? as u8,
        os_version: dec.get_string()?,
    })
}

fn decode_context(dec: &mut Dec) -> Result<ThreadContext> {
    match dec.get_u32()? {
        CONTEXT_TAG_X86_64 => {
            let mut v = [0u64; 22];
            for slot in &mut v {
                *slot = dec.get_u64()?;
            }
            Ok(ThreadContext::X86_64(ContextX86_64 {
                rax: v[0],
                rbx: v[1],
                rcx: v[2],
                rdx: v[3],
                rsi: v[4],
                rdi: v[5],
                rbp: v[6],
                rsp: v[7],
                r8: v[8],
                r9: v[9],
                r10: v[10],
                r11: v[11],
                r12: v[12],
                r13: v[13],
                r14: v[14],
                r15: v[15],
                rip: v[16],
                eflags: v[17],
                cs: v[18],
                ss: v[19],
                fs_base: v[20],
                gs_base: v[21],
            }))
        }
        CONTEXT_TAG_AARCH64 => {
            let mut regs = [0u64; 31];
            for slot in &mut regs {
                *slot = dec.get_u64()?;
            }
            Ok(ThreadContext::Aarch64(ContextAarch64 {
                regs,
                sp: dec.get_u64()?,
                pc: dec.get_u64()?,
                pstate: dec.get_u64()?,
                tpidr: dec.get_u64()?,
            }))
        }
        other => Err(Error::Corrupt(format!("unknown context tag {other}"))),
    }
}

fn short_file() -> Error {
    Error::Corrupt("dump file truncated".into())
}
