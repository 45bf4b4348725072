// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::{
    CpuArchitecture, ExceptionSnapshot, HandleSnapshot, MemorySnapshot, ModuleSnapshot, OsKind,
    ProcessSnapshot, SanitizationPolicy, SystemSnapshot, ThreadSnapshot, TypedAnnotation,
};
use crate::process::ProcessReader;
use faultline_common::Result;
use std::collections::BTreeMap;
use tracing::warn;

/// Bytes captured below the stack pointer; callers of `alloca`-style
/// helpers and leaf functions keep live data in the red zone.
const STACK_BACKLEAD: u64 = 256;

/// Cap on captured stack bytes per thread.
const MAX_STACK_CAPTURE: usize = 512 * 1024;

/// The fault description the handler extracts from the client's
/// `ExceptionInformation` block.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionInput {
    pub thread_id: u32,
    pub signo: u32,
    pub code: i64,
    pub fault_address: u64,
}

/// Builds a [`ProcessSnapshot`] from one pass over the reader plus the
/// handler-supplied annotations and sanitization policy. Pure with respect
/// to the reader: nothing in the target is modified.
pub fn capture_snapshot(
    reader: &ProcessReader,
    exception: Option<ExceptionInput>,
    annotations: &BTreeMap<String, String>,
    typed_annotations: &[TypedAnnotation],
    policy: &SanitizationPolicy,
) -> Result<ProcessSnapshot> {
    let threads: Vec<ThreadSnapshot> = reader
        .threads()
        .into_iter()
        .map(|t| ThreadSnapshot {
            thread_id: t.thread_id,
            priority: t.priority,
            nice: t.nice,
            stack_base: t.stack_base,
            stack_size: t.stack_size,
            tls_address: t.tls_address,
            context: t.context,
        })
        .collect();

    let modules = reader
        .modules()
        .into_iter()
        .map(|m| ModuleSnapshot {
            base_address: m.base_address,
            size: m.size,
            name: m.name,
            debug_id: m.debug_id,
            version: String::new(),
            annotations: BTreeMap::new(),
        })
        .collect();

    let memory = capture_stacks(reader, &threads, policy);

    let exception = exception.map(|input| {
        let context = threads
            .iter()
            .find(|t| t.thread_id == input.thread_id)
            .or_else(|| threads.first())
            .map(|t| t.context);
        ExceptionSnapshot {
            kind: input.signo,
            codes: vec![input.code as u64],
            fault_address: input.fault_address,
            thread_id: input.thread_id,
            // A thread that exited before suspension leaves no context;
            // fall back to a zeroed register file of the host arch.
            context: context.unwrap_or(default_context()),
        }
    });

    let annotations = annotations
        .iter()
        .filter(|(name, _)| policy.allows_annotation(name))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let typed_annotations = typed_annotations
        .iter()
        .filter(|a| policy.allows_annotation(&a.name))
        .cloned()
        .collect();

    Ok(ProcessSnapshot {
        process_id: reader.process_id(),
        parent_process_id: reader.parent_process_id(),
        start_time: reader.start_time()?,
        user_cpu_time_ms: reader.cpu_times().0,
        system_cpu_time_ms: reader.cpu_times().1,
        system: system_snapshot(reader),
        modules,
        threads,
        exception,
        memory,
        handles: reader
            .open_files()
            .into_iter()
            .map(|f| HandleSnapshot {
                handle: f.fd,
                target: f.target,
            })
            .collect(),
        annotations,
        typed_annotations,
    })
}

/// Captures each thread's live stack: from just below the stack pointer to
/// the top of the stack region, subject to the size cap and the
/// sanitization allowlist.
fn capture_stacks(
    reader: &ProcessReader,
    threads: &[ThreadSnapshot],
    policy: &SanitizationPolicy,
) -> Vec<MemorySnapshot> {
    let mut out = Vec::new();
    for thread in threads {
        if thread.stack_size == 0 {
            continue;
        }
        let stack_end = thread.stack_base + thread.stack_size;
        let sp = thread.context.stack_pointer();
        let from = sp.saturating_sub(STACK_BACKLEAD).max(thread.stack_base);
        if from >= stack_end {
            continue;
        }
        let len = ((stack_end - from) as usize).min(MAX_STACK_CAPTURE);
        if !policy.touches_allowed_memory(from, len as u64) {
            continue;
        }

        let mut bytes = vec![0u8; len];
        match reader.read_memory(from, &mut bytes) {
            Ok(n) => {
                bytes.truncate(n);
                policy.scrub_memory(from, &mut bytes);
                out.push(MemorySnapshot {
                    base_address: from,
                    bytes,
                });
            }
            Err(e) => {
                warn!(
                    thread_id = thread.thread_id,
                    base = format_args!("{from:#x}"),
                    error = %e,
                    "cannot capture thread stack"
                );
            }
        }
    }
    out
}

fn system_snapshot(reader: &ProcessReader) -> SystemSnapshot {
    let info = os_info::get();
    SystemSnapshot {
        os: if cfg!(target_os = "linux") {
            OsKind::Linux
        } else if cfg!(target_os = "macos") {
            OsKind::MacOs
        } else if cfg!(target_os = "windows") {
            OsKind::Windows
        } else {
            OsKind::Other
        },
        os_version: format!("{} {}", info.os_type(), info.version()),
        cpu_architecture: if cfg!(target_arch = "aarch64") {
            CpuArchitecture::Aarch64
        } else {
            CpuArchitecture::X86_64
        },
        little_endian: cfg!(target_endian = "little"),
        bits: if reader.is_64_bit() { 64 } else { 32 },
    }
}

#[cfg(target_arch = "aarch64")]
fn default_context() -> crate::process::ThreadContext {
    crate::process::ThreadContext::Aarch64(Default::default())
}

#[cfg(not(target_arch = "aarch64"))]
fn default_context() -> crate::process::ThreadContext {
    crate::process::ThreadContext::X86_64(Default::default())
}
