// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The in-memory tree describing one captured process.

mod builder;
mod sanitize;

pub use builder::{capture_snapshot, ExceptionInput};
pub use sanitize::SanitizationPolicy;

use crate::process::ThreadContext;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuArchitecture {
    X86_64,
    Aarch64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OsKind {
    Linux,
    MacOs,
    Windows,
    Other,
}

/// Host description at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemSnapshot {
    pub os: OsKind,
    pub os_version: String,
    pub cpu_architecture: CpuArchitecture,
    pub little_endian: bool,
    pub bits: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleSnapshot {
    pub base_address: u64,
    pub size: u64,
    pub name: String,
    pub debug_id: Vec<u8>,
    /// Module version string; empty when the image does not carry one.
    pub version: String,
    /// Per-module annotations embedded by the client library.
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadSnapshot {
    pub thread_id: u32,
    pub priority: i32,
    pub nice: i32,
    pub stack_base: u64,
    pub stack_size: u64,
    pub tls_address: u64,
    pub context: ThreadContext,
}

/// The fault that triggered the capture.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExceptionSnapshot {
    /// Signal number on POSIX targets.
    pub kind: u32,
    /// OS-specific code array (si_code and friends).
    pub codes: Vec<u64>,
    pub fault_address: u64,
    pub thread_id: u32,
    pub context: ThreadContext,
}

/// A captured span of target memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemorySnapshot {
    pub base_address: u64,
    pub bytes: Vec<u8>,
}

/// An annotation with an application-defined type tag, carried through the
/// dump untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypedAnnotation {
    pub name: String,
    pub type_tag: u16,
    pub value: Vec<u8>,
}

/// One open descriptor of the target at capture time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleSnapshot {
    pub handle: u32,
    pub target: String,
}

/// Everything captured from one faulting process, exclusively owned by the
/// capture operation that built it and destroyed once the dump is written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSnapshot {
    pub process_id: u32,
    pub parent_process_id: u32,
    pub start_time: u64,
    pub user_cpu_time_ms: u64,
    pub system_cpu_time_ms: u64,
    pub system: SystemSnapshot,
    pub modules: Vec<ModuleSnapshot>,
    pub threads: Vec<ThreadSnapshot>,
    pub exception: Option<ExceptionSnapshot>,
    pub memory: Vec<MemorySnapshot>,
    pub handles: Vec<HandleSnapshot>,
    pub annotations: BTreeMap<String, String>,
    pub typed_annotations: Vec<TypedAnnotation>,
}
