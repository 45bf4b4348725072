// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only projection of another running process via ptrace and procfs.

mod context;
mod elf;
mod maps;
mod memory;
mod ptrace;
mod reader;
mod stat;

pub use context::{ContextAarch64, ContextX86_64, ThreadContext};
pub use maps::Mapping;
pub use reader::{FdInfo, ModuleInfo, ProcessReader, ThreadInfo};
