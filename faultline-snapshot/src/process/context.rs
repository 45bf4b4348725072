// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! CPU register snapshots, tagged per architecture.
//!
//! The dump format stores pointer-sized values as u64 regardless of source
//! bitness, so the context structs use u64 throughout.

/// General-purpose register file of an x86_64 thread.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ContextX86_64 {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rsi: u64,
    pub rdi: u64,
    pub rbp: u64,
    pub rsp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub eflags: u64,
    pub cs: u64,
    pub ss: u64,
    pub fs_base: u64,
    pub gs_base: u64,
}

/// General-purpose register file of an aarch64 thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextAarch64 {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub tpidr: u64,
}

impl Default for ContextAarch64 {
    fn default() -> Self {
        ContextAarch64 {
            regs: [0; 31],
            sp: 0,
            pc: 0,
            pstate: 0,
            tpidr: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadContext {
    X86_64(ContextX86_64),
    Aarch64(ContextAarch64),
}

impl ThreadContext {
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            ThreadContext::X86_64(c) => c.rip,
            ThreadContext::Aarch64(c) => c.pc,
        }
    }

    pub fn stack_pointer(&self) -> u64 {
        match self {
            ThreadContext::X86_64(c) => c.rsp,
            ThreadContext::Aarch64(c) => c.sp,
        }
    }

    /// Thread-local-storage base carried in the register file.
    pub fn tls_address(&self) -> u64 {
        match self {
            ThreadContext::X86_64(c) => c.fs_base,
            ThreadContext::Aarch64(c) => c.tpidr,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accessors_pick_arch_registers() {
        let x = ThreadContext::X86_64(ContextX86_64 {
            rip: 0x1000,
            rsp: 0x2000,
            fs_base: 0x3000,
            ..Default::default()
        });
        assert_eq!(x.instruction_pointer(), 0x1000);
        assert_eq!(x.stack_pointer(), 0x2000);
        assert_eq!(x.tls_address(), 0x3000);

        let mut arm = ContextAarch64::default();
        arm.pc = 0x4000;
        arm.sp = 0x5000;
        arm.tpidr = 0x6000;
        let arm = ThreadContext::Aarch64(arm);
        assert_eq!(arm.instruction_pointer(), 0x4000);
        assert_eq!(arm.stack_pointer(), 0x5000);
        assert_eq!(arm.tls_address(), 0x6000);
    }
}
