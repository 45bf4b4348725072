// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scoped ptrace attachment.
//!
//! Attaching suspends every task of the target for the duration of the
//! capture; dropping the attachment detaches (and thereby resumes) them on
//! every exit path, including capture failure.

use super::context::ThreadContext;
use faultline_common::{Error, Result};
use nix::sys::ptrace;
use nix::sys::wait::{waitpid, WaitPidFlag};
use nix::unistd::Pid;
use std::collections::BTreeSet;
use tracing::warn;

const NT_PRSTATUS: i32 = 1;
#[cfg(target_arch = "aarch64")]
const NT_ARM_TLS: i32 = 0x401;

pub(crate) struct PtraceAttachment {
    pid: i32,
    tids: Vec<i32>,
}

impl PtraceAttachment {
    /// Attaches to every task of `pid`, rescanning until the task list is
    /// stable so threads spawned mid-attach are not missed.
    pub fn attach_all(pid: i32) -> Result<Self> {
        let mut attachment = PtraceAttachment {
            pid,
            tids: Vec::new(),
        };
        let mut attached: BTreeSet<i32> = BTreeSet::new();

        // Two clean passes in a row mean no new tasks appeared while we were
        // stopping the ones we knew about.
        let mut stable_passes = 0;
        while stable_passes < 2 {
            let mut new_task = false;
            for tid in list_tasks(pid)? {
                if attached.contains(&tid) {
                    continue;
                }
                match attach_task(tid) {
                    Ok(()) => {
                        attached.insert(tid);
                        attachment.tids.push(tid);
                        new_task = true;
                    }
                    // The task exited between the scan and the attach.
                    Err(Error::NotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            stable_passes = if new_task { 0 } else { stable_passes + 1 };
        }

        if attachment.tids.is_empty() {
            return Err(Error::NotFound);
        }
        Ok(attachment)
    }

    pub fn tids(&self) -> &[i32] {
        &self.tids
    }

    /// Register snapshot of one stopped task.
    pub fn thread_context(&self, tid: i32) -> Result<ThreadContext> {
        read_context(tid)
    }
}

impl Drop for PtraceAttachment {
    fn drop(&mut self) {
        for &tid in &self.tids {
            if let Err(e) = ptrace::detach(Pid::from_raw(tid), None) {
                // The task may have been killed while attached; nothing to
                // resume in that case.
                if e != nix::errno::Errno::ESRCH {
                    warn!(pid = self.pid, tid, error = %e, "ptrace detach failed");
                }
            }
        }
    }
}

fn list_tasks(pid: i32) -> Result<Vec<i32>> {
    let mut tids = Vec::new();
    let task_dir = format!("/proc/{pid}/task");
    for entry in std::fs::read_dir(&task_dir)? {
        let entry = entry?;
        if let Some(tid) = entry.file_name().to_str().and_then(|n| n.parse().ok()) {
            tids.push(tid);
        }
    }
    tids.sort_unstable();
    Ok(tids)
}

fn attach_task(tid: i32) -> Result<()> {
    let pid = Pid::from_raw(tid);
    ptrace::attach(pid).map_err(map_ptrace_errno)?;
    // Swallow any pending signal-delivery stops until the attach stop
    // arrives; the target is crashing, so signals may be queued.
    loop {
        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
            Ok(status) if stopped(&status) => return Ok(()),
            Ok(_) => continue,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                let _ = ptrace::detach(pid, None);
                return Err(map_ptrace_errno(e));
            }
        }
    }
}

fn stopped(status: &nix::sys::wait::WaitStatus) -> bool {
    matches!(
        status,
        nix::sys::wait::WaitStatus::Stopped(_, _) | nix::sys::wait::WaitStatus::PtraceEvent(..)
    )
}

fn map_ptrace_errno(errno: nix::errno::Errno) -> Error {
    match errno {
        nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => {
            Error::PermissionDenied("ptrace attach refused; check ptrace_scope".into())
        }
        nix::errno::Errno::ESRCH => Error::NotFound,
        other => other.into(),
    }
}

fn getregset(tid: i32, set: i32, out: &mut [u8]) -> Result<usize> {
    let mut iov = libc::iovec {
        iov_base: out.as_mut_ptr().cast(),
        iov_len: out.len(),
    };
    // SAFETY: iov points at a live, writable buffer; the kernel bounds the
    // write by iov_len.
    let rc = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid,
            set as *mut libc::c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    if rc != 0 {
        return Err(map_ptrace_errno(nix::errno::Errno::last()));
    }
    Ok(iov.iov_len)
}

#[cfg(target_arch = "x86_64")]
fn read_context(tid: i32) -> Result<ThreadContext> {
    use super::context::ContextX86_64;

    let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::uninit();
    // SAFETY: the buffer covers exactly one user_regs_struct.
    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            regs.as_mut_ptr().cast::<u8>(),
            std::mem::size_of::<libc::user_regs_struct>(),
        )
    };
    let len = getregset(tid, NT_PRSTATUS, buf)?;
    if len < std::mem::size_of::<libc::user_regs_struct>() {
        return Err(Error::Internal("short NT_PRSTATUS regset".into()));
    }
    // SAFETY: the kernel filled the full struct.
    let regs = unsafe { regs.assume_init() };

    Ok(ThreadContext::X86_64(ContextX86_64 {
        rax: regs.rax,
        rbx: regs.rbx,
        rcx: regs.rcx,
        rdx: regs.rdx,
        rsi: regs.rsi,
        rdi: regs.rdi,
        rbp: regs.rbp,
        rsp: regs.rsp,
        r8: regs.r8,
        r9: regs.r9,
        r10: regs.r10,
        r11: regs.r11,
        r12: regs.r12,
        r13: regs.r13,
        r14: regs.r14,
        r15: regs.r15,
        rip: regs.rip,
        eflags: regs.eflags,
        cs: regs.cs,
        ss: regs.ss,
        fs_base: regs.fs_base,
        gs_base: regs.gs_base,
    }))
}

#[cfg(target_arch = "aarch64")]
fn read_context(tid: i32) -> Result<ThreadContext> {
    use super::context::ContextAarch64;

    let mut regs = std::mem::MaybeUninit::<libc::user_regs_struct>::uninit();
    // SAFETY: the buffer covers exactly one user_regs_struct.
    let buf = unsafe {
        std::slice::from_raw_parts_mut(
            regs.as_mut_ptr().cast::<u8>(),
            std::mem::size_of::<libc::user_regs_struct>(),
        )
    };
    let len = getregset(tid, NT_PRSTATUS, buf)?;
    if len < std::mem::size_of::<libc::user_regs_struct>() {
        return Err(Error::Internal("short NT_PRSTATUS regset".into()));
    }
    // SAFETY: the kernel filled the full struct.
    let regs = unsafe { regs.assume_init() };

    let mut tpidr = [0u8; 8];
    getregset(tid, NT_ARM_TLS, &mut tpidr)?;

    Ok(ThreadContext::Aarch64(ContextAarch64 {
        regs: regs.regs,
        sp: regs.sp,
        pc: regs.pc,
        pstate: regs.pstate,
        tpidr: u64::from_le_bytes(tpidr),
    }))
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn read_context(_tid: i32) -> Result<ThreadContext> {
    Err(Error::Internal("unsupported capture architecture".into()))
}
