// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault interception and the crash path.
//!
//! Only async-signal-safe calls are made once a fault has been delivered:
//! `write`, `read`, `poll`, `socketpair`, `fork`, `dup2`, `execv`,
//! `sigaction`, `raise`. No allocation, no locks, no formatting.

use crate::spawn::{PreparedHandlerSpawn, HANDLER_CLIENT_FD};
use crate::state::{self, HandlerLink};
use faultline_common::ipc::{
    decode_frame_header, CrashDumpRequest, ExceptionInformation, Message, RegisterRequest,
    FRAME_HEADER_LEN, MAX_FRAME, MAX_PAYLOAD, MSG_DUMP_COMPLETE, MSG_DUMP_FAILED,
    PROTOCOL_VERSION,
};
use faultline_common::{Error, Result};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering::SeqCst};
use std::time::Instant;

/// The faults worth a crash report. SIGABRT and SIGTRAP are included so
/// asserts and debug traps produce dumps too.
const CRASH_SIGNALS: [Signal; 7] = [
    Signal::SIGSEGV,
    Signal::SIGBUS,
    Signal::SIGILL,
    Signal::SIGFPE,
    Signal::SIGABRT,
    Signal::SIGTRAP,
    Signal::SIGSYS,
];

static ENABLED: AtomicBool = AtomicBool::new(true);

pub(crate) fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, SeqCst);
}

/// Dispositions that were in place before ours, for chaining. Written only
/// during `install_handlers`, before any crash handler can run.
struct OldActions(UnsafeCell<[Option<SigAction>; CRASH_SIGNALS.len()]>);

// SAFETY: written once at install time, read only from the one-shot crash
// path afterwards.
unsafe impl Sync for OldActions {}

static OLD_ACTIONS: OldActions = OldActions(UnsafeCell::new([None; CRASH_SIGNALS.len()]));

/// Installs the alternate signal stack and the interceptors for every
/// crash signal, remembering the previous dispositions.
pub(crate) fn install_handlers() -> Result<()> {
    install_alt_stack()?;

    let action = SigAction::new(
        SigHandler::SigAction(handle_crash_signal),
        SaFlags::SA_SIGINFO | SaFlags::SA_ONSTACK,
        SigSet::empty(),
    );
    for (index, signal) in CRASH_SIGNALS.iter().enumerate() {
        // SAFETY: handle_crash_signal restricts itself to
        // async-signal-safe calls.
        let old = unsafe { signal::sigaction(*signal, &action) }.map_err(Error::from)?;
        // SAFETY: single-threaded write before any handler can fire.
        unsafe { (*OLD_ACTIONS.0.get())[index] = Some(old) };
    }
    Ok(())
}

/// The crash handler itself may fault if the stack is exhausted, so give
/// it its own.
fn install_alt_stack() -> Result<()> {
    const ALT_STACK_SIZE: usize = 256 * 1024;
    let stack = Box::leak(vec![0u8; ALT_STACK_SIZE].into_boxed_slice());
    let descriptor = libc::stack_t {
        ss_sp: stack.as_mut_ptr().cast(),
        ss_flags: 0,
        ss_size: ALT_STACK_SIZE,
    };
    // SAFETY: descriptor points at leaked, process-lifetime memory.
    let rc = unsafe { libc::sigaltstack(&descriptor, std::ptr::null_mut()) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(())
}

extern "C" fn handle_crash_signal(
    signum: i32,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    // Capture, then chain whatever was installed before us. The chain ends
    // in the default disposition, which terminates the process: a crashing
    // client always dies, whether or not capture succeeded.
    let _ = handle_crash_impl(signum, info, ucontext);
    // SAFETY: forwards the exact arguments the kernel handed us.
    unsafe { chain_previous_handler(signum, info, ucontext) };
}

fn handle_crash_impl(
    signum: i32,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) -> Result<()> {
    if !ENABLED.load(SeqCst) {
        return Ok(());
    }
    // One crash report per process. A handler that itself faults (stack
    // overflow inside capture) trips this guard instead of recursing.
    static TIMES_ENTERED: AtomicU64 = AtomicU64::new(0);
    if TIMES_ENTERED.fetch_add(1, SeqCst) > 0 {
        return Ok(());
    }

    let Some(client) = state::get() else {
        return Ok(());
    };
    // One absolute deadline bounds the whole stall: handler spawn, send,
    // and the wait for the acknowledgment all draw on the same budget.
    // Instant reads the monotonic clock; clock_gettime is signal-safe.
    let deadline = Instant::now() + client.ack_timeout;

    // SAFETY: info points at the kernel-provided siginfo for this signal.
    let fault_address = match signum {
        libc::SIGSEGV | libc::SIGBUS => unsafe { (*info).si_addr() as u64 },
        _ => 0,
    };
    // SAFETY: sole writer (one-shot guard above); info is kernel-provided.
    unsafe {
        state::fill_exception_info(ExceptionInformation {
            context_address: ucontext as u64,
            siginfo_address: info as u64,
            fault_address,
            code: (*info).si_code as i64,
            thread_id: gettid(),
            signo: signum as u32,
        })
    };

    let fd = match &client.link {
        HandlerLink::Connected(fd) => *fd,
        HandlerLink::SpawnAtCrash(prepared) => {
            let fd = spawn_handler(prepared)?;
            // A freshly spawned handler has never seen us; register first.
            send_message(
                fd,
                &Message::RegisterRequest(RegisterRequest {
                    protocol_version: PROTOCOL_VERSION,
                    client_process_id: unsafe { libc::getpid() } as u32,
                    exception_info_address: state::exception_info_address(),
                }),
            )?;
            fd
        }
    };

    send_message(
        fd,
        &Message::CrashDumpRequest(CrashDumpRequest {
            client_process_id: unsafe { libc::getpid() } as u32,
            thread_id: gettid(),
            stack_pointer: stack_pointer_from_ucontext(ucontext),
            exception_info_address: state::exception_info_address(),
            sanitization_info_address: 0,
        }),
    )?;

    wait_for_acknowledgment(fd, deadline)
}

fn gettid() -> u32 {
    // SAFETY: no preconditions.
    (unsafe { libc::syscall(libc::SYS_gettid) }) as u32
}

#[cfg(target_arch = "x86_64")]
fn stack_pointer_from_ucontext(ucontext: *mut libc::c_void) -> u64 {
    if ucontext.is_null() {
        return 0;
    }
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unsafe { (*(ucontext as *const libc::ucontext_t)).uc_mcontext.gregs[libc::REG_RSP as usize] as u64 }
}

#[cfg(target_arch = "aarch64")]
fn stack_pointer_from_ucontext(ucontext: *mut libc::c_void) -> u64 {
    if ucontext.is_null() {
        return 0;
    }
    // SAFETY: the kernel hands the handler a valid ucontext_t.
    unsafe { (*(ucontext as *const libc::ucontext_t)).uc_mcontext.sp }
}

#[cfg(not(any(target_arch = "x86_64", target_arch = "aarch64")))]
fn stack_pointer_from_ucontext(_ucontext: *mut libc::c_void) -> u64 {
    0
}

/// socketpair + fork + execv of the prepared handler image. Returns the
/// parent's end of the pair.
fn spawn_handler(prepared: &PreparedHandlerSpawn) -> Result<RawFd> {
    let mut fds = [0 as RawFd; 2];
    // SAFETY: fds is a valid out-array of two fds.
    let rc = unsafe {
        libc::socketpair(
            libc::AF_UNIX,
            libc::SOCK_STREAM,
            0,
            fds.as_mut_ptr(),
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    let (parent_fd, child_fd) = (fds[0], fds[1]);

    // SAFETY: the child calls only async-signal-safe functions before
    // execv.
    match unsafe { libc::fork() } {
        0 => {
            // Child: move the socket to the well-known fd and become the
            // handler.
            unsafe {
                if child_fd != HANDLER_CLIENT_FD {
                    libc::dup2(child_fd, HANDLER_CLIENT_FD);
                    libc::close(child_fd);
                }
                libc::close(parent_fd);
                prepared.exec()
            }
        }
        pid if pid > 0 => {
            // SAFETY: child_fd is ours to close.
            unsafe { libc::close(child_fd) };
            Ok(parent_fd)
        }
        _ => {
            // SAFETY: both fds are ours to close.
            unsafe {
                libc::close(parent_fd);
                libc::close(child_fd);
            }
            Err(Error::Io(std::io::Error::last_os_error()))
        }
    }
}

fn send_message(fd: RawFd, message: &Message) -> Result<()> {
    let mut buf = [0u8; MAX_FRAME];
    let n = message.encode(&mut buf)?;
    write_full(fd, &buf[..n])
}

fn write_full(fd: RawFd, mut bytes: &[u8]) -> Result<()> {
    while !bytes.is_empty() {
        // SAFETY: bytes is a live slice.
        let n = unsafe { libc::write(fd, bytes.as_ptr().cast(), bytes.len()) };
        match n {
            n if n > 0 => bytes = &bytes[n as usize..],
            _ if last_errno() == libc::EINTR => continue,
            _ => return Err(Error::Io(std::io::Error::last_os_error())),
        }
    }
    Ok(())
}

/// Reads frames until the handler acknowledges the dump (complete or
/// failed), the peer hangs up, or the deadline passes. Anything else on
/// the stream is drained and ignored.
fn wait_for_acknowledgment(fd: RawFd, deadline: Instant) -> Result<()> {
    loop {
        let mut header = [0u8; FRAME_HEADER_LEN];
        read_full(fd, &mut header, deadline)?;
        let (kind, payload_len) = decode_frame_header(&header)?;
        if payload_len > 0 {
            let mut discard = [0u8; MAX_PAYLOAD as usize];
            read_full(fd, &mut discard[..payload_len], deadline)?;
        }
        if kind == MSG_DUMP_COMPLETE || kind == MSG_DUMP_FAILED {
            return Ok(());
        }
    }
}

fn read_full(fd: RawFd, buf: &mut [u8], deadline: Instant) -> Result<()> {
    let mut done = 0usize;
    while done < buf.len() {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Transport("handler silent past deadline".into()));
        }
        let wait_ms = remaining.as_millis().min(i32::MAX as u128) as i32;

        let mut poll_fd = libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        };
        // SAFETY: poll_fd is a live struct.
        let ready = unsafe { libc::poll(&mut poll_fd, 1, wait_ms) };
        match ready {
            // Woke with nothing readable; the deadline check above ends
            // the loop once the budget is spent.
            0 => continue,
            r if r < 0 && last_errno() == libc::EINTR => continue,
            r if r < 0 => return Err(Error::Io(std::io::Error::last_os_error())),
            _ => {}
        }

        // SAFETY: the target range is a live slice.
        let n = unsafe {
            libc::read(
                fd,
                buf[done..].as_mut_ptr().cast(),
                buf.len() - done,
            )
        };
        match n {
            0 => return Err(Error::Transport("handler closed the connection".into())),
            n if n > 0 => done += n as usize,
            _ if last_errno() == libc::EINTR => continue,
            _ => return Err(Error::Io(std::io::Error::last_os_error())),
        }
    }
    Ok(())
}

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// Hands the signal to whatever was installed before us. The default
/// disposition is restored and the signal re-raised when there is nothing
/// to chain, so the process reliably dies with its original signal.
///
/// # Safety
/// Must be called from the signal handler with the kernel-provided
/// arguments.
unsafe fn chain_previous_handler(
    signum: i32,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let old = CRASH_SIGNALS
        .iter()
        .position(|s| *s as i32 == signum)
        // SAFETY: OLD_ACTIONS is only written during install.
        .and_then(|index| unsafe { (*OLD_ACTIONS.0.get())[index] });

    match old.map(|action| action.handler()) {
        Some(SigHandler::Handler(handler)) => handler(signum),
        Some(SigHandler::SigAction(handler)) => handler(signum, info, ucontext),
        // SIG_IGN on a hardware fault would spin re-delivering; fall
        // through to the default like an unset handler.
        _ => {
            let default = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
            if let Ok(signal) = Signal::try_from(signum) {
                // SAFETY: restoring the default disposition.
                let _ = unsafe { signal::sigaction(signal, &default) };
            }
            // SAFETY: re-raises into the default disposition.
            unsafe { libc::raise(signum) };
        }
    }
}
