// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide client state behind a lock-free atomic pointer.
//!
//! The signal handler cannot take locks, so the state is published once
//! via compare-exchange on an `AtomicPtr` and only ever read afterwards.
//! The pointed-to allocation is intentionally leaked: the crash path must
//! never observe a freed state.

use crate::spawn::PreparedHandlerSpawn;
use faultline_common::ipc::ExceptionInformation;
use faultline_common::{Error, Result};
use std::cell::UnsafeCell;
use std::os::unix::io::RawFd;
use std::os::unix::net::UnixStream;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};
use std::time::Duration;

/// The block the handler reads out of this process at crash time. Static,
/// so its address is stable for the lifetime of the process and can be
/// registered with the handler up front.
struct ExceptionInfoCell(UnsafeCell<ExceptionInformation>);

// SAFETY: written only from the crashing thread inside the one-shot signal
// handler, read only by the (out-of-process) handler afterwards.
unsafe impl Sync for ExceptionInfoCell {}

static EXCEPTION_INFO: ExceptionInfoCell = ExceptionInfoCell(UnsafeCell::new(
    ExceptionInformation {
        context_address: 0,
        siginfo_address: 0,
        fault_address: 0,
        code: 0,
        thread_id: 0,
        signo: 0,
    },
));

/// Stable address of the exception-information block, as registered with
/// the handler.
pub(crate) fn exception_info_address() -> u64 {
    EXCEPTION_INFO.0.get() as u64
}

/// Fills the block from the signal handler.
///
/// # Safety
/// Must only be called from the one-shot crash path, which guarantees a
/// single writer.
pub(crate) unsafe fn fill_exception_info(info: ExceptionInformation) {
    unsafe { ptr::write_volatile(EXCEPTION_INFO.0.get(), info) };
}

pub(crate) enum HandlerLink {
    /// Pre-connected stream to a long-lived handler.
    Connected(RawFd),
    /// Spawn a single-shot handler at crash time.
    SpawnAtCrash(PreparedHandlerSpawn),
}

pub(crate) struct ClientState {
    pub link: HandlerLink,
    pub ack_timeout: Duration,
}

impl ClientState {
    pub fn with_connected_handler(stream: UnixStream, ack_timeout: Duration) -> Self {
        use std::os::unix::io::IntoRawFd;
        ClientState {
            link: HandlerLink::Connected(stream.into_raw_fd()),
            ack_timeout,
        }
    }

    pub fn with_spawned_handler(spawn: PreparedHandlerSpawn, ack_timeout: Duration) -> Self {
        ClientState {
            link: HandlerLink::SpawnAtCrash(spawn),
            ack_timeout,
        }
    }
}

static CLIENT_STATE: AtomicPtr<ClientState> = AtomicPtr::new(ptr::null_mut());

/// Publishes the state exactly once. A second installation fails and the
/// first one stays in effect.
pub(crate) fn install(state: ClientState) -> Result<()> {
    let boxed = Box::into_raw(Box::new(state));
    match CLIENT_STATE.compare_exchange(ptr::null_mut(), boxed, SeqCst, SeqCst) {
        Ok(_) => Ok(()),
        Err(_) => {
            // SAFETY: this pointer came from Box::into_raw above and was
            // never published.
            drop(unsafe { Box::from_raw(boxed) });
            Err(Error::Internal("crash handler client already started".into()))
        }
    }
}

/// The published state, if any. The returned reference is `'static`
/// because installation leaks the allocation.
pub(crate) fn get() -> Option<&'static ClientState> {
    let state = CLIENT_STATE.load(SeqCst);
    // SAFETY: a non-null value is always a leaked Box from install().
    unsafe { state.as_ref() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exception_info_address_is_stable() {
        let first = exception_info_address();
        let second = exception_info_address();
        assert_eq!(first, second);
        assert_ne!(first, 0);
    }

    #[test]
    fn test_fill_and_read_back() {
        let info = ExceptionInformation {
            context_address: 0x1000,
            siginfo_address: 0x2000,
            fault_address: 0xdead,
            code: 1,
            thread_id: 42,
            signo: 11,
        };
        unsafe { fill_exception_info(info) };
        let read_back = unsafe { ptr::read_volatile(EXCEPTION_INFO.0.get()) };
        assert_eq!(read_back, info);
    }
}
