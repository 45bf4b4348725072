// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Full client → handler round trip: a forked child installs the stub,
//! faults for real, and the in-process server captures it.

use faultline_client::CrashHandlerClient;
use faultline_db::CrashReportDatabase;
use faultline_handler::server::{ExceptionHandlerServer, ServerOptions};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

#[tokio::test]
async fn test_faulting_client_produces_crash_report() {
    let dir = tempfile::tempdir().unwrap();
    let database = Arc::new(CrashReportDatabase::initialize(&dir.path().join("db")).unwrap());
    let socket_path = dir.path().join("handler.sock");

    let server = ExceptionHandlerServer::new(
        database.clone(),
        BTreeMap::from([("prod".to_string(), "client-test".to_string())]),
        Arc::new(Notify::new()),
        ServerOptions {
            socket_path: Some(socket_path.clone()),
            initial_client_fd: None,
            registration_timeout: Some(Duration::from_secs(30)),
        },
    );
    let server_task = tokio::spawn(server.run());
    for _ in 0..200 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    // SAFETY: the child registers over a blocking socket and then faults;
    // it never touches the parent's runtime.
    let child = match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let exit_code = match CrashHandlerClient::start_with_handler_socket(&socket_path) {
                Ok(()) => {
                    // A real fault, not a raise(): gives the handler a
                    // signo, code and fault address to capture.
                    unsafe {
                        std::ptr::null_mut::<u8>().write_volatile(42);
                    }
                    0 // unreachable
                }
                Err(_) => 12,
            };
            unsafe { libc::_exit(exit_code) };
        }
        ForkResult::Parent { child } => child,
    };

    // Wait for the report to land. Reaping the child earlier would race
    // the capture's own ptrace waits for the stopped tracee.
    let mut pending = Vec::new();
    for _ in 0..600 {
        pending = database.get_pending_reports().unwrap();
        if !pending.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(pending.len(), 1, "no crash report was filed");

    // The child dies of its original SIGSEGV once it is acknowledged.
    let status = tokio::task::spawn_blocking(move || waitpid(child, None).unwrap())
        .await
        .unwrap();
    assert!(
        matches!(status, WaitStatus::Signaled(_, nix::sys::signal::Signal::SIGSEGV, _)),
        "child should die of SIGSEGV, got {status:?}"
    );

    let bytes = std::fs::read(&pending[0].file_path).unwrap();
    let snapshot = faultline_snapshot::read_minidump(&bytes).unwrap();
    assert_eq!(snapshot.process_id, child.as_raw() as u32);
    assert!(!snapshot.threads.is_empty());
    assert!(!snapshot.modules.is_empty());
    assert_eq!(
        snapshot.annotations.get("prod").map(String::as_str),
        Some("client-test")
    );

    let exception = snapshot.exception.expect("dump should carry the fault");
    assert_eq!(exception.kind, libc::SIGSEGV as u32);
    assert_eq!(exception.thread_id, child.as_raw() as u32);
    assert_eq!(exception.fault_address, 0);
    assert!(exception.context.instruction_pointer() != 0);

    server_task.abort();
}

#[test]
fn test_second_start_fails() {
    // Installing twice in one process is rejected; do it in a fork so the
    // global state cannot leak into other tests.
    // SAFETY: the child only exercises library code and exits.
    match unsafe { fork() }.unwrap() {
        ForkResult::Child => {
            let dir = tempfile::tempdir().unwrap();
            let config = faultline_client::HandlerSpawnConfig {
                handler_path: "/nonexistent/handler".into(),
                database: dir.path().join("db"),
                url: None,
                annotations: vec![],
                extra_arguments: vec![],
            };
            let first = CrashHandlerClient::start_handler_at_crash(config.clone());
            let second = CrashHandlerClient::start_handler_at_crash(config);
            let code = match (first, second) {
                (Ok(()), Err(_)) => 0,
                _ => 1,
            };
            unsafe { libc::_exit(code) };
        }
        ForkResult::Parent { child } => {
            let status = waitpid(child, None).unwrap();
            assert!(matches!(status, WaitStatus::Exited(_, 0)), "{status:?}");
        }
    }
}
