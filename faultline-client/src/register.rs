// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Setup-time handshake with a running handler. Nothing here runs on the
//! crash path, so ordinary allocation and blocking I/O are fine.

use crate::state::exception_info_address;
use faultline_common::ipc::{
    decode_frame_header, sign_extend_handle, Message, RegisterRequest, FRAME_HEADER_LEN,
    MAX_FRAME, PROTOCOL_VERSION,
};
use faultline_common::{Error, Result};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use tracing::debug;

/// Connects to the handler, registers this process, and returns the
/// stream to keep for crash time.
pub(crate) fn connect_and_register(socket_path: &Path) -> Result<UnixStream> {
    let mut stream = UnixStream::connect(socket_path)?;

    let request = Message::RegisterRequest(RegisterRequest {
        protocol_version: PROTOCOL_VERSION,
        client_process_id: std::process::id(),
        exception_info_address: exception_info_address(),
    });
    let mut buf = [0u8; MAX_FRAME];
    let n = request.encode(&mut buf)?;
    stream.write_all(&buf[..n])?;

    match read_message(&mut stream)? {
        Message::RegisterResponse(response) => {
            debug!(
                handle = sign_extend_handle(response.request_dump_event_handle),
                "registered with crash handler"
            );
        }
        other => {
            return Err(Error::Protocol(format!(
                "expected registration response, got kind {}",
                other.kind()
            )))
        }
    }

    // The handler follows up with its pid so this process can allow it as
    // a tracer under Yama's ptrace_scope.
    match read_message(&mut stream)? {
        Message::SetPtracer(message) => allow_ptracer(message.pid),
        other => debug!(kind = other.kind(), "unexpected post-registration message"),
    }

    Ok(stream)
}

fn allow_ptracer(pid: u32) {
    // SAFETY: PR_SET_PTRACER has no memory preconditions. Failure (old
    // kernel, prctl filtered) is survivable: attach still works whenever
    // ptrace_scope permits it.
    let rc = unsafe { libc::prctl(libc::PR_SET_PTRACER, pid as libc::c_ulong, 0, 0, 0) };
    if rc != 0 {
        debug!(pid, "PR_SET_PTRACER not honored");
    }
}

fn read_message(stream: &mut UnixStream) -> Result<Message> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    stream.read_exact(&mut header)?;
    let (kind, payload_len) = decode_frame_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload)?;
    Message::decode(kind, &payload)
}
