// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The exception-handler server.
//!
//! The server accepts any number of client connections; each one is a
//! cooperative task on the single runtime thread, so registered clients
//! are tracked concurrently while the listener keeps accepting. Captures
//! are the one serialized step: a capture suspends its target and writes
//! the dump before anything else interleaves, which is enforced with a
//! lock rather than by serializing connection admission.

use crate::capture::capture_crash;
use faultline_common::ipc::{
    decode_frame_header, Message, RegisterResponse, SetPtracer, FRAME_HEADER_LEN, MAX_FRAME,
    PROTOCOL_VERSION,
};
use faultline_common::{Error, Result};
use faultline_db::CrashReportDatabase;
use std::collections::BTreeMap;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{Mutex, Notify};
use tracing::{debug, info, warn};

pub struct ServerOptions {
    /// Listener endpoint. `None` runs the single-shot mode: the server
    /// services only the inherited client and returns.
    pub socket_path: Option<PathBuf>,
    /// Inherited, already-connected client socket (the
    /// `--initial-client-data` startup mode); serviced before the listener
    /// accepts anything else.
    pub initial_client_fd: Option<RawFd>,
    /// How long a connecting peer may take to register. Once registered, a
    /// client may idle for its whole lifetime; crashes are rare. `None`
    /// waits forever.
    pub registration_timeout: Option<Duration>,
}

/// Per-client connection states.
///
/// ```text
/// Registered ─exception─▶ Capturing ─ok/fail─▶ Replied ─▶ (closed)
/// Registered ─peer died─▶ (closed)
/// Registered ─shutdown──▶ (closed)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    AwaitingRegistration,
    Registered,
    Replied,
}

/// What servicing one connection told the accept loop to do next.
enum Disposition {
    NextClient,
    Shutdown,
}

/// State every connection task shares.
struct Shared {
    database: Arc<CrashReportDatabase>,
    annotations: BTreeMap<String, String>,
    report_notify: Arc<Notify>,
    registration_timeout: Option<Duration>,
    shutdown_token: u64,
    /// Serializes captures across concurrently-connected clients; held for
    /// the attach-snapshot-write of one crash at a time.
    capture_lock: Mutex<()>,
    /// Raised by a connection task that saw a valid shutdown request.
    shutdown: Notify,
}

pub struct ExceptionHandlerServer {
    shared: Arc<Shared>,
    socket_path: Option<PathBuf>,
    initial_client_fd: Option<RawFd>,
}

impl ExceptionHandlerServer {
    pub fn new(
        database: Arc<CrashReportDatabase>,
        annotations: BTreeMap<String, String>,
        report_notify: Arc<Notify>,
        options: ServerOptions,
    ) -> Self {
        ExceptionHandlerServer {
            shared: Arc::new(Shared {
                database,
                annotations,
                report_notify,
                registration_timeout: options.registration_timeout,
                shutdown_token: rand::random(),
                capture_lock: Mutex::new(()),
                shutdown: Notify::new(),
            }),
            socket_path: options.socket_path,
            initial_client_fd: options.initial_client_fd,
        }
    }

    /// The token a shutdown request must present. Handed to whatever
    /// supervises the handler at spawn time.
    pub fn shutdown_token(&self) -> u64 {
        self.shared.shutdown_token
    }

    /// Runs until a valid shutdown request arrives. Per client,
    /// registration strictly precedes exception delivery and messages are
    /// processed in send order; across clients, ordering is unspecified.
    /// Shutdown drains an in-flight capture, never aborting it mid-write.
    pub async fn run(self) -> Result<()> {
        let listener = match &self.socket_path {
            Some(path) => {
                if path.exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                info!(path = %path.display(), "exception handler listening");
                Some(listener)
            }
            None => None,
        };

        if let Some(fd) = self.initial_client_fd {
            // SAFETY: the fd was inherited from our spawner for exactly this
            // purpose and is not owned elsewhere in this process.
            let std_stream = unsafe { std::os::unix::net::UnixStream::from_raw_fd(fd) };
            std_stream.set_nonblocking(true)?;
            let stream = UnixStream::from_std(std_stream)?;
            if let Disposition::Shutdown = serve_client(self.shared.clone(), stream).await {
                return Ok(());
            }
        }

        let Some(listener) = listener else {
            // Single-shot mode: the inherited client was the only one.
            return Ok(());
        };
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, _addr) = accepted?;
                    let shared = self.shared.clone();
                    tokio::spawn(async move {
                        if let Disposition::Shutdown =
                            serve_client(shared.clone(), stream).await
                        {
                            shared.shutdown.notify_one();
                        }
                    });
                }
                _ = self.shared.shutdown.notified() => {
                    // Drain: a capture in flight finishes its database
                    // write before the lock is granted.
                    let _drained = self.shared.capture_lock.lock().await;
                    info!("shutdown requested with valid token");
                    return Ok(());
                }
            }
        }
    }
}

/// Services one connection to completion. Any per-client failure is logged
/// and ends that client only; the server itself never aborts.
async fn serve_client(shared: Arc<Shared>, mut stream: UnixStream) -> Disposition {
    let mut state = ClientState::AwaitingRegistration;
    let mut client_pid = 0u32;

    loop {
        // Only the registration handshake is deadline-bounded. A healthy
        // registered client sits silent until the day it crashes.
        let read_deadline = match state {
            ClientState::AwaitingRegistration => shared.registration_timeout,
            _ => None,
        };
        let message = match read_message(&mut stream, read_deadline).await {
            Ok(Some(message)) => message,
            // Peer closed: terminal for this client.
            Ok(None) => {
                debug!(client_pid, "client connection closed");
                return Disposition::NextClient;
            }
            Err(Error::Protocol(reason)) => {
                warn!(client_pid, reason, "dropping misbehaving client");
                return Disposition::NextClient;
            }
            Err(e) => {
                warn!(client_pid, error = %e, "client read failed");
                return Disposition::NextClient;
            }
        };

        match (state, message) {
            (ClientState::AwaitingRegistration, Message::RegisterRequest(request)) => {
                if request.protocol_version != PROTOCOL_VERSION {
                    warn!(
                        client_pid = request.client_process_id,
                        version = request.protocol_version,
                        "client speaks an unsupported protocol version"
                    );
                    return Disposition::NextClient;
                }
                client_pid = request.client_process_id;
                debug!(client_pid, "client registered");
                let response = Message::RegisterResponse(RegisterResponse {
                    // No event object on this transport; clients request
                    // dumps over the socket itself.
                    request_dump_event_handle: 0,
                });
                if write_message(&mut stream, &response).await.is_err() {
                    return Disposition::NextClient;
                }
                // Yama's ptrace_scope blocks attaching to non-children;
                // tell the client which pid to allow as its tracer.
                let set_ptracer = Message::SetPtracer(SetPtracer {
                    pid: std::process::id(),
                });
                if write_message(&mut stream, &set_ptracer).await.is_err() {
                    return Disposition::NextClient;
                }
                state = ClientState::Registered;
            }

            (ClientState::Registered, Message::CrashDumpRequest(request)) => {
                // One capture at a time across all clients; the target
                // stays suspended for the duration.
                let outcome = {
                    let _capture = shared.capture_lock.lock().await;
                    capture_crash(&shared.database, &shared.annotations, &request)
                };
                let reply = match outcome {
                    Ok(uuid) => {
                        debug!(client_pid, %uuid, "capture complete");
                        shared.report_notify.notify_one();
                        Message::DumpComplete
                    }
                    Err(e) => {
                        warn!(client_pid, error = %e, "capture failed");
                        Message::DumpFailed
                    }
                };
                // The client is acknowledged either way so it can
                // terminate; the connection closes when it does.
                let _ = write_message(&mut stream, &reply).await;
                state = ClientState::Replied;
            }

            (_, Message::ShutdownRequest(request)) => {
                if request.token == shared.shutdown_token {
                    return Disposition::Shutdown;
                }
                // At-most-once shutdown: bad tokens are ignored, logged,
                // and do not disturb the client's registration.
                warn!(client_pid, "ignoring shutdown request with invalid token");
            }

            (ClientState::Replied, message) => {
                warn!(
                    client_pid,
                    kind = message.kind(),
                    "message after reply, closing client"
                );
                return Disposition::NextClient;
            }

            (_, message) => {
                warn!(
                    client_pid,
                    kind = message.kind(),
                    ?state,
                    "unexpected message for client state"
                );
                return Disposition::NextClient;
            }
        }
    }
}

async fn read_message(
    stream: &mut UnixStream,
    deadline: Option<Duration>,
) -> Result<Option<Message>> {
    let mut header = [0u8; FRAME_HEADER_LEN];
    let read_header = stream.read_exact(&mut header);
    let n = match deadline {
        Some(deadline) => match tokio::time::timeout(deadline, read_header).await {
            Ok(result) => result,
            Err(_) => {
                return Err(Error::Protocol("no registration before deadline".into()));
            }
        },
        None => read_header.await,
    };
    match n {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let (kind, payload_len) = decode_frame_header(&header)?;
    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    Ok(Some(Message::decode(kind, &payload)?))
}

async fn write_message(stream: &mut UnixStream, message: &Message) -> Result<()> {
    let mut buf = [0u8; MAX_FRAME];
    let n = message.encode(&mut buf)?;
    stream.write_all(&buf[..n]).await?;
    Ok(())
}
