// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process client stub for the faultline crash handler.
//!
//! A monitored application calls one of the [`CrashHandlerClient`] start
//! functions at startup. The stub installs fault interceptors for the
//! fatal signals, and on a fault it fills the process-stable
//! `ExceptionInformation` block, notifies the handler over the
//! pre-established socket (or spawns a single-shot handler), waits for the
//! acknowledgment, and lets the process die with its original signal.
//!
//! Everything on the crash path is async-signal-safe: the socket is
//! connected and all execve arguments are prepared at setup time, messages
//! are encoded into stack buffers, and the global state lives behind an
//! atomic pointer installed exactly once.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod register;
mod signal;
mod spawn;
mod state;

pub use spawn::HandlerSpawnConfig;

use anyhow::Context;
use state::ClientState;
use std::path::Path;
use std::time::Duration;

/// How long the crash path waits for the handler's acknowledgment before
/// giving up and letting the process die.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(30);

pub struct CrashHandlerClient;

impl CrashHandlerClient {
    /// Connects to a running handler on `socket_path`, registers this
    /// process, and installs the fault interceptors.
    ///
    /// May be called once per process; a second call fails.
    pub fn start_with_handler_socket(socket_path: &Path) -> anyhow::Result<()> {
        let stream = register::connect_and_register(socket_path)
            .with_context(|| format!("register with handler at {}", socket_path.display()))?;
        let state = ClientState::with_connected_handler(stream, DEFAULT_ACK_TIMEOUT);
        state::install(state).context("install client state")?;
        signal::install_handlers().context("install signal handlers")?;
        Ok(())
    }

    /// Arranges for a single-shot handler to be spawned when a crash
    /// happens (`StartHandlerAtCrash`). Nothing runs until a fault.
    pub fn start_handler_at_crash(config: HandlerSpawnConfig) -> anyhow::Result<()> {
        let prepared = config.prepare().context("prepare handler spawn")?;
        let state = ClientState::with_spawned_handler(prepared, DEFAULT_ACK_TIMEOUT);
        state::install(state).context("install client state")?;
        signal::install_handlers().context("install signal handlers")?;
        Ok(())
    }

    /// Turns crash handling into a no-op without uninstalling the signal
    /// handlers; previously installed dispositions still chain.
    pub fn disable() {
        signal::set_enabled(false);
    }

    /// Re-enables crash handling after [`CrashHandlerClient::disable`].
    pub fn enable() {
        signal::set_enabled(true);
    }
}
