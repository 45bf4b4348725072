// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The exception-handler process.
//!
//! One current-thread tokio runtime hosts three cooperatively scheduled
//! pieces: the [`server::ExceptionHandlerServer`] event loop that receives
//! registrations and crash notifications over a Unix socket, the
//! [`upload::UploadWorker`] that drains pending reports, and the
//! [`prune::PruneWorker`] that enforces the database retention policy.
//! They share nothing in-process beyond the database and a wake-up signal.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod capture;
pub mod prune;
pub mod server;
pub mod upload;

pub use server::{ExceptionHandlerServer, ServerOptions};
