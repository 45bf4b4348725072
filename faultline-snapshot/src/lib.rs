// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process snapshotting and crash-dump serialization.
//!
//! The pipeline has three stages, leaves first:
//!
//! 1. [`process::ProcessReader`] attaches to a (stopped) target process and
//!    projects its address space, loaded modules and threads read-only.
//! 2. [`snapshot::ProcessSnapshot`] is built from one reader pass plus the
//!    handler-supplied annotations and an optional sanitization policy.
//! 3. [`minidump`] serializes a snapshot into the crash-dump wire format and
//!    parses it back.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

pub mod minidump;
pub mod process;
pub mod snapshot;

pub use minidump::{read_minidump, write_minidump};
pub use process::ProcessReader;
pub use snapshot::{capture_snapshot, ExceptionInput, ProcessSnapshot, SanitizationPolicy};
