// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Durable storage for crash reports.
//!
//! The database is a rooted directory tree shared by every process that
//! touches reports (the exception handler, the upload worker, the prune
//! worker, tools):
//!
//! ```text
//! <root>/
//!   settings.dat           fixed-size record, whole-file advisory lock
//!   new/<uuid>.dmp         in-progress dump writes
//!   pending/<uuid>.dmp     dumps awaiting upload
//!   completed/<uuid>.dmp   uploaded or skipped dumps
//!   metadata/<uuid>.meta   one JSON record per report
//!   metadata/<uuid>.lock   lease lock files
//! ```
//!
//! Dump files move across the state directories by same-volume rename, and
//! metadata records are replaced by temp-file + rename, so readers observe
//! either the previous state of a report or the next one, never a torn
//! intermediate. Cross-process exclusion (report leases, settings writes)
//! uses `flock` on files that are never themselves replaced.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]

mod database;
mod report;
mod settings;

pub use database::CrashReportDatabase;
pub use report::{NewReport, Report, ReportLease, ReportState};
pub use settings::Settings;
