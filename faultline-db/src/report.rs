// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use faultline_common::LockedFile;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use std::path::PathBuf;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportState {
    Pending,
    Uploading,
    Completed,
}

/// A crash report as seen by callers. Snapshot of the on-disk record at the
/// time of the query; `file_path` is resolved against the current database
/// root, so a relocated database yields the same report at its new home.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub uuid: Uuid,
    pub file_path: PathBuf,
    pub creation_time: u64,
    /// Server-assigned identifier; empty until a successful upload.
    pub id: String,
    pub uploaded: bool,
    pub last_upload_attempt_time: u64,
    pub upload_attempts: u32,
    pub state: ReportState,
}

/// The persistent on-disk form of a report record. Holds the dump file name
/// rather than a full path so the database root may be renamed freely.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ReportRecord {
    pub uuid: Uuid,
    pub state: ReportState,
    pub creation_time: u64,
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub uploaded: bool,
    #[serde(default)]
    pub last_upload_attempt_time: u64,
    #[serde(default)]
    pub upload_attempts: u32,
    pub dump_name: String,
}

/// An in-progress report: a reserved uuid plus an open, exclusively locked
/// dump file under `new/`. Exactly one of `finished_writing_report` or
/// `error_writing_report` consumes it; a handle dropped without either (a
/// crashed writer) leaves a locked-by-no-one file that the next
/// `initialize` sweeps away.
pub struct NewReport {
    pub(crate) uuid: Uuid,
    pub(crate) path: PathBuf,
    pub(crate) file: LockedFile,
}

impl NewReport {
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Path of the in-progress dump file under `new/`.
    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub(crate) fn finish_file(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Write for NewReport {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl Seek for NewReport {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.file.seek(pos)
    }
}

/// Exclusive permission to upload one report.
///
/// Backed by a non-blocking `flock` on the report's lock file, so at most
/// one lease exists per uuid across all processes. The lease is released
/// when the holder records the attempt or drops the value.
pub struct ReportLease {
    pub(crate) report: Report,
    // Held for the lifetime of the lease; never read.
    pub(crate) _lock: LockedFile,
    pub(crate) dump_file: File,
}

impl ReportLease {
    pub fn report(&self) -> &Report {
        &self.report
    }

    pub fn uuid(&self) -> Uuid {
        self.report.uuid
    }

    /// Read handle on the dump bytes for the transport.
    pub fn dump_file(&mut self) -> &mut File {
        &mut self.dump_file
    }
}
