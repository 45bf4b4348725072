// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! One crash capture: attach, snapshot, serialize, file in the database.

use faultline_common::ipc::{CrashDumpRequest, ExceptionInformation};
use faultline_common::{Error, Result};
use faultline_db::CrashReportDatabase;
use faultline_snapshot::snapshot::TypedAnnotation;
use faultline_snapshot::{
    capture_snapshot, write_minidump, ExceptionInput, ProcessReader, SanitizationPolicy,
};
use std::collections::BTreeMap;
use std::io::BufWriter;
use tracing::{info, warn};
use uuid::Uuid;

/// Wire layout of the client's optional sanitization block: two pointers
/// and two counts. The annotation list is an array of pointers to NUL
/// terminated names; the range list is an array of `{base, length}` pairs.
const SANITIZATION_WIRE_LEN: usize = 24;
const MAX_ALLOWLIST_ENTRIES: u32 = 256;
const MAX_ANNOTATION_NAME: usize = 256;

/// Captures the faulting client described by `request` into `database`.
///
/// The target stays suspended only while the snapshot is built; it is
/// resumed before the dump bytes hit the disk so a slow volume does not
/// extend the stall. Returns the new report's uuid.
pub fn capture_crash(
    database: &CrashReportDatabase,
    annotations: &BTreeMap<String, String>,
    request: &CrashDumpRequest,
) -> Result<Uuid> {
    let reader = ProcessReader::attach(request.client_process_id)?;

    let exception = match request.exception_info_address {
        0 => None,
        address => match read_exception_information(&reader, address) {
            Ok(info) => Some(ExceptionInput {
                thread_id: if info.thread_id != 0 {
                    info.thread_id
                } else {
                    request.thread_id
                },
                signo: info.signo,
                code: info.code,
                fault_address: info.fault_address,
            }),
            Err(e) => {
                warn!(error = %e, "cannot read client exception information");
                None
            }
        },
    };

    let policy = match request.sanitization_info_address {
        0 => SanitizationPolicy::default(),
        address => read_sanitization_policy(&reader, address).unwrap_or_else(|e| {
            warn!(error = %e, "cannot read sanitization allowlist, capturing unsanitized");
            SanitizationPolicy::default()
        }),
    };

    let typed: Vec<TypedAnnotation> = Vec::new();
    let snapshot = capture_snapshot(&reader, exception, annotations, &typed, &policy)?;
    // Resume the target; everything needed is now in the snapshot.
    drop(reader);

    let mut new_report = database.prepare_new_report()?;
    let uuid = new_report.uuid();
    let write_outcome = {
        let mut writer = BufWriter::new(&mut new_report);
        write_minidump(&mut writer, &snapshot).and_then(|()| {
            writer
                .into_inner()
                .map(|_| ())
                .map_err(|e| Error::Io(e.into_error()))
        })
    };
    match write_outcome {
        Ok(()) => {
            let uuid = database.finished_writing_report(new_report)?;
            info!(%uuid, client_pid = request.client_process_id, "crash report written");
            Ok(uuid)
        }
        Err(e) => {
            if let Err(cleanup) = database.error_writing_report(new_report) {
                warn!(%uuid, error = %cleanup, "cannot discard failed report");
            }
            Err(e)
        }
    }
}

fn read_exact(reader: &ProcessReader, address: u64, buf: &mut [u8]) -> Result<()> {
    if reader.read_memory(address, buf)? != buf.len() {
        return Err(Error::Protocol("client memory block truncated".into()));
    }
    Ok(())
}

fn read_exception_information(
    reader: &ProcessReader,
    address: u64,
) -> Result<ExceptionInformation> {
    let mut bytes = [0u8; ExceptionInformation::WIRE_LEN];
    read_exact(reader, address, &mut bytes)?;
    Ok(ExceptionInformation::decode(&bytes))
}

fn read_sanitization_policy(reader: &ProcessReader, address: u64) -> Result<SanitizationPolicy> {
    let mut header = [0u8; SANITIZATION_WIRE_LEN];
    read_exact(reader, address, &mut header)?;
    let u64_at = |at: usize| {
        u64::from_le_bytes([
            header[at],
            header[at + 1],
            header[at + 2],
            header[at + 3],
            header[at + 4],
            header[at + 5],
            header[at + 6],
            header[at + 7],
        ])
    };
    let annotation_list_address = u64_at(0);
    let range_list_address = u64_at(8);
    let annotation_count =
        u32::from_le_bytes([header[16], header[17], header[18], header[19]]);
    let range_count = u32::from_le_bytes([header[20], header[21], header[22], header[23]]);
    if annotation_count > MAX_ALLOWLIST_ENTRIES || range_count > MAX_ALLOWLIST_ENTRIES {
        return Err(Error::Protocol("implausible sanitization allowlist".into()));
    }

    let allowed_annotations = if annotation_list_address != 0 {
        let mut names = std::collections::BTreeSet::new();
        for i in 0..annotation_count as u64 {
            let mut pointer = [0u8; 8];
            read_exact(reader, annotation_list_address + i * 8, &mut pointer)?;
            let name_address = u64::from_le_bytes(pointer);
            names.insert(reader.read_c_string(name_address, MAX_ANNOTATION_NAME)?);
        }
        Some(names)
    } else {
        None
    };

    let allowed_memory_ranges = if range_list_address != 0 {
        let mut ranges = Vec::new();
        for i in 0..range_count as u64 {
            let mut pair = [0u8; 16];
            read_exact(reader, range_list_address + i * 16, &mut pair)?;
            let base = u64::from_le_bytes(pair[0..8].try_into().unwrap_or_default());
            let length = u64::from_le_bytes(pair[8..16].try_into().unwrap_or_default());
            ranges.push(base..base.saturating_add(length));
        }
        Some(ranges)
    } else {
        None
    };

    Ok(SanitizationPolicy {
        allowed_annotations,
        allowed_memory_ranges,
    })
}
