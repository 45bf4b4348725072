// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-dump serialization: typed streams behind a header and directory.

pub mod format;
mod reader;
mod writer;

pub use reader::read_minidump;
pub use writer::write_minidump;

#[cfg(test)]
mod tests {
    use super::format::*;
    use super::*;
    use crate::process::{ContextAarch64, ContextX86_64, ThreadContext};
    use crate::snapshot::*;
    use std::collections::BTreeMap;

    fn sample_snapshot() -> ProcessSnapshot {
        let context = ThreadContext::X86_64(ContextX86_64 {
            rip: 0x5555_0000_1000,
            rsp: 0x7ffd_2000_0f00,
            rbp: 0x7ffd_2000_0f80,
            fs_base: 0x7f00_0000_0000,
            eflags: 0x246,
            ..Default::default()
        });

        ProcessSnapshot {
            process_id: 4121,
            parent_process_id: 1,
            start_time: 1_700_000_000,
            user_cpu_time_ms: 1250,
            system_cpu_time_ms: 310,
            system: SystemSnapshot {
                os: OsKind::Linux,
                os_version: "Ubuntu 22.04".into(),
                cpu_architecture: CpuArchitecture::X86_64,
                little_endian: true,
                bits: 64,
            },
            modules: vec![
                ModuleSnapshot {
                    base_address: 0x5555_0000_0000,
                    size: 0x21000,
                    name: "/usr/bin/victim".into(),
                    debug_id: vec![0xab; 20],
                    version: "1.2.3".into(),
                    annotations: BTreeMap::from([("channel".into(), "stable".into())]),
                },
                ModuleSnapshot {
                    base_address: 0x7f00_1000_0000,
                    size: 0x1ed000,
                    name: "/lib/x86_64-linux-gnu/libc.so.6".into(),
                    debug_id: vec![0xcd; 20],
                    version: String::new(),
                    annotations: BTreeMap::new(),
                },
            ],
            threads: vec![ThreadSnapshot {
                thread_id: 4121,
                priority: 20,
                nice: 0,
                stack_base: 0x7ffd_2000_0000,
                stack_size: 0x21000,
                tls_address: 0x7f00_0000_0000,
                context,
            }],
            exception: Some(ExceptionSnapshot {
                kind: 11,
                codes: vec![1, 0],
                fault_address: 0xdead_beef,
                thread_id: 4121,
                context,
            }),
            memory: vec![MemorySnapshot {
                base_address: 0x7ffd_2000_0e00,
                bytes: (0..=255).collect(),
            }],
            handles: vec![HandleSnapshot {
                handle: 0,
                target: "/dev/null".into(),
            }],
            annotations: BTreeMap::from([
                ("prod".into(), "victim".into()),
                ("ver".into(), "1.2.3".into()),
            ]),
            typed_annotations: vec![TypedAnnotation {
                name: "breadcrumbs".into(),
                type_tag: 3,
                value: vec![9, 8, 7],
            }],
        }
    }

    fn write_to_vec(snapshot: &ProcessSnapshot) -> Vec<u8> {
        let mut out = Vec::new();
        write_minidump(&mut out, snapshot).unwrap();
        out
    }

    #[test]
    fn test_round_trip_preserves_entity_tree() {
        let snapshot = sample_snapshot();
        let parsed = read_minidump(&write_to_vec(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_round_trip_without_exception() {
        let mut snapshot = sample_snapshot();
        snapshot.exception = None;
        let parsed = read_minidump(&write_to_vec(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_round_trip_aarch64_context() {
        let mut snapshot = sample_snapshot();
        let mut arm = ContextAarch64::default();
        arm.regs[0] = 0x1234;
        arm.regs[30] = 0x5678;
        arm.sp = 0x7ffd_0000_0000;
        arm.pc = 0xaaaa_0000_0040;
        arm.tpidr = 0xbbb0;
        snapshot.threads[0].context = ThreadContext::Aarch64(arm);
        snapshot.exception = None;
        let parsed = read_minidump(&write_to_vec(&snapshot)).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_header_layout() {
        let bytes = write_to_vec(&sample_snapshot());
        assert_eq!(&bytes[0..4], &DUMP_MAGIC.to_le_bytes());
        assert_eq!(&bytes[4..8], &DUMP_VERSION.to_le_bytes());
        let num_streams = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
        assert_eq!(num_streams, 8);
        let dir_offset = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
        assert_eq!(dir_offset as usize, HEADER_LEN);
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = write_to_vec(&sample_snapshot());
        bytes[0] ^= 0xff;
        assert!(matches!(
            read_minidump(&bytes),
            Err(faultline_common::Error::Corrupt(_))
        ));
    }

    #[test]
    fn test_major_version_mismatch_rejected() {
        let mut bytes = write_to_vec(&sample_snapshot());
        bytes[4..8].copy_from_slice(&(DUMP_VERSION + 1).to_le_bytes());
        assert!(read_minidump(&bytes).is_err());
    }

    #[test]
    fn test_minor_version_bump_tolerated() {
        let mut bytes = write_to_vec(&sample_snapshot());
        bytes[4..8].copy_from_slice(&(DUMP_VERSION | 0x0005_0000).to_le_bytes());
        read_minidump(&bytes).unwrap();
    }

    #[test]
    fn test_unknown_stream_skipped() {
        // Rewrite the handle-data stream's type to something unknown; the
        // parse must succeed and simply drop the handles.
        let snapshot = sample_snapshot();
        let mut bytes = write_to_vec(&snapshot);
        let dir_offset = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let num_streams = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        for i in 0..num_streams {
            let at = dir_offset + i * DIRECTORY_ENTRY_LEN;
            let stream_type = u32::from_le_bytes(bytes[at..at + 4].try_into().unwrap());
            if stream_type == STREAM_HANDLE_DATA {
                bytes[at..at + 4].copy_from_slice(&0x7777_7777u32.to_le_bytes());
            }
        }

        let parsed = read_minidump(&bytes).unwrap();
        assert!(parsed.handles.is_empty());
        assert_eq!(parsed.threads, snapshot.threads);
    }

    #[test]
    fn test_truncated_file_rejected() {
        let bytes = write_to_vec(&sample_snapshot());
        assert!(read_minidump(&bytes[..HEADER_LEN - 4]).is_err());
        assert!(read_minidump(&bytes[..bytes.len() / 2]).is_err());
    }
}
