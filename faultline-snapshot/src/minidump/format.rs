// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Wire constants and primitive codecs for the crash-dump file format.
//!
//! The file is a 32-byte header, a directory of `{stream_type, length,
//! offset}` entries, then the stream bodies in directory order. Integers are
//! little-endian, strings are u32-length-prefixed UTF-8, and pointer-sized
//! values are u64 regardless of the source process's bitness.

use faultline_common::{Error, Result};

/// "MDMP", little-endian.
pub const DUMP_MAGIC: u32 = 0x504d_444d;
/// Major version in the low 16 bits, minor in the high. Readers reject a
/// differing major and tolerate a differing minor.
pub const DUMP_VERSION: u32 = 0x0000_0001;

pub const HEADER_LEN: usize = 32;
pub const DIRECTORY_ENTRY_LEN: usize = 12;
/// Stream bodies start on 8-byte boundaries.
pub const STREAM_ALIGN: usize = 8;

pub const STREAM_THREAD_LIST: u32 = 3;
pub const STREAM_MODULE_LIST: u32 = 4;
pub const STREAM_MEMORY_LIST: u32 = 5;
pub const STREAM_EXCEPTION: u32 = 6;
pub const STREAM_SYSTEM_INFO: u32 = 7;
pub const STREAM_HANDLE_DATA: u32 = 12;
pub const STREAM_MISC_INFO: u32 = 15;
/// Vendor-range stream carrying the annotation triples.
pub const STREAM_ANNOTATIONS: u32 = 0x464c_5401;

pub const CONTEXT_TAG_X86_64: u32 = 1;
pub const CONTEXT_TAG_AARCH64: u32 = 2;

pub fn major_version(version: u32) -> u16 {
    (version & 0xffff) as u16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectoryEntry {
    pub stream_type: u32,
    pub length: u32,
    pub offset: u32,
}

/// Append-only encoder for stream bodies.
#[derive(Default)]
pub struct Enc {
    buf: Vec<u8>,
}

impl Enc {
    pub fn new() -> Self {
        Enc::default()
    }

    pub fn put_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_le_bytes());
    }

    pub fn put_raw(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// u32 length prefix + raw bytes.
    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.put_u32(bytes.len() as u32);
        self.put_raw(bytes);
    }

    /// u32 length prefix + UTF-8 bytes.
    pub fn put_string(&mut self, s: &str) {
        self.put_bytes(s.as_bytes());
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }
}

/// Bounds-checked decoder over one stream body.
pub struct Dec<'a> {
    buf: &'a [u8],
    at: usize,
}

impl<'a> Dec<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Dec { buf, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| Error::Corrupt("truncated dump stream".into()))?;
        let out = &self.buf[self.at..end];
        self.at = end;
        Ok(out)
    }

    pub fn get_u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    pub fn get_u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    pub fn get_i32(&mut self) -> Result<i32> {
        Ok(self.get_u32()? as i32)
    }

    pub fn get_u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        Ok(u64::from_le_bytes([
            b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
        ]))
    }

    pub fn get_raw(&mut self, n: usize) -> Result<&'a [u8]> {
        self.take(n)
    }

    pub fn get_vec(&mut self) -> Result<Vec<u8>> {
        let len = self.get_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }

    pub fn get_string(&mut self) -> Result<String> {
        let bytes = self.get_vec()?;
        String::from_utf8(bytes).map_err(|_| Error::Corrupt("non-UTF-8 dump string".into()))
    }

    pub fn is_empty(&self) -> bool {
        self.at == self.buf.len()
    }
}

pub fn align_up(n: usize) -> usize {
    n.div_ceil(STREAM_ALIGN) * STREAM_ALIGN
}
