// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use faultline_common::{Error, Result};
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Byte-level access to a stopped target's address space through
/// `/proc/<pid>/mem`.
pub(crate) struct Memory {
    file: File,
    page: u64,
}

impl Memory {
    pub fn open(pid: i32) -> Result<Self> {
        let path = format!("/proc/{pid}/mem");
        let file = File::open(Path::new(&path)).map_err(|e| match e.kind() {
            std::io::ErrorKind::PermissionDenied => {
                Error::PermissionDenied(format!("open {path}"))
            }
            _ => Error::Io(e),
        })?;
        Ok(Memory {
            file,
            page: page_size::get() as u64,
        })
    }

    /// Reads up to `buf.len()` bytes from `address`.
    ///
    /// Short-read policy: a read that crosses into unreadable memory
    /// returns the bytes before the boundary; a read whose first byte is
    /// unreadable fails. Reads are issued page by page because the kernel
    /// fails the whole `pread` when any page in the range is unmapped.
    pub fn read(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        let mut done = 0usize;
        while done < buf.len() {
            let at = address + done as u64;
            let until_page_end = (self.page - (at % self.page)) as usize;
            let want = until_page_end.min(buf.len() - done);
            match self.file.read_at(&mut buf[done..done + want], at) {
                Ok(0) if done == 0 => return Err(Error::NotFound),
                Ok(0) => return Ok(done),
                Ok(n) => done += n,
                Err(_) if done > 0 => return Ok(done),
                Err(e) => {
                    return Err(match e.raw_os_error() {
                        Some(libc::EIO) | Some(libc::EFAULT) => Error::NotFound,
                        _ => Error::Io(e),
                    })
                }
            }
        }
        Ok(done)
    }

    /// Reads exactly `buf.len()` bytes or fails.
    pub fn read_exact(&self, address: u64, buf: &mut [u8]) -> Result<()> {
        let n = self.read(address, buf)?;
        if n != buf.len() {
            return Err(Error::NotFound);
        }
        Ok(())
    }

    /// Reads forward from `address` until a NUL byte, or fails if none is
    /// found within `max_size` or the memory is unmapped.
    pub fn read_c_string(&self, address: u64, max_size: usize) -> Result<String> {
        let mut out = Vec::new();
        let mut chunk = [0u8; 256];
        while out.len() < max_size {
            let want = chunk.len().min(max_size - out.len());
            let got = self.read(address + out.len() as u64, &mut chunk[..want])?;
            if let Some(nul) = chunk[..got].iter().position(|&b| b == 0) {
                out.extend_from_slice(&chunk[..nul]);
                return String::from_utf8(out)
                    .map_err(|_| Error::Corrupt("string is not UTF-8".into()));
            }
            out.extend_from_slice(&chunk[..got]);
            if got < want {
                // Hit unreadable memory before any NUL.
                return Err(Error::NotFound);
            }
        }
        Err(Error::Corrupt(format!(
            "no NUL within {max_size} bytes at {address:#x}"
        )))
    }
}
