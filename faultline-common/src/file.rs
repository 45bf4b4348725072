// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Advisory-locked file handles and atomic replacement.
//!
//! Every piece of cross-process shared state in the crash-report database is
//! guarded by a whole-file advisory lock: shared for readers, exclusive for
//! writers. The lock lives exactly as long as the handle, so dropping a
//! [`LockedFile`] on any exit path releases it.

use crate::error::{Error, Result};
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// A file handle holding a `flock` advisory lock until dropped.
pub struct LockedFile {
    inner: Flock<File>,
}

impl LockedFile {
    /// Opens `path` with `options` and blocks until the lock is acquired.
    pub fn open(path: &Path, options: &OpenOptions, mode: LockMode) -> Result<Self> {
        let file = options.open(path)?;
        let arg = match mode {
            LockMode::Shared => FlockArg::LockShared,
            LockMode::Exclusive => FlockArg::LockExclusive,
        };
        match Flock::lock(file, arg) {
            Ok(inner) => Ok(LockedFile { inner }),
            Err((_, errno)) => Err(errno.into()),
        }
    }

    /// Opens `path` and attempts the lock without blocking. Returns
    /// [`Error::Busy`] if another handle holds a conflicting lock.
    pub fn try_open(path: &Path, options: &OpenOptions, mode: LockMode) -> Result<Self> {
        let file = options.open(path)?;
        let arg = match mode {
            LockMode::Shared => FlockArg::LockSharedNonblock,
            LockMode::Exclusive => FlockArg::LockExclusiveNonblock,
        };
        match Flock::lock(file, arg) {
            Ok(inner) => Ok(LockedFile { inner }),
            Err((_, nix::errno::Errno::EWOULDBLOCK)) => Err(Error::Busy),
            Err((_, errno)) => Err(errno.into()),
        }
    }

}

impl Deref for LockedFile {
    type Target = File;

    fn deref(&self) -> &File {
        &self.inner
    }
}

impl DerefMut for LockedFile {
    fn deref_mut(&mut self) -> &mut File {
        &mut self.inner
    }
}

/// Replaces the contents of `path` with `bytes` via a same-volume rename.
///
/// Readers on the same volume observe either the previous contents or the
/// new ones, never a prefix. The temporary carries the writer's pid so two
/// processes replacing the same path cannot clobber each other's staging
/// file.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::Internal(format!("unusable path {}", path.display())))?;
    let tmp = path.with_file_name(format!(".{}.{}.tmp", file_name, std::process::id()));

    let mut file = File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e.into());
    }
    Ok(())
}
