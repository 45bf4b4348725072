// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub type Result<T> = std::result::Result<T, Error>;

/// Error taxonomy shared across the handler, database and snapshot layers.
///
/// Every layer surfaces its own kind; callers map between kinds at the
/// boundaries (the upload worker treats everything except [`Error::NotFound`]
/// as retryable, the server converts capture failures into a `DumpFailed`
/// reply).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("i/o failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("entity not found")]
    NotFound,
    #[error("report lease held elsewhere")]
    Busy,
    #[error("validation failed: {0}")]
    Corrupt(String),
    #[error("malformed message: {0}")]
    Protocol(String),
    #[error("target not accessible: {0}")]
    PermissionDenied(String),
    #[error("upload transport: {0}")]
    Transport(String),
    #[error("invariant violated: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the upload worker may retry the operation under backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::NotFound)
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        match errno {
            nix::errno::Errno::EPERM | nix::errno::Errno::EACCES => {
                Error::PermissionDenied(errno.desc().into())
            }
            nix::errno::Errno::ENOENT | nix::errno::Errno::ESRCH => Error::NotFound,
            _ => Error::Io(std::io::Error::from_raw_os_error(errno as i32)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_is_not_retryable() {
        assert!(!Error::NotFound.is_retryable());
        assert!(Error::Busy.is_retryable());
        assert!(Error::Transport("timed out".into()).is_retryable());
    }

    #[test]
    fn test_errno_mapping() {
        assert!(matches!(
            Error::from(nix::errno::Errno::EACCES),
            Error::PermissionDenied(_)
        ));
        assert!(matches!(
            Error::from(nix::errno::Errno::ESRCH),
            Error::NotFound
        ));
    }
}
