// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-time handler spawning (`StartHandlerAtCrash`).
//!
//! `execve` needs NUL-terminated argument and environment arrays in a
//! specific layout, and building them allocates. All of that happens at
//! setup time; the crash path only calls `socketpair`, `fork`, `dup2` and
//! `execve`, which are async-signal-safe.

use faultline_common::{Error, Result};
use std::ffi::CString;
use std::os::unix::io::RawFd;
use std::path::PathBuf;

/// The child end of the crash-time socketpair is moved to this fd before
/// execve so the argument list can be prepared ahead of time.
pub(crate) const HANDLER_CLIENT_FD: RawFd = 3;

/// What to run when a crash needs a handler.
#[derive(Debug, Clone)]
pub struct HandlerSpawnConfig {
    /// Path of the `faultline-handler` executable.
    pub handler_path: PathBuf,
    /// Database root handed to the handler.
    pub database: PathBuf,
    /// Upload endpoint; `None` leaves reports pending.
    pub url: Option<String>,
    /// Extra `KEY=VALUE` annotations stamped into the report.
    pub annotations: Vec<(String, String)>,
    /// Extra verbatim arguments.
    pub extra_arguments: Vec<String>,
}

impl HandlerSpawnConfig {
    /// Bakes the argv into execve-ready form.
    pub(crate) fn prepare(&self) -> Result<PreparedHandlerSpawn> {
        let mut arguments = vec![
            self.handler_path.to_string_lossy().into_owned(),
            format!("--database={}", self.database.display()),
            format!("--initial-client-data={HANDLER_CLIENT_FD}"),
        ];
        if let Some(url) = &self.url {
            arguments.push(format!("--url={url}"));
        }
        for (key, value) in &self.annotations {
            arguments.push(format!("--annotation={key}={value}"));
        }
        arguments.extend(self.extra_arguments.iter().cloned());
        PreparedHandlerSpawn::new(&self.handler_path, &arguments)
    }
}

/// An execve image frozen at setup time: owned CStrings plus the
/// NUL-terminated pointer arrays execve wants.
pub(crate) struct PreparedHandlerSpawn {
    path: CString,
    _arguments: Vec<CString>,
    argv: Vec<*const libc::c_char>,
}

// SAFETY: the raw pointers point into `_arguments`/`path`, which are owned
// by the same value and never mutated after construction.
unsafe impl Send for PreparedHandlerSpawn {}
unsafe impl Sync for PreparedHandlerSpawn {}

impl PreparedHandlerSpawn {
    fn new(path: &PathBuf, arguments: &[String]) -> Result<Self> {
        let path = CString::new(path.to_string_lossy().into_owned())
            .map_err(|_| Error::Internal("NUL in handler path".into()))?;
        let arguments: Vec<CString> = arguments
            .iter()
            .map(|a| {
                CString::new(a.as_str())
                    .map_err(|_| Error::Internal("NUL in handler argument".into()))
            })
            .collect::<Result<_>>()?;
        let mut argv: Vec<*const libc::c_char> =
            arguments.iter().map(|a| a.as_ptr()).collect();
        argv.push(std::ptr::null());
        Ok(PreparedHandlerSpawn {
            path,
            _arguments: arguments,
            argv,
        })
    }

    /// Replaces the current (forked) process image with the handler.
    ///
    /// # Safety
    /// Call only in a freshly forked child on the crash path.
    pub(crate) unsafe fn exec(&self) -> ! {
        unsafe {
            // Inherit the parent's environment as-is.
            libc::execv(self.path.as_ptr(), self.argv.as_ptr());
            // execv only returns on failure; nothing to clean up in a
            // crashing fork child.
            libc::_exit(1)
        }
    }

    pub(crate) fn argv_len(&self) -> usize {
        self.argv.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn test_prepare_bakes_expected_argv() {
        let config = HandlerSpawnConfig {
            handler_path: "/usr/bin/faultline-handler".into(),
            database: "/var/crash".into(),
            url: Some("http://collector.example/submit".into()),
            annotations: vec![("prod".into(), "demo".into())],
            extra_arguments: vec!["--no-rate-limit".into()],
        };
        let prepared = config.prepare().unwrap();

        let argv: Vec<&str> = prepared._arguments
            .iter()
            .map(|c| c.to_str().unwrap())
            .collect();
        assert_eq!(
            argv,
            [
                "/usr/bin/faultline-handler",
                "--database=/var/crash",
                "--initial-client-data=3",
                "--url=http://collector.example/submit",
                "--annotation=prod=demo",
                "--no-rate-limit",
            ]
        );
        // argv is NUL-terminated for execv.
        assert_eq!(prepared.argv_len(), argv.len() + 1);
        assert!(prepared.argv.last().unwrap().is_null());
        assert_eq!(
            unsafe { CStr::from_ptr(prepared.argv[0]) }.to_str().unwrap(),
            "/usr/bin/faultline-handler"
        );
    }

    #[test]
    fn test_nul_in_argument_rejected() {
        let config = HandlerSpawnConfig {
            handler_path: "/bin/handler".into(),
            database: "/d".into(),
            url: None,
            annotations: vec![("bad\0key".into(), "v".into())],
            extra_arguments: vec![],
        };
        assert!(config.prepare().is_err());
    }
}
