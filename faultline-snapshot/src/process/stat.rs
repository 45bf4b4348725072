// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use faultline_common::{Error, Result};

/// Fields of `/proc/<pid>/stat` (or a task's `stat`) the snapshot needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ProcStat {
    pub ppid: u32,
    /// In clock ticks.
    pub utime: u64,
    pub stime: u64,
    pub priority: i32,
    pub nice: i32,
    /// Ticks after boot at which the process started.
    pub start_time_ticks: u64,
}

impl ProcStat {
    pub fn parse(contents: &str) -> Result<Self> {
        let bad = || Error::Corrupt("unparseable /proc stat record".into());

        // The comm field is parenthesized and may contain spaces or even a
        // ')'; everything after the last ')' is whitespace-separated.
        let tail = contents.rfind(')').map(|i| &contents[i + 1..]).ok_or_else(bad)?;
        let fields: Vec<&str> = tail.split_whitespace().collect();
        // tail starts at field 3 ("state"); stat(5) numbers fields from 1.
        let field = |n: usize| fields.get(n - 3).copied().ok_or_else(bad);

        Ok(ProcStat {
            ppid: field(4)?.parse().map_err(|_| bad())?,
            utime: field(14)?.parse().map_err(|_| bad())?,
            stime: field(15)?.parse().map_err(|_| bad())?,
            priority: field(18)?.parse().map_err(|_| bad())?,
            nice: field(19)?.parse().map_err(|_| bad())?,
            start_time_ticks: field(22)?.parse().map_err(|_| bad())?,
        })
    }

    pub fn read(pid: i32) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(format!("/proc/{pid}/stat"))?)
    }

    pub fn read_task(pid: i32, tid: i32) -> Result<Self> {
        Self::parse(&std::fs::read_to_string(format!(
            "/proc/{pid}/task/{tid}/stat"
        ))?)
    }
}

pub(crate) fn ticks_per_second() -> u64 {
    // SAFETY: sysconf has no preconditions.
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks <= 0 {
        100
    } else {
        ticks as u64
    }
}

/// Boot time in epoch seconds, from the `btime` line of `/proc/stat`.
pub(crate) fn boot_time_seconds() -> Result<u64> {
    let contents = std::fs::read_to_string("/proc/stat")?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("btime ") {
            return rest
                .trim()
                .parse()
                .map_err(|_| Error::Corrupt("unparseable btime in /proc/stat".into()));
        }
    }
    Err(Error::Corrupt("no btime in /proc/stat".into()))
}
