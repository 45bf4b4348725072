// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use super::elf;
use super::maps::{self, Mapping};
use super::memory::Memory;
use super::ptrace::PtraceAttachment;
use super::stat::{boot_time_seconds, ticks_per_second, ProcStat};
use super::ThreadContext;
use faultline_common::{Error, Result};
use tracing::warn;

/// One loaded binary, in loader order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    pub base_address: u64,
    pub size: u64,
    /// Absolute path of the backing file.
    pub name: String,
    /// GNU build id, empty when the image carries none.
    pub debug_id: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreadInfo {
    pub thread_id: u32,
    pub priority: i32,
    pub nice: i32,
    pub stack_base: u64,
    pub stack_size: u64,
    pub tls_address: u64,
    pub context: ThreadContext,
}

/// One open descriptor of the target, for the handle-data stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdInfo {
    pub fd: u32,
    pub target: String,
}

/// Read-only attachment to a target process.
///
/// Constructing a reader suspends every task of the target via ptrace; the
/// suspension lasts until the reader is dropped, and dropping detaches on
/// every exit path so the target is never left stopped after a failed
/// capture.
pub struct ProcessReader {
    pid: i32,
    attachment: PtraceAttachment,
    memory: Memory,
    mappings: Vec<Mapping>,
    stat: ProcStat,
    is_64_bit: bool,
    main_executable: String,
}

impl ProcessReader {
    pub fn attach(pid: u32) -> Result<Self> {
        let pid = pid as i32;
        let attachment = PtraceAttachment::attach_all(pid)?;
        let memory = Memory::open(pid)?;
        let mappings = maps::parse_maps(&std::fs::read_to_string(format!("/proc/{pid}/maps"))?)?;
        let stat = ProcStat::read(pid)?;
        let main_executable = std::fs::read_link(format!("/proc/{pid}/exe"))
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        // The word width of the target is the word width of its main image.
        let is_64_bit = mappings
            .iter()
            .find(|m| m.is_backed_by_file() && m.path == main_executable && m.offset == 0)
            .and_then(|m| elf::read_elf_image(&memory, m.start).ok())
            .map(|image| image.is_64_bit)
            .unwrap_or(cfg!(target_pointer_width = "64"));

        Ok(ProcessReader {
            pid,
            attachment,
            memory,
            mappings,
            stat,
            is_64_bit,
            main_executable,
        })
    }

    pub fn process_id(&self) -> u32 {
        self.pid as u32
    }

    pub fn parent_process_id(&self) -> u32 {
        self.stat.ppid
    }

    pub fn is_64_bit(&self) -> bool {
        self.is_64_bit
    }

    /// Process start time in epoch seconds.
    pub fn start_time(&self) -> Result<u64> {
        Ok(boot_time_seconds()? + self.stat.start_time_ticks / ticks_per_second())
    }

    /// `(user, system)` CPU time consumed, in milliseconds.
    pub fn cpu_times(&self) -> (u64, u64) {
        let tick_ms = 1000 / ticks_per_second().max(1);
        (self.stat.utime * tick_ms, self.stat.stime * tick_ms)
    }

    pub fn mappings(&self) -> &[Mapping] {
        &self.mappings
    }

    /// Reads `buf.len()` bytes at `address` with the short-read policy of
    /// [`Memory::read`]: a read crossing into unreadable memory returns the
    /// prefix, a read starting in unreadable memory fails.
    pub fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<usize> {
        self.memory.read(address, buf)
    }

    pub fn read_c_string(&self, address: u64, max_size: usize) -> Result<String> {
        self.memory.read_c_string(address, max_size)
    }

    /// Loaded modules, main executable first. Mappings that claim a backing
    /// file but do not yet hold a loaded image (a list racing `dlopen`) are
    /// skipped with a warning rather than aborting the capture.
    pub fn modules(&self) -> Vec<ModuleInfo> {
        let mut modules: Vec<ModuleInfo> = Vec::new();
        for window_start in 0..self.mappings.len() {
            let mapping = &self.mappings[window_start];
            if !mapping.is_backed_by_file() || mapping.offset != 0 {
                continue;
            }
            if modules.iter().any(|m| m.name == mapping.path) {
                continue;
            }

            let image = match elf::read_elf_image(&self.memory, mapping.start) {
                Ok(image) => image,
                Err(e) => {
                    warn!(
                        path = %mapping.path,
                        base = format_args!("{:#x}", mapping.start),
                        error = %e,
                        "skipping module without a loaded image"
                    );
                    continue;
                }
            };

            // The module extends over every subsequent mapping of the same
            // file (text, rodata, data segments).
            let end = self
                .mappings
                .iter()
                .skip(window_start)
                .take_while(|m| m.path == mapping.path)
                .last()
                .map(|m| m.end)
                .unwrap_or(mapping.end);

            modules.push(ModuleInfo {
                base_address: mapping.start,
                size: end - mapping.start,
                name: mapping.path.clone(),
                debug_id: image.build_id,
            });
        }

        // Entry 0 is the main executable whenever it can be identified.
        if let Some(main) = modules
            .iter()
            .position(|m| m.name == self.main_executable)
        {
            modules.swap(0, main);
        }
        modules
    }

    /// Per-thread state, captured while the target is suspended.
    pub fn threads(&self) -> Vec<ThreadInfo> {
        let mut threads = Vec::new();
        for &tid in self.attachment.tids() {
            let context = match self.attachment.thread_context(tid) {
                Ok(context) => context,
                Err(e) => {
                    warn!(pid = self.pid, tid, error = %e, "cannot read thread registers");
                    continue;
                }
            };
            let task_stat = match ProcStat::read_task(self.pid, tid) {
                Ok(stat) => stat,
                Err(e) => {
                    warn!(pid = self.pid, tid, error = %e, "cannot read task stat");
                    continue;
                }
            };

            let stack_pointer = context.stack_pointer();
            let (stack_base, stack_size) = maps::stack_bounds(&self.mappings, stack_pointer)
                .map(|(base, end)| (base, end - base))
                .unwrap_or((stack_pointer, 0));

            threads.push(ThreadInfo {
                thread_id: tid as u32,
                priority: task_stat.priority,
                nice: task_stat.nice,
                stack_base,
                stack_size,
                tls_address: context.tls_address(),
                context,
            });
        }
        threads
    }

    /// The target's open descriptors (`/proc/<pid>/fd`). Best effort: an
    /// unreadable table yields an empty list.
    pub fn open_files(&self) -> Vec<FdInfo> {
        let mut out = Vec::new();
        let Ok(entries) = std::fs::read_dir(format!("/proc/{}/fd", self.pid)) else {
            return out;
        };
        for entry in entries.filter_map(|e| e.ok()) {
            let Some(fd) = entry.file_name().to_str().and_then(|n| n.parse().ok()) else {
                continue;
            };
            let target = std::fs::read_link(entry.path())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default();
            out.push(FdInfo { fd, target });
        }
        out.sort_by_key(|f| f.fd);
        out
    }

    /// Fails unless `address` lies in readable mapped memory; used to vet
    /// caller-supplied pointers before dereferencing them.
    pub fn check_readable(&self, address: u64) -> Result<()> {
        match maps::mapping_containing(&self.mappings, address) {
            Some(m) if m.readable => Ok(()),
            _ => Err(Error::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{kill, Signal};
    use nix::sys::wait::waitpid;
    use nix::unistd::{fork, ForkResult};

    /// Forks a child that idles in `pause()`, runs `check` against it in
    /// the parent, then reaps it. The child shares this binary's layout,
    /// so the parent can verify reads against its own addresses.
    fn with_paused_child(check: impl FnOnce(u32)) {
        // SAFETY: the child only calls async-signal-safe functions before
        // being killed.
        match unsafe { fork() }.unwrap() {
            ForkResult::Child => loop {
                unsafe { libc::pause() };
            },
            ForkResult::Parent { child } => {
                let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                    check(child.as_raw() as u32)
                }));
                let _ = kill(child, Signal::SIGKILL);
                let _ = waitpid(child, None);
                if let Err(panic) = result {
                    std::panic::resume_unwind(panic);
                }
            }
        }
    }

    static PAYLOAD: &[u8] = b"faultline process reader payload\0";

    #[test]
    fn test_read_child_memory() {
        with_paused_child(|pid| {
            let reader = ProcessReader::attach(pid).unwrap();
            assert_eq!(reader.process_id(), pid);
            assert_eq!(reader.parent_process_id(), std::process::id());
            assert!(reader.is_64_bit() == cfg!(target_pointer_width = "64"));

            let mut buf = vec![0u8; PAYLOAD.len()];
            let n = reader
                .read_memory(PAYLOAD.as_ptr() as u64, &mut buf)
                .unwrap();
            assert_eq!(n, PAYLOAD.len());
            assert_eq!(buf, PAYLOAD);

            let s = reader
                .read_c_string(PAYLOAD.as_ptr() as u64, 4096)
                .unwrap();
            assert_eq!(s.as_bytes(), &PAYLOAD[..PAYLOAD.len() - 1]);
        });
    }

    #[test]
    fn test_read_unmapped_memory_fails() {
        with_paused_child(|pid| {
            let reader = ProcessReader::attach(pid).unwrap();
            let mut buf = [0u8; 16];
            assert!(reader.read_memory(8, &mut buf).is_err());
            assert!(reader.check_readable(8).is_err());
            assert!(reader.check_readable(PAYLOAD.as_ptr() as u64).is_ok());
        });
    }

    #[test]
    fn test_modules_lists_main_executable_first() {
        with_paused_child(|pid| {
            let reader = ProcessReader::attach(pid).unwrap();
            let modules = reader.modules();
            assert!(!modules.is_empty());
            let exe = std::fs::read_link("/proc/self/exe").unwrap();
            assert_eq!(modules[0].name, exe.to_string_lossy());
            assert!(modules[0].size > 0);
        });
    }

    #[test]
    fn test_module_build_id_matches_on_disk_image() {
        with_paused_child(|pid| {
            let reader = ProcessReader::attach(pid).unwrap();
            let main = &reader.modules()[0];

            let bytes = std::fs::read(&main.name).unwrap();
            let elf = goblin::elf::Elf::parse(&bytes).unwrap();
            let disk_id: &[u8] = elf
                .iter_note_headers(&bytes)
                .into_iter()
                .flatten()
                .flatten()
                .find(|note| note.n_type == goblin::elf::note::NT_GNU_BUILD_ID)
                .map(|note| note.desc)
                .unwrap_or(&[]);
            assert_eq!(main.debug_id, disk_id);
        });
    }

    #[test]
    fn test_threads_have_stacks_and_contexts() {
        with_paused_child(|pid| {
            let reader = ProcessReader::attach(pid).unwrap();
            let threads = reader.threads();
            assert!(!threads.is_empty());
            for thread in &threads {
                let sp = thread.context.stack_pointer();
                assert!(sp != 0);
                assert!(thread.stack_size > 0);
                assert!(sp >= thread.stack_base);
                assert!(sp < thread.stack_base + thread.stack_size);
            }
        });
    }

    #[test]
    fn test_drop_resumes_target() {
        with_paused_child(|pid| {
            drop(ProcessReader::attach(pid).unwrap());
            // A detached process answers signal 0 probes.
            kill(nix::unistd::Pid::from_raw(pid as i32), None).unwrap();
        });
    }
}
