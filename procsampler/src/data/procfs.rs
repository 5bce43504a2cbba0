//! Process data read from the Linux `/proc` filesystem.
//!
//! Only `/proc/<pid>/stat` is mandatory. `comm`, `statm`, `io`, `status` and
//! `fd/` are best-effort: when one is missing or unreadable (permissions,
//! kernel config, process exiting mid-read) its fields stay at zero.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use nix::time::{clock_gettime, ClockId};

use super::process::{placeholder_name, truncate_name, MemoryPages, ProcessSnapshot, ProcessState};
use super::source::ProcessDataSource;
use crate::error::AcquireError;

/// Fields after the `(comm)` entry that must be present in a stat record.
/// starttime is field 22 overall, index 19 after comm.
const STAT_MIN_FIELDS: usize = 20;

/// Reads processes from a procfs mount.
#[derive(Debug, Clone)]
pub struct ProcfsSource {
    root: PathBuf,
    clock_ticks: u64,
}

/// The subset of `/proc/<pid>/stat` this sampler uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFields {
    pub pid: u32,
    pub state: char,
    pub ppid: u32,
    pub utime: u64,
    pub stime: u64,
    pub threads: u32,
    pub start_time: u64,
}

impl ProcfsSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            clock_ticks: clock_ticks_per_sec(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn pid_path(&self, pid: u32, entry: &str) -> PathBuf {
        self.root.join(pid.to_string()).join(entry)
    }

    /// Short name from `comm`, newline stripped and truncated.
    pub fn read_name(&self, pid: u32) -> Option<String> {
        let content = fs::read_to_string(self.pid_path(pid, "comm")).ok()?;
        let name = content.trim_end_matches('\n');
        if name.is_empty() {
            return None;
        }
        Some(truncate_name(name))
    }

    pub fn read_stat(&self, pid: u32) -> Result<StatFields, AcquireError> {
        let content =
            fs::read_to_string(self.pid_path(pid, "stat")).map_err(|_| AcquireError::NotFound { pid })?;
        parse_stat(pid, &content)
    }

    pub fn read_statm(&self, pid: u32) -> Option<MemoryPages> {
        let content = fs::read_to_string(self.pid_path(pid, "statm")).ok()?;
        parse_statm(&content)
    }

    /// `(read_bytes, write_bytes)`. The io file needs ptrace access, so it is
    /// commonly unreadable for other users' processes.
    pub fn read_io(&self, pid: u32) -> Option<(u64, u64)> {
        let content = fs::read_to_string(self.pid_path(pid, "io")).ok()?;
        Some(parse_io(&content))
    }

    pub fn read_uid(&self, pid: u32) -> Option<u32> {
        let content = fs::read_to_string(self.pid_path(pid, "status")).ok()?;
        parse_uid(&content)
    }

    /// Number of open descriptors. Walks the whole fd directory, which is the
    /// most expensive read per process.
    pub fn count_fds(&self, pid: u32) -> Option<u32> {
        let entries = fs::read_dir(self.pid_path(pid, "fd")).ok()?;
        let count = entries
            .flatten()
            .filter(|e| !e.file_name().to_string_lossy().starts_with('.'))
            .count();
        Some(u32::try_from(count).unwrap_or(u32::MAX))
    }
}

impl ProcessDataSource for ProcfsSource {
    fn name(&self) -> &'static str {
        "procfs"
    }

    fn is_supported(&self) -> bool {
        cfg!(target_os = "linux")
    }

    fn list_pids(&self, max: usize) -> io::Result<Vec<u32>> {
        let mut pids = Vec::new();
        for entry in fs::read_dir(&self.root)?.flatten() {
            if pids.len() >= max {
                break;
            }
            let Ok(pid) = entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
                pids.push(pid);
            }
        }
        pids.sort_unstable();
        Ok(pids)
    }

    fn acquire(&self, pid: u32) -> Result<ProcessSnapshot, AcquireError> {
        let mut snap = ProcessSnapshot::new(pid);
        snap.name = self.read_name(pid).unwrap_or_else(|| placeholder_name(pid));

        let stat = self.read_stat(pid)?;
        snap.ppid = stat.ppid;
        snap.state = ProcessState::from_proc_stat(stat.state);
        snap.cpu_user_ticks = stat.utime;
        snap.cpu_system_ticks = stat.stime;
        snap.threads = stat.threads;
        snap.start_time_ticks = stat.start_time;

        if let Some(memory) = self.read_statm(pid) {
            snap.memory = memory;
        }
        if let Some((read, write)) = self.read_io(pid) {
            snap.io_read_bytes = read;
            snap.io_write_bytes = write;
        }
        if let Some(uid) = self.read_uid(pid) {
            snap.uid = uid;
        }
        snap.fds = self.count_fds(pid).unwrap_or(0);
        snap.timestamp_ns = monotonic_ns();

        Ok(snap)
    }

    fn clock_ticks_per_sec(&self) -> u64 {
        self.clock_ticks
    }
}

/// Parse a stat record. The comm field may contain spaces and parentheses,
/// so it is delimited by the first `(` and the last `)`.
pub fn parse_stat(pid: u32, content: &str) -> Result<StatFields, AcquireError> {
    let malformed = |reason| AcquireError::Malformed { pid, reason };

    let open = content.find('(').ok_or_else(|| malformed("missing comm"))?;
    let close = content.rfind(')').ok_or_else(|| malformed("missing comm"))?;
    if close < open {
        return Err(malformed("missing comm"));
    }

    let parsed_pid = content[..open]
        .trim()
        .parse::<u32>()
        .map_err(|_| malformed("bad pid"))?;
    if parsed_pid != pid {
        return Err(malformed("pid mismatch"));
    }

    let rest: Vec<&str> = content[close + 1..].split_whitespace().collect();
    if rest.len() < STAT_MIN_FIELDS {
        return Err(malformed("too few fields"));
    }

    let state = rest[0].chars().next().ok_or_else(|| malformed("bad state"))?;

    Ok(StatFields {
        pid: parsed_pid,
        state,
        ppid: field(&rest, 1).ok_or_else(|| malformed("bad ppid"))?,
        utime: field(&rest, 11).ok_or_else(|| malformed("bad utime"))?,
        stime: field(&rest, 12).ok_or_else(|| malformed("bad stime"))?,
        threads: field(&rest, 17).ok_or_else(|| malformed("bad num_threads"))?,
        start_time: field(&rest, 19).ok_or_else(|| malformed("bad starttime"))?,
    })
}

fn field<T: FromStr>(fields: &[&str], idx: usize) -> Option<T> {
    fields.get(idx)?.parse().ok()
}

/// `size resident shared text lib data dt`, all in pages. Needs at least the
/// first six values.
pub fn parse_statm(content: &str) -> Option<MemoryPages> {
    let parts: Vec<u64> = content
        .split_whitespace()
        .map_while(|s| s.parse().ok())
        .collect();
    if parts.len() < 6 {
        return None;
    }
    Some(MemoryPages {
        size: parts[0],
        resident: parts[1],
        shared: parts[2],
        text: parts[3],
        data: parts[5],
    })
}

pub fn parse_io(content: &str) -> (u64, u64) {
    let mut read_bytes = 0;
    let mut write_bytes = 0;
    for line in content.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim().parse::<u64>().unwrap_or(0);
        match key.trim() {
            "read_bytes" => read_bytes = value,
            "write_bytes" => write_bytes = value,
            _ => {}
        }
    }
    (read_bytes, write_bytes)
}

/// Real uid, the first value on the `Uid:` line.
pub fn parse_uid(content: &str) -> Option<u32> {
    content
        .lines()
        .find_map(|line| line.strip_prefix("Uid:"))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|uid| uid.parse().ok())
}

pub fn clock_ticks_per_sec() -> u64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as u64
    } else {
        100
    }
}

/// `CLOCK_MONOTONIC` in nanoseconds. Returns 0 if the clock cannot be read,
/// which the history table treats as "no elapsed time".
pub fn monotonic_ns() -> u64 {
    match clock_gettime(ClockId::CLOCK_MONOTONIC) {
        Ok(ts) => (ts.tv_sec() as u64)
            .saturating_mul(1_000_000_000)
            .saturating_add(ts.tv_nsec() as u64),
        Err(e) => {
            log::warn!("reading CLOCK_MONOTONIC failed: {e}");
            0
        }
    }
}
