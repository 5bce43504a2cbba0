use serde::{Deserialize, Serialize};

/// Longest name kept in a snapshot, matching the kernel's 16-byte comm buffer
/// minus its terminator.
pub const NAME_MAX_LEN: usize = 15;

/// One process observed at one sampling instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub pid: u32,
    pub ppid: u32,
    pub name: String,
    pub uid: u32,
    /// Clock ticks since boot. Descriptive only.
    pub start_time_ticks: u64,
    pub state: ProcessState,
    pub cpu_user_ticks: u64,
    pub cpu_system_ticks: u64,
    /// Filled in from history by the sampler; 0.0 on first observation.
    pub cpu_percent: f64,
    pub threads: u32,
    pub memory: MemoryPages,
    pub io_read_bytes: u64,
    pub io_write_bytes: u64,
    pub fds: u32,
    /// Monotonic clock at acquisition, in nanoseconds.
    pub timestamp_ns: u64,
}

impl ProcessSnapshot {
    /// Empty record for `pid`, every optional field at its default.
    pub fn new(pid: u32) -> Self {
        Self {
            pid,
            ppid: 0,
            name: placeholder_name(pid),
            uid: 0,
            start_time_ticks: 0,
            state: ProcessState::Unknown,
            cpu_user_ticks: 0,
            cpu_system_ticks: 0,
            cpu_percent: 0.0,
            threads: 0,
            memory: MemoryPages::default(),
            io_read_bytes: 0,
            io_write_bytes: 0,
            fds: 0,
            timestamp_ns: 0,
        }
    }

    /// User plus system CPU ticks, the quantity the history table tracks.
    pub fn cpu_total_ticks(&self) -> u64 {
        self.cpu_user_ticks.saturating_add(self.cpu_system_ticks)
    }
}

/// Page counts from `/proc/<pid>/statm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryPages {
    pub size: u64,
    pub resident: u64,
    pub shared: u64,
    pub text: u64,
    /// Data plus stack.
    pub data: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "char", from = "char")]
pub enum ProcessState {
    Running,
    Sleeping,
    DiskSleep,
    Zombie,
    Stopped,
    TracingStop,
    Dead,
    Idle,
    Unknown,
}

impl ProcessState {
    pub fn from_proc_stat(c: char) -> Self {
        match c {
            'R' => Self::Running,
            'S' => Self::Sleeping,
            'D' => Self::DiskSleep,
            'Z' => Self::Zombie,
            'T' => Self::Stopped,
            't' => Self::TracingStop,
            'X' | 'x' => Self::Dead,
            'I' => Self::Idle,
            _ => Self::Unknown,
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            Self::Running => 'R',
            Self::Sleeping => 'S',
            Self::DiskSleep => 'D',
            Self::Zombie => 'Z',
            Self::Stopped => 'T',
            Self::TracingStop => 't',
            Self::Dead => 'X',
            Self::Idle => 'I',
            Self::Unknown => '?',
        }
    }
}

impl From<ProcessState> for char {
    fn from(state: ProcessState) -> char {
        state.as_char()
    }
}

impl From<char> for ProcessState {
    fn from(c: char) -> Self {
        Self::from_proc_stat(c)
    }
}

/// Tag passed to the sink with every record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleKind {
    ProcessSample,
}

impl SampleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessSample => "process_sample",
        }
    }
}

/// Name used when a process's comm cannot be read.
pub fn placeholder_name(pid: u32) -> String {
    format!("pid-{pid}")
}

/// Cut `name` to at most [`NAME_MAX_LEN`] bytes without splitting a character.
pub fn truncate_name(name: &str) -> String {
    if name.len() <= NAME_MAX_LEN {
        return name.to_string();
    }
    let mut end = NAME_MAX_LEN;
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    name[..end].to_string()
}

/// Format bytes into human-readable form (K, M, G).
pub fn format_bytes(bytes: u64) -> String {
    if bytes >= 1024 * 1024 * 1024 {
        format!("{:.1}G", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    } else if bytes >= 1024 * 1024 {
        format!("{:.0}M", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.0}K", bytes as f64 / 1024.0)
    } else {
        format!("{}B", bytes)
    }
}
