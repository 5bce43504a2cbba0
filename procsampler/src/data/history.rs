use std::collections::{HashMap, HashSet};

const NANOS_PER_SEC: f64 = 1_000_000_000.0;

/// CPU accounting remembered from the previous observation of one PID.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HistoryEntry {
    pub prev_cpu_total_ticks: u64,
    pub prev_timestamp_ns: u64,
    pub has_prior_sample: bool,
}

/// Per-PID memo of the last sample, used to turn cumulative CPU ticks into
/// a utilization percentage.
///
/// Owned by a single sampling thread; not shared.
#[derive(Debug)]
pub struct HistoryTable {
    entries: HashMap<u32, HistoryEntry>,
    clock_ticks_per_sec: u64,
    ceiling: f64,
}

impl HistoryTable {
    pub fn new(clock_ticks_per_sec: u64, ceiling: f64) -> Self {
        Self {
            entries: HashMap::new(),
            clock_ticks_per_sec: clock_ticks_per_sec.max(1),
            ceiling: ceiling.max(0.0),
        }
    }

    /// CPU percent for `pid` since its previous observation.
    ///
    /// The first observation seeds the table and returns 0.0. The stored
    /// snapshot is overwritten on every call.
    pub fn derive(&mut self, pid: u32, total_ticks: u64, timestamp_ns: u64) -> f64 {
        let current = HistoryEntry {
            prev_cpu_total_ticks: total_ticks,
            prev_timestamp_ns: timestamp_ns,
            has_prior_sample: true,
        };

        let Some(prev) = self.entries.insert(pid, current) else {
            return 0.0;
        };
        if !prev.has_prior_sample || timestamp_ns <= prev.prev_timestamp_ns {
            return 0.0;
        }

        let delta_ticks = total_ticks.saturating_sub(prev.prev_cpu_total_ticks);
        let delta_ns = (timestamp_ns - prev.prev_timestamp_ns) as f64;
        let cpu_ns = delta_ticks as f64 * NANOS_PER_SEC / self.clock_ticks_per_sec as f64;

        (cpu_ns / delta_ns * 100.0).min(self.ceiling)
    }

    /// Drop every entry whose PID is not in `live`.
    ///
    /// Must run before the tick's acquisitions so a recycled PID never
    /// inherits the previous owner's counters.
    pub fn prune(&mut self, live: &[u32]) -> usize {
        let live: HashSet<u32> = live.iter().copied().collect();
        let before = self.entries.len();
        self.entries.retain(|pid, _| live.contains(pid));
        before - self.entries.len()
    }

    pub fn get(&self, pid: u32) -> Option<&HistoryEntry> {
        self.entries.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.entries.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
