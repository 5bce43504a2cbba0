//! The background sampling worker.
//!
//! One [`Sampler`] owns at most one thread. Each tick it enumerates PIDs,
//! prunes history for PIDs that went away, reads a bounded prefix of the
//! list in full, derives CPU percent and forwards the snapshots. Between
//! ticks the thread waits on a condition variable so [`Sampler::stop`] can
//! wake it immediately.

use std::io;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::SamplerSettings;
use crate::data::history::HistoryTable;
use crate::data::process::SampleKind;
use crate::data::source::ProcessDataSource;
use crate::error::SamplerError;
use crate::sink::RecordSink;

/// Per-activation parameters for the worker.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplerOptions {
    pub interval: Duration,
    pub max_pids: usize,
    /// Full reads (including the fd directory walk) are capped at this many
    /// PIDs per tick to keep tick duration bounded.
    pub max_detailed_pids: usize,
    pub cpu_percent_ceiling: f64,
}

impl SamplerOptions {
    pub fn from_settings(settings: &SamplerSettings, interval: Duration) -> Self {
        Self {
            interval,
            max_pids: settings.max_pids,
            max_detailed_pids: settings.max_detailed_pids,
            cpu_percent_ceiling: settings.cpu_percent_ceiling,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Running,
    Stopping,
}

/// Counters readable from any thread while the worker runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplerStats {
    pub ticks: u64,
    pub acquired: u64,
    pub failed: u64,
    /// History entries held after the last tick.
    pub tracked: usize,
}

/// Outcome of one enumerate-prune-acquire-forward cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub enumerated: usize,
    pub pruned: usize,
    pub selected: usize,
    pub acquired: usize,
    pub failed: usize,
}

#[derive(Debug, Default)]
struct Counters {
    ticks: AtomicU64,
    acquired: AtomicU64,
    failed: AtomicU64,
    tracked: AtomicUsize,
}

impl Counters {
    fn reset(&self) {
        self.ticks.store(0, Ordering::Relaxed);
        self.acquired.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.tracked.store(0, Ordering::Relaxed);
    }
}

struct Shared {
    state: Mutex<WorkerState>,
    wake: Condvar,
    counters: Counters,
}

impl Shared {
    fn state(&self) -> WorkerState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_state(&self, state: WorkerState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
    }
}

pub struct Sampler {
    source: Arc<dyn ProcessDataSource>,
    sink: Option<Arc<dyn RecordSink>>,
    shared: Arc<Shared>,
    /// Held for the whole of start/stop so control calls never interleave.
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sampler {
    pub fn new(source: Arc<dyn ProcessDataSource>, sink: Option<Arc<dyn RecordSink>>) -> Self {
        Self {
            source,
            sink,
            shared: Arc::new(Shared {
                state: Mutex::new(WorkerState::Idle),
                wake: Condvar::new(),
                counters: Counters::default(),
            }),
            handle: Mutex::new(None),
        }
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    pub fn stats(&self) -> SamplerStats {
        let c = &self.shared.counters;
        SamplerStats {
            ticks: c.ticks.load(Ordering::Relaxed),
            acquired: c.acquired.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            tracked: c.tracked.load(Ordering::Relaxed),
        }
    }

    /// Spawn the sampling thread. Fails with [`SamplerError::AlreadyRunning`]
    /// unless the sampler is idle.
    pub fn start(&self, options: SamplerOptions) -> Result<(), SamplerError> {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != WorkerState::Idle {
                return Err(SamplerError::AlreadyRunning);
            }
            *state = WorkerState::Running;
        }
        // A worker that died on its own leaves its handle behind.
        if let Some(stale) = handle.take() {
            if stale.join().is_err() {
                log::error!("previous process sampler thread panicked");
            }
        }
        self.shared.counters.reset();

        let worker = Worker {
            history: HistoryTable::new(self.source.clock_ticks_per_sec(), options.cpu_percent_ceiling),
            source: Arc::clone(&self.source),
            sink: self.sink.clone(),
            shared: Arc::clone(&self.shared),
            options,
        };

        match thread::Builder::new()
            .name("proc-sampler".to_string())
            .spawn(move || worker.run())
        {
            Ok(h) => {
                *handle = Some(h);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(WorkerState::Idle);
                log::error!("failed to create process monitoring thread: {e}");
                Err(SamplerError::ThreadSpawn(e))
            }
        }
    }

    /// Wake the thread, wait for it to exit and return to idle. Does nothing
    /// if the sampler is not running.
    pub fn stop(&self) {
        let mut handle = self.handle.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            if *state != WorkerState::Running {
                return;
            }
            *state = WorkerState::Stopping;
        }
        self.shared.wake.notify_all();

        if let Some(h) = handle.take() {
            if h.join().is_err() {
                log::error!("process sampler thread panicked");
            }
        }
        self.shared.set_state(WorkerState::Idle);
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        self.stop();
    }
}

struct Worker {
    source: Arc<dyn ProcessDataSource>,
    sink: Option<Arc<dyn RecordSink>>,
    shared: Arc<Shared>,
    history: HistoryTable,
    options: SamplerOptions,
}

impl Worker {
    fn run(mut self) {
        let _exit = ExitGuard(Arc::clone(&self.shared));
        log::info!(
            "process sampler started ({}, interval {} ms)",
            self.source.name(),
            self.options.interval.as_millis()
        );

        while self.shared.state() == WorkerState::Running {
            self.tick();

            let state = self.shared.state.lock().unwrap_or_else(PoisonError::into_inner);
            let (state, _) = self
                .shared
                .wake
                .wait_timeout_while(state, self.options.interval, |s| *s == WorkerState::Running)
                .unwrap_or_else(PoisonError::into_inner);
            if *state != WorkerState::Running {
                break;
            }
        }

        log::info!("process sampler stopped");
    }

    fn tick(&mut self) {
        let counters = &self.shared.counters;
        let n = counters.ticks.fetch_add(1, Ordering::Relaxed) + 1;

        let report = match run_tick(
            self.source.as_ref(),
            &mut self.history,
            self.sink.as_deref(),
            &self.options,
        ) {
            Ok(report) => report,
            Err(e) => {
                log::warn!("collection #{n} skipped: listing processes failed: {e}");
                return;
            }
        };

        counters.acquired.fetch_add(report.acquired as u64, Ordering::Relaxed);
        counters.failed.fetch_add(report.failed as u64, Ordering::Relaxed);
        counters.tracked.store(self.history.len(), Ordering::Relaxed);

        if report.enumerated > report.selected {
            log::debug!("{} more processes not sampled", report.enumerated - report.selected);
        }
        log::info!(
            "collection #{n} completed - read {}/{} processes, tracking {} histories",
            report.acquired,
            report.selected,
            self.history.len()
        );
    }
}

/// Puts the sampler back to idle if the worker unwinds, so a panicking
/// sink does not leave it stuck in `Running`.
struct ExitGuard(Arc<Shared>);

impl Drop for ExitGuard {
    fn drop(&mut self) {
        if thread::panicking() {
            log::error!("process sampler thread panicked");
            self.0.set_state(WorkerState::Idle);
        }
    }
}

/// One full tick. An error means the PID list itself could not be read;
/// history is left untouched in that case.
pub fn run_tick(
    source: &dyn ProcessDataSource,
    history: &mut HistoryTable,
    sink: Option<&dyn RecordSink>,
    options: &SamplerOptions,
) -> io::Result<TickReport> {
    let pids = source.list_pids(options.max_pids)?;
    let pruned = history.prune(&pids);
    let selected = &pids[..pids.len().min(options.max_detailed_pids)];

    let mut report = TickReport {
        enumerated: pids.len(),
        pruned,
        selected: selected.len(),
        ..Default::default()
    };

    for &pid in selected {
        let mut snap = match source.acquire(pid) {
            Ok(snap) => snap,
            Err(e) => {
                log::debug!("pid {pid}: {e}");
                report.failed += 1;
                continue;
            }
        };
        snap.cpu_percent = history.derive(pid, snap.cpu_total_ticks(), snap.timestamp_ns);
        report.acquired += 1;

        log::debug!(
            "pid {} ({}) state={} cpu%={:.2} threads={} fds={}",
            snap.pid,
            snap.name,
            snap.state.as_char(),
            snap.cpu_percent,
            snap.threads,
            snap.fds
        );
        if let Some(sink) = sink {
            sink.record(SampleKind::ProcessSample, &snap);
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::process::ProcessSnapshot;
    use crate::error::AcquireError;
    use crate::sink::ChannelSink;
    use std::collections::{HashMap, HashSet};
    use std::sync::mpsc::{self, Receiver};
    use std::time::Instant;

    const SEC: u64 = 1_000_000_000;

    /// In-memory source. Every acquire of a PID advances its clock by one
    /// second and its CPU counter by 50 ticks, i.e. 50% at 100 Hz.
    #[derive(Default)]
    struct ScriptedSource {
        pids: Mutex<Vec<u32>>,
        missing: Mutex<HashSet<u32>>,
        seen: Mutex<HashMap<u32, u64>>,
        fail_listing: Mutex<bool>,
    }

    impl ScriptedSource {
        fn with_pids(pids: &[u32]) -> Self {
            let source = Self::default();
            source.set_pids(pids);
            source
        }

        fn set_pids(&self, pids: &[u32]) {
            *self.pids.lock().unwrap() = pids.to_vec();
        }

        fn set_missing(&self, pids: &[u32]) {
            *self.missing.lock().unwrap() = pids.iter().copied().collect();
        }
    }

    impl ProcessDataSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn is_supported(&self) -> bool {
            true
        }

        fn list_pids(&self, max: usize) -> io::Result<Vec<u32>> {
            if *self.fail_listing.lock().unwrap() {
                return Err(io::Error::new(io::ErrorKind::NotFound, "no proc"));
            }
            Ok(self.pids.lock().unwrap().iter().copied().take(max).collect())
        }

        fn acquire(&self, pid: u32) -> Result<ProcessSnapshot, AcquireError> {
            if self.missing.lock().unwrap().contains(&pid) {
                return Err(AcquireError::NotFound { pid });
            }
            let mut seen = self.seen.lock().unwrap();
            let n = seen.entry(pid).or_insert(0);
            *n += 1;

            let mut snap = ProcessSnapshot::new(pid);
            snap.cpu_user_ticks = *n * 30;
            snap.cpu_system_ticks = *n * 20;
            snap.timestamp_ns = *n * SEC;
            Ok(snap)
        }
    }

    fn options(max_detailed_pids: usize, interval: Duration) -> SamplerOptions {
        SamplerOptions {
            interval,
            max_pids: 100,
            max_detailed_pids,
            cpu_percent_ceiling: 1000.0,
        }
    }

    fn channel() -> (Arc<dyn RecordSink>, Receiver<(SampleKind, ProcessSnapshot)>) {
        let (tx, rx) = mpsc::channel();
        (Arc::new(ChannelSink::new(tx)), rx)
    }

    fn cpu_by_pid(rx: &Receiver<(SampleKind, ProcessSnapshot)>) -> HashMap<u32, f64> {
        rx.try_iter().map(|(_, s)| (s.pid, s.cpu_percent)).collect()
    }

    #[test]
    fn failed_pid_does_not_abort_the_tick() {
        let source = ScriptedSource::with_pids(&[1, 2, 3, 4]);
        source.set_missing(&[2]);
        let (sink, rx) = channel();
        let mut history = HistoryTable::new(100, 1000.0);

        let report = run_tick(&source, &mut history, Some(sink.as_ref()), &options(10, Duration::ZERO)).unwrap();

        assert_eq!(report.enumerated, 4);
        assert_eq!(report.selected, 4);
        assert_eq!(report.acquired, 3);
        assert_eq!(report.failed, 1);
        let pids: Vec<u32> = rx.try_iter().map(|(_, s)| s.pid).collect();
        assert_eq!(pids, vec![1, 3, 4]);
        assert!(!history.contains(2));
    }

    #[test]
    fn cpu_percent_starts_at_zero_then_follows_deltas() {
        let source = ScriptedSource::with_pids(&[10, 11]);
        let (sink, rx) = channel();
        let mut history = HistoryTable::new(100, 1000.0);
        let opts = options(10, Duration::ZERO);

        run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        for (_, cpu) in cpu_by_pid(&rx) {
            assert_eq!(cpu, 0.0);
        }

        run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        let cpu = cpu_by_pid(&rx);
        assert_eq!(cpu.len(), 2);
        for pct in cpu.values() {
            assert!((pct - 50.0).abs() < 1e-9, "got {pct}");
        }
    }

    #[test]
    fn vanished_pid_is_pruned_and_returns_fresh() {
        let source = ScriptedSource::with_pids(&[1, 42]);
        let (sink, rx) = channel();
        let mut history = HistoryTable::new(100, 1000.0);
        let opts = options(10, Duration::ZERO);

        run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        assert!(history.contains(42));

        source.set_pids(&[1]);
        let report = run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        assert_eq!(report.pruned, 1);
        assert!(!history.contains(42));

        rx.try_iter().for_each(drop);
        source.set_pids(&[1, 42]);
        run_tick(&source, &mut history, Some(sink.as_ref()), &opts).unwrap();
        let cpu = cpu_by_pid(&rx);
        assert_eq!(cpu[&42], 0.0);
        assert!(cpu[&1] > 0.0);
    }

    #[test]
    fn full_reads_are_capped() {
        let pids: Vec<u32> = (1..=25).collect();
        let source = ScriptedSource::with_pids(&pids);
        let (sink, rx) = channel();
        let mut history = HistoryTable::new(100, 1000.0);

        let report = run_tick(&source, &mut history, Some(sink.as_ref()), &options(10, Duration::ZERO)).unwrap();
        assert_eq!(report.enumerated, 25);
        assert_eq!(report.selected, 10);
        assert_eq!(rx.try_iter().count(), 10);

        let mut capped = options(10, Duration::ZERO);
        capped.max_pids = 5;
        let report = run_tick(&source, &mut history, None, &capped).unwrap();
        assert_eq!(report.enumerated, 5);
        assert_eq!(report.selected, 5);
        // Entries for PIDs 6..=10 fell outside the enumeration
        assert_eq!(history.len(), 5);
    }

    #[test]
    fn history_is_kept_without_a_sink() {
        let source = ScriptedSource::with_pids(&[1, 2]);
        let mut history = HistoryTable::new(100, 1000.0);

        let report = run_tick(&source, &mut history, None, &options(10, Duration::ZERO)).unwrap();
        assert_eq!(report.acquired, 2);
        assert_eq!(history.len(), 2);
    }

    #[test]
    fn listing_failure_leaves_history_alone() {
        let source = ScriptedSource::with_pids(&[1]);
        let mut history = HistoryTable::new(100, 1000.0);
        run_tick(&source, &mut history, None, &options(10, Duration::ZERO)).unwrap();

        *source.fail_listing.lock().unwrap() = true;
        assert!(run_tick(&source, &mut history, None, &options(10, Duration::ZERO)).is_err());
        assert!(history.contains(1));
    }

    #[test]
    fn stop_before_start_is_a_noop() {
        let sampler = Sampler::new(Arc::new(ScriptedSource::default()), None);
        sampler.stop();
        sampler.stop();
        assert_eq!(sampler.state(), WorkerState::Idle);
        assert_eq!(sampler.stats(), SamplerStats::default());
    }

    #[test]
    fn second_start_is_rejected() {
        let sampler = Sampler::new(Arc::new(ScriptedSource::with_pids(&[1])), None);
        sampler.start(options(10, Duration::from_secs(60))).unwrap();
        assert!(matches!(
            sampler.start(options(10, Duration::from_secs(60))),
            Err(SamplerError::AlreadyRunning)
        ));
        assert!(sampler.is_running());
        sampler.stop();
        assert_eq!(sampler.state(), WorkerState::Idle);
    }

    #[test]
    fn stop_interrupts_sleep_and_joins() {
        let source = Arc::new(ScriptedSource::with_pids(&[1, 2, 3]));
        let (sink, rx) = channel();
        let sampler = Sampler::new(source, Some(sink));
        sampler.start(options(10, Duration::from_secs(3600))).unwrap();

        // First tick runs immediately, then the worker sleeps for an hour
        for _ in 0..3 {
            rx.recv_timeout(Duration::from_secs(10)).unwrap();
        }

        let started = Instant::now();
        sampler.stop();
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(sampler.state(), WorkerState::Idle);

        let stats = sampler.stats();
        assert_eq!(stats.ticks, 1);
        assert_eq!(stats.acquired, 3);
        assert_eq!(stats.tracked, 3);

        thread::sleep(Duration::from_millis(50));
        assert_eq!(sampler.stats().ticks, 1);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn restart_begins_with_empty_history() {
        let source = Arc::new(ScriptedSource::with_pids(&[7]));
        let (sink, rx) = channel();
        let sampler = Sampler::new(source, Some(sink));

        sampler.start(options(10, Duration::from_millis(10))).unwrap();
        let (_, first) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        let (_, second) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        sampler.stop();
        assert_eq!(first.cpu_percent, 0.0);
        assert!(second.cpu_percent > 0.0);

        rx.try_iter().for_each(drop);
        sampler.start(options(10, Duration::from_secs(3600))).unwrap();
        let (_, after_restart) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        sampler.stop();
        assert_eq!(after_restart.cpu_percent, 0.0);
    }

    #[test]
    fn failures_are_counted() {
        let source = Arc::new(ScriptedSource::with_pids(&[1, 2]));
        source.set_missing(&[1, 2]);
        let (sink, rx) = channel();
        let sampler = Sampler::new(source, Some(sink));
        sampler.start(options(10, Duration::from_secs(3600))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while sampler.stats().ticks == 0 || sampler.stats().failed < 2 {
            assert!(Instant::now() < deadline, "worker never ticked");
            thread::sleep(Duration::from_millis(5));
        }
        sampler.stop();
        assert_eq!(sampler.stats().acquired, 0);
        assert_eq!(sampler.stats().failed, 2);
        assert!(rx.try_recv().is_err());
    }

    /// Panics on the first record, forwards the rest.
    struct PanicOnceSink {
        armed: AtomicUsize,
        inner: ChannelSink,
    }

    impl RecordSink for PanicOnceSink {
        fn record(&self, kind: SampleKind, snapshot: &ProcessSnapshot) {
            if self.armed.swap(0, Ordering::SeqCst) == 1 {
                panic!("sink failure");
            }
            self.inner.record(kind, snapshot);
        }
    }

    #[test]
    fn panicking_sink_returns_sampler_to_idle() {
        let (tx, rx) = mpsc::channel();
        let sink = Arc::new(PanicOnceSink { armed: AtomicUsize::new(1), inner: ChannelSink::new(tx) });
        let sampler = Sampler::new(Arc::new(ScriptedSource::with_pids(&[1])), Some(sink));
        sampler.start(options(10, Duration::from_secs(3600))).unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        while sampler.state() != WorkerState::Idle {
            assert!(Instant::now() < deadline, "sampler stuck after worker panic");
            thread::sleep(Duration::from_millis(5));
        }
        assert!(!sampler.is_running());
        sampler.stop();

        sampler.start(options(10, Duration::from_secs(3600))).unwrap();
        let (_, snap) = rx.recv_timeout(Duration::from_secs(10)).unwrap();
        assert_eq!(snap.pid, 1);
        assert!(sampler.is_running());
        sampler.stop();
        assert_eq!(sampler.state(), WorkerState::Idle);
    }

    #[test]
    fn dropping_a_running_sampler_stops_it() {
        let (sink, rx) = channel();
        let sampler = Sampler::new(Arc::new(ScriptedSource::with_pids(&[1])), Some(sink));
        sampler.start(options(10, Duration::from_millis(5))).unwrap();
        rx.recv_timeout(Duration::from_secs(10)).unwrap();
        drop(sampler);

        // The sink was owned by the worker and the sampler; both are gone.
        while rx.try_recv().is_ok() {}
        assert!(matches!(rx.try_recv(), Err(mpsc::TryRecvError::Disconnected)));
    }
}
