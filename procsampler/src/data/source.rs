use std::io;

use crate::config::SamplerSettings;
use crate::data::process::ProcessSnapshot;
use crate::error::AcquireError;

/// Platform capability for reading per-process accounting data.
///
/// One implementation exists per supported OS. Unsupported targets get
/// [`UnsupportedSource`], which fails uniformly instead of being compiled out.
pub trait ProcessDataSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn is_supported(&self) -> bool;

    /// Live process ids, at most `max` of them.
    fn list_pids(&self, max: usize) -> io::Result<Vec<u32>>;

    /// Read one process. `cpu_percent` is left at 0.0 for the caller to fill.
    fn acquire(&self, pid: u32) -> Result<ProcessSnapshot, AcquireError>;

    /// Scheduler clock ticks per second, used to turn CPU ticks into time.
    fn clock_ticks_per_sec(&self) -> u64 {
        100
    }
}

/// Source for targets with no process-metrics implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnsupportedSource;

impl ProcessDataSource for UnsupportedSource {
    fn name(&self) -> &'static str {
        "unsupported"
    }

    fn is_supported(&self) -> bool {
        false
    }

    fn list_pids(&self, _max: usize) -> io::Result<Vec<u32>> {
        Ok(Vec::new())
    }

    fn acquire(&self, _pid: u32) -> Result<ProcessSnapshot, AcquireError> {
        Err(AcquireError::Unsupported)
    }
}

/// The data source for the platform this binary was built for.
#[cfg(target_os = "linux")]
pub fn platform_source(settings: &SamplerSettings) -> Box<dyn ProcessDataSource> {
    Box::new(crate::data::procfs::ProcfsSource::new(&settings.proc_root))
}

#[cfg(not(target_os = "linux"))]
pub fn platform_source(_settings: &SamplerSettings) -> Box<dyn ProcessDataSource> {
    Box::new(UnsupportedSource)
}

/// Why the current platform cannot collect process metrics, if it cannot.
pub fn unsupported_reason() -> Option<&'static str> {
    if cfg!(target_os = "linux") {
        None
    } else if cfg!(target_os = "macos") {
        Some("Process metrics collection is not yet implemented on macOS")
    } else if cfg!(target_os = "windows") {
        Some("Process metrics collection is not yet implemented on Windows")
    } else {
        Some("Process metrics collection is not supported on this platform")
    }
}
