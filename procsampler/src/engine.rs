//! Host-facing lifecycle for the process sampler.

use std::sync::Arc;
use std::time::Duration;

use crate::config::SamplerSettings;
use crate::data::source::{platform_source, unsupported_reason, ProcessDataSource};
use crate::error::SamplerError;
use crate::sampler::{Sampler, SamplerOptions, SamplerStats};
use crate::sink::RecordSink;

/// Arguments the host passes when starting an engine.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineArgs {
    /// Sampling interval in nanoseconds.
    pub proc_interval_ns: u64,
}

/// A pluggable collection engine driven by the host profiler.
pub trait Engine {
    fn kind(&self) -> &'static str;
    fn title(&self) -> &'static str;
    fn units(&self) -> &'static str;

    /// Whether the engine can run here. Has no side effects.
    fn check(&self, args: &EngineArgs) -> Result<(), SamplerError>;
    fn start(&mut self, args: &EngineArgs) -> Result<(), SamplerError>;
    fn stop(&mut self);
}

/// Periodically records per-process metrics.
pub struct ProcRecorder {
    sampler: Sampler,
    source: Arc<dyn ProcessDataSource>,
    settings: SamplerSettings,
}

impl ProcRecorder {
    /// Recorder backed by this platform's data source.
    pub fn new(settings: SamplerSettings, sink: Option<Arc<dyn RecordSink>>) -> Self {
        let source: Arc<dyn ProcessDataSource> = Arc::from(platform_source(&settings));
        Self::with_source(settings, source, sink)
    }

    pub fn with_source(
        settings: SamplerSettings,
        source: Arc<dyn ProcessDataSource>,
        sink: Option<Arc<dyn RecordSink>>,
    ) -> Self {
        Self {
            sampler: Sampler::new(Arc::clone(&source), sink),
            source,
            settings,
        }
    }

    pub fn running(&self) -> bool {
        self.sampler.is_running()
    }

    pub fn stats(&self) -> SamplerStats {
        self.sampler.stats()
    }

    /// Host interval (ns) in whole milliseconds, raised to the configured floor.
    pub fn effective_interval(&self, args: &EngineArgs) -> Duration {
        let ms = args.proc_interval_ns / 1_000_000;
        Duration::from_millis(ms.max(self.settings.min_interval_ms))
    }
}

impl Engine for ProcRecorder {
    fn kind(&self) -> &'static str {
        "proc"
    }

    fn title(&self) -> &'static str {
        "Process Metrics"
    }

    fn units(&self) -> &'static str {
        "processes"
    }

    fn check(&self, _args: &EngineArgs) -> Result<(), SamplerError> {
        if let Some(reason) = unsupported_reason() {
            return Err(SamplerError::Unsupported(reason));
        }
        if !self.source.is_supported() {
            return Err(SamplerError::Unsupported(
                "Process metrics collection is not supported by this data source",
            ));
        }
        Ok(())
    }

    fn start(&mut self, args: &EngineArgs) -> Result<(), SamplerError> {
        self.check(args)?;

        let interval = self.effective_interval(args);
        log::info!("Starting process metrics collection, interval {} ms", interval.as_millis());

        self.sampler
            .start(SamplerOptions::from_settings(&self.settings, interval))?;
        log::info!("Process monitoring thread created successfully");
        Ok(())
    }

    fn stop(&mut self) {
        if self.sampler.is_running() {
            log::info!("Stopping process metrics collection");
        }
        self.sampler.stop();
    }
}
