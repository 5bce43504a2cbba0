use std::io;

/// Errors surfaced to the host by the engine and the sampling worker.
#[derive(thiserror::Error, Debug)]
pub enum SamplerError {
    /// Process metrics cannot be collected on this platform.
    #[error("{0}")]
    Unsupported(&'static str),
    /// The background thread could not be created.
    #[error("unable to create process monitoring thread: {0}")]
    ThreadSpawn(#[source] io::Error),
    #[error("process sampler is already running")]
    AlreadyRunning,
}

/// Why one PID could not be sampled. Never fatal to a tick.
#[derive(thiserror::Error, Debug)]
pub enum AcquireError {
    /// The mandatory stat record is missing, usually because the process exited.
    #[error("process {pid} not found")]
    NotFound { pid: u32 },
    #[error("malformed stat record for process {pid}: {reason}")]
    Malformed { pid: u32, reason: &'static str },
    #[error("process data is not available on this platform")]
    Unsupported,
}
