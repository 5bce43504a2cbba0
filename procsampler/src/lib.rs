//! Periodic per-process metrics sampler.
//!
//! A [`engine::ProcRecorder`] owns a [`sampler::Sampler`], which runs one
//! background thread that enumerates processes, reads their accounting data
//! through a [`data::source::ProcessDataSource`], derives CPU percent from the
//! previous tick and forwards each snapshot to a [`sink::RecordSink`].

pub mod config;
pub mod data;
pub mod engine;
pub mod error;
pub mod sampler;
pub mod sink;

pub use data::process::{MemoryPages, ProcessSnapshot, ProcessState, SampleKind};
pub use engine::{Engine, EngineArgs, ProcRecorder};
pub use error::{AcquireError, SamplerError};
