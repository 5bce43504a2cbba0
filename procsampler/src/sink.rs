//! Destinations for emitted samples.
//!
//! The sampler calls [`RecordSink::record`] once per successfully acquired
//! process, from its background thread.

use std::io::Write;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

use serde::Serialize;

use crate::data::process::{format_bytes, ProcessSnapshot, SampleKind};

pub trait RecordSink: Send + Sync {
    fn record(&self, kind: SampleKind, snapshot: &ProcessSnapshot);
}

/// Writes each sample as a human-readable log line at info level.
#[derive(Debug)]
pub struct LogSink {
    page_size: u64,
}

impl LogSink {
    pub fn new() -> Self {
        Self { page_size: page_size() }
    }
}

const FALLBACK_PAGE_SIZE: u64 = 4096;

#[cfg(unix)]
fn page_size() -> u64 {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as u64
    } else {
        FALLBACK_PAGE_SIZE
    }
}

#[cfg(not(unix))]
fn page_size() -> u64 {
    FALLBACK_PAGE_SIZE
}

impl Default for LogSink {
    fn default() -> Self {
        Self::new()
    }
}

impl RecordSink for LogSink {
    fn record(&self, kind: SampleKind, s: &ProcessSnapshot) {
        log::info!(
            "[{}] pid={} name={} ppid={} user={} state={} cpu(u/s)={}/{} cpu%={:.2} \
             mem(size/res/shr)={}/{}/{} io(r/w)={}/{} threads={} fds={}",
            kind.as_str(),
            s.pid,
            s.name,
            s.ppid,
            resolve_username(s.uid),
            s.state.as_char(),
            s.cpu_user_ticks,
            s.cpu_system_ticks,
            s.cpu_percent,
            format_bytes(s.memory.size.saturating_mul(self.page_size)),
            format_bytes(s.memory.resident.saturating_mul(self.page_size)),
            format_bytes(s.memory.shared.saturating_mul(self.page_size)),
            format_bytes(s.io_read_bytes),
            format_bytes(s.io_write_bytes),
            s.threads,
            s.fds,
        );
    }
}

#[derive(Serialize)]
struct JsonRecord<'a> {
    kind: SampleKind,
    sample: &'a ProcessSnapshot,
}

/// One JSON object per line: `{"kind":"process_sample","sample":{...}}`.
pub struct JsonLinesSink<W: Write + Send> {
    out: Mutex<W>,
}

impl<W: Write + Send> JsonLinesSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out) }
    }

    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<W: Write + Send> RecordSink for JsonLinesSink<W> {
    fn record(&self, kind: SampleKind, snapshot: &ProcessSnapshot) {
        let line = match serde_json::to_string(&JsonRecord { kind, sample: snapshot }) {
            Ok(line) => line,
            Err(e) => {
                log::error!("serializing sample for pid {}: {e}", snapshot.pid);
                return;
            }
        };
        let mut out = self.out.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = writeln!(out, "{line}").and_then(|_| out.flush()) {
            log::warn!("writing sample for pid {}: {e}", snapshot.pid);
        }
    }
}

/// Hands samples to another thread over an mpsc channel. Records are
/// dropped once the receiver is gone.
pub struct ChannelSink {
    tx: Mutex<Sender<(SampleKind, ProcessSnapshot)>>,
}

impl ChannelSink {
    pub fn new(tx: Sender<(SampleKind, ProcessSnapshot)>) -> Self {
        Self { tx: Mutex::new(tx) }
    }
}

impl RecordSink for ChannelSink {
    fn record(&self, kind: SampleKind, snapshot: &ProcessSnapshot) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if tx.send((kind, snapshot.clone())).is_err() {
            log::debug!("sample receiver dropped, discarding pid {}", snapshot.pid);
        }
    }
}

#[cfg(unix)]
fn resolve_username(uid: u32) -> String {
    nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
        .ok()
        .flatten()
        .map(|u| u.name)
        .unwrap_or_else(|| uid.to_string())
}

#[cfg(not(unix))]
fn resolve_username(uid: u32) -> String {
    uid.to_string()
}
