use std::io;
use std::path::PathBuf;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;

use procsampler::config::{Config, OutputFormat};
use procsampler::sink::{JsonLinesSink, LogSink, RecordSink};
use procsampler::{Engine, EngineArgs, ProcRecorder};

#[derive(Parser)]
#[command(name = "procsampler", about = "Periodic per-process metrics sampler")]
struct Cli {
    /// Sampling interval in milliseconds
    #[arg(short = 'i', long)]
    interval_ms: Option<u64>,

    /// Stop after this many seconds; SIGINT/SIGTERM still stop it earlier
    #[arg(short = 'd', long)]
    duration: Option<u64>,

    /// Output format for samples
    #[arg(short = 'f', long, value_enum)]
    format: Option<OutputFormat>,

    /// Number of processes read in full each tick
    #[arg(short = 'n', long)]
    max_detailed: Option<usize>,

    /// Config file (default: ~/.config/procsampler/config.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load().unwrap_or_else(|e| {
            log::warn!("{e:#}, using defaults");
            Config::default()
        }),
    };

    // CLI overrides
    if let Some(ms) = cli.interval_ms {
        config.general.interval_ms = ms;
    }
    if let Some(format) = cli.format {
        config.general.output = format;
    }
    if let Some(n) = cli.max_detailed {
        config.sampler.max_detailed_pids = n;
    }

    let sink: Arc<dyn RecordSink> = match config.general.output {
        OutputFormat::Json => Arc::new(JsonLinesSink::new(io::stdout())),
        OutputFormat::Log => Arc::new(LogSink::new()),
    };

    // Must run before the sampler thread exists so it inherits the mask.
    let shutdown = listen_for_shutdown()?;

    let mut recorder = ProcRecorder::new(config.sampler.clone(), Some(sink));
    let args = EngineArgs {
        proc_interval_ns: config.general.interval_ms.saturating_mul(1_000_000),
    };
    recorder.check(&args)?;
    recorder.start(&args)?;

    match wait_for_shutdown(&shutdown, cli.duration.map(Duration::from_secs)) {
        Some(signal) => log::info!("received {signal}, shutting down"),
        None => log::info!("shutting down"),
    }

    recorder.stop();
    let stats = recorder.stats();
    log::info!(
        "{} ticks, {} samples recorded, {} processes skipped",
        stats.ticks,
        stats.acquired,
        stats.failed
    );
    Ok(())
}

/// Blocks SIGINT/SIGTERM on the calling thread and forwards the first one
/// delivered from a dedicated `sigwait` thread.
#[cfg(unix)]
fn listen_for_shutdown() -> Result<Receiver<String>> {
    use anyhow::Context;
    use nix::sys::signal::{SigSet, Signal};

    let (tx, rx) = mpsc::channel();
    let mut signals = SigSet::empty();
    signals.add(Signal::SIGINT);
    signals.add(Signal::SIGTERM);
    signals.thread_block().context("blocking SIGINT/SIGTERM")?;

    thread::Builder::new()
        .name("signal-wait".into())
        .spawn(move || match signals.wait() {
            Ok(signal) => {
                let _ = tx.send(format!("{signal:?}"));
            }
            Err(e) => log::warn!("waiting for shutdown signal: {e}"),
        })
        .context("spawning signal thread")?;
    Ok(rx)
}

// The recorder refuses to start off unix, so nothing is ever waited on here.
#[cfg(not(unix))]
fn listen_for_shutdown() -> Result<Receiver<String>> {
    Ok(mpsc::channel().1)
}

/// Waits for a shutdown notice, giving up after `limit` when one is set.
/// Returns `None` when the limit ran out, or when every sender is gone and
/// no limit was given.
fn wait_for_shutdown<T>(rx: &Receiver<T>, limit: Option<Duration>) -> Option<T> {
    let Some(limit) = limit else {
        return rx.recv().ok();
    };
    let started = Instant::now();
    match rx.recv_timeout(limit) {
        Ok(notice) => Some(notice),
        Err(RecvTimeoutError::Timeout) => None,
        Err(RecvTimeoutError::Disconnected) => {
            thread::sleep(limit.saturating_sub(started.elapsed()));
            None
        }
    }
}
