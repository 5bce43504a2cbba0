//! Diagnostic binary for the per-process acquisition pipeline.
//!
//! Exercises each /proc source independently for one PID, printing
//! PASS/FAIL with details, then runs two full acquisitions through the
//! history table to show a derived CPU percent.
//!
//! Run: ./target/release/diagnose [--pid N] [--proc-root DIR]

use std::path::PathBuf;
#[cfg(unix)]
use std::thread;
#[cfg(unix)]
use std::time::Duration;

use clap::Parser;
#[cfg(unix)]
use procsampler::data::history::HistoryTable;
#[cfg(unix)]
use procsampler::data::procfs::{clock_ticks_per_sec, monotonic_ns, ProcfsSource};
use procsampler::data::source::unsupported_reason;
#[cfg(unix)]
use procsampler::data::source::ProcessDataSource;

#[derive(Parser)]
#[command(name = "diagnose", about = "Check every process data source for one PID")]
struct Cli {
    /// PID to inspect (default: this process)
    #[arg(short, long)]
    pid: Option<u32>,

    /// procfs mount point
    #[arg(long, default_value = "/proc")]
    proc_root: PathBuf,

    /// Milliseconds between the two acquisitions used for CPU percent
    #[arg(long, default_value_t = 500)]
    gap_ms: u64,
}

#[cfg(unix)]
fn main() {
    let cli = Cli::parse();
    let pid = cli.pid.unwrap_or_else(std::process::id);
    let source = ProcfsSource::new(&cli.proc_root);

    let mut pass = 0u32;
    let mut fail = 0u32;
    let total = 10u32;

    println!("=== Process Sampler Diagnostic (pid {pid}) ===\n");

    print_step(1, "Platform support");
    let step = match unsupported_reason() {
        None => Ok(format!("{} source available", source.name())),
        Some(reason) => Err(reason.to_string()),
    };
    report(&step, &mut pass, &mut fail);

    print_step(2, "Clock tick frequency and monotonic clock");
    let (a, b) = (monotonic_ns(), monotonic_ns());
    let step = if a > 0 && b >= a {
        Ok(format!("CLK_TCK={}, CLOCK_MONOTONIC={a} ns", clock_ticks_per_sec()))
    } else {
        Err(format!("CLOCK_MONOTONIC unusable ({a}, {b})"))
    };
    report(&step, &mut pass, &mut fail);

    print_step(3, &format!("Enumerate {}", cli.proc_root.display()));
    let step = match source.list_pids(usize::MAX) {
        Ok(pids) if pids.contains(&pid) => Ok(format!("{} pids, target present", pids.len())),
        Ok(pids) => Err(format!("{} pids, target {pid} missing", pids.len())),
        Err(e) => Err(format!("read_dir: {e}")),
    };
    report(&step, &mut pass, &mut fail);

    print_step(4, "stat (mandatory)");
    let stat = source.read_stat(pid);
    let step = match &stat {
        Ok(s) => Ok(format!(
            "ppid={} state={} utime={} stime={} threads={} starttime={}",
            s.ppid, s.state, s.utime, s.stime, s.threads, s.start_time
        )),
        Err(e) => Err(e.to_string()),
    };
    report(&step, &mut pass, &mut fail);
    if stat.is_err() {
        summary(pass, fail, total);
        return;
    }

    print_step(5, "comm");
    report(&optional(source.read_name(pid), |n| format!("name={n}")), &mut pass, &mut fail);

    print_step(6, "statm");
    report(
        &optional(source.read_statm(pid), |m| {
            format!(
                "size={} resident={} shared={} text={} data={} pages",
                m.size, m.resident, m.shared, m.text, m.data
            )
        }),
        &mut pass,
        &mut fail,
    );

    print_step(7, "io");
    report(
        &optional(source.read_io(pid), |(r, w)| format!("read_bytes={r} write_bytes={w}")),
        &mut pass,
        &mut fail,
    );

    print_step(8, "status Uid");
    report(&optional(source.read_uid(pid), |uid| format!("uid={uid}")), &mut pass, &mut fail);

    print_step(9, "fd directory");
    report(&optional(source.count_fds(pid), |n| format!("{n} open descriptors")), &mut pass, &mut fail);

    print_step(10, "Two acquisitions through the history table");
    let step = derive_twice(&source, pid, Duration::from_millis(cli.gap_ms));
    report(&step, &mut pass, &mut fail);

    summary(pass, fail, total);
}

#[cfg(not(unix))]
fn main() {
    let _ = Cli::parse();
    println!("=== Process Sampler Diagnostic ===\n");
    print_step(1, "Platform support");
    let step = Err(unsupported_reason()
        .unwrap_or("procfs is only available on unix")
        .to_string());
    let (mut pass, mut fail) = (0, 0);
    report(&step, &mut pass, &mut fail);
    summary(pass, fail, 1);
}

/// Optional sources never fail a step; a missing one is reported as defaulted.
#[cfg(unix)]
fn optional<T>(value: Option<T>, describe: impl FnOnce(T) -> String) -> Result<String, String> {
    Ok(value
        .map(describe)
        .unwrap_or_else(|| "unavailable, fields default to 0".to_string()))
}

#[cfg(unix)]
fn derive_twice(source: &ProcfsSource, pid: u32, gap: Duration) -> Result<String, String> {
    let mut history = HistoryTable::new(source.clock_ticks_per_sec(), 1000.0);

    let first = source.acquire(pid).map_err(|e| format!("first acquire: {e}"))?;
    let seed = history.derive(pid, first.cpu_total_ticks(), first.timestamp_ns);
    if seed != 0.0 {
        return Err(format!("first observation gave {seed:.2}%, expected 0"));
    }

    thread::sleep(gap);

    let second = source.acquire(pid).map_err(|e| format!("second acquire: {e}"))?;
    let pct = history.derive(pid, second.cpu_total_ticks(), second.timestamp_ns);
    Ok(format!(
        "{} ticks over {:.3} s -> cpu {:.2}%",
        second.cpu_total_ticks().saturating_sub(first.cpu_total_ticks()),
        second.timestamp_ns.saturating_sub(first.timestamp_ns) as f64 / 1e9,
        pct
    ))
}

fn print_step(n: u32, desc: &str) {
    println!("[Step {n:>2}] {desc}");
}

fn report(result: &Result<String, String>, pass: &mut u32, fail: &mut u32) {
    match result {
        Ok(msg) => {
            println!("  ✓ PASS: {msg}\n");
            *pass += 1;
        }
        Err(msg) => {
            println!("  ✗ FAIL: {msg}\n");
            *fail += 1;
        }
    }
}

fn summary(pass: u32, fail: u32, total: u32) {
    println!("=== Summary: {pass}/{total} passed, {fail} failed ===");
    if fail > 0 {
        std::process::exit(1);
    }
}
