/*!
 * Resource Probes
 * Thread CPU clock and process resident-set readings
 */

use std::time::{Duration, Instant};
use tracing::debug;

/// CPU time consumed by the calling thread since the clock was created
///
/// Must be read on the thread that created it. Falls back to wall time
/// where the per-thread clock is unavailable, which overestimates CPU time
/// and therefore errs towards terminating early.
pub struct ThreadCpuClock {
    baseline: Option<Duration>,
    started: Instant,
}

impl ThreadCpuClock {
    pub fn start() -> Self {
        let baseline = thread_cpu_time();
        if baseline.is_none() {
            debug!("Thread CPU clock unavailable, falling back to wall time");
        }
        Self {
            baseline,
            started: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        match (self.baseline, thread_cpu_time()) {
            (Some(baseline), Some(now)) => now.saturating_sub(baseline),
            _ => self.started.elapsed(),
        }
    }
}

#[cfg(unix)]
fn thread_cpu_time() -> Option<Duration> {
    use nix::time::{clock_gettime, ClockId};
    clock_gettime(ClockId::CLOCK_THREAD_CPUTIME_ID)
        .ok()
        .map(Duration::from)
}

#[cfg(not(unix))]
fn thread_cpu_time() -> Option<Duration> {
    None
}

/// Resident set size of this process in bytes
///
/// The sandbox shares one process across executions, so this is a
/// process-wide reading: a breach means the host is in danger regardless of
/// which execution caused it.
pub fn resident_set_bytes() -> u64 {
    proc_status_rss().or_else(rusage_max_rss).unwrap_or(0)
}

fn proc_status_rss() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kib: u64 = line
        .trim_start_matches("VmRSS:")
        .trim()
        .trim_end_matches("kB")
        .trim()
        .parse()
        .ok()?;
    Some(kib * 1024)
}

#[cfg(unix)]
fn rusage_max_rss() -> Option<u64> {
    use nix::sys::resource::{getrusage, UsageWho};
    let usage = getrusage(UsageWho::RUSAGE_SELF).ok()?;
    let max_rss = u64::try_from(usage.max_rss()).ok()?;
    // Linux reports KiB, macOS reports bytes
    if cfg!(target_os = "macos") {
        Some(max_rss)
    } else {
        Some(max_rss * 1024)
    }
}

#[cfg(not(unix))]
fn rusage_max_rss() -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_clock_advances_with_work() {
        let clock = ThreadCpuClock::start();
        let mut acc = 0u64;
        for i in 0..2_000_000u64 {
            acc = acc.wrapping_mul(31).wrapping_add(i);
        }
        std::hint::black_box(acc);
        assert!(clock.elapsed() > Duration::ZERO);
    }

    #[test]
    fn test_cpu_clock_ignores_sleep() {
        let clock = ThreadCpuClock::start();
        std::thread::sleep(Duration::from_millis(50));
        if thread_cpu_time().is_some() {
            assert!(clock.elapsed() < Duration::from_millis(40));
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_resident_set_is_reported() {
        assert!(resident_set_bytes() > 0);
    }
}
