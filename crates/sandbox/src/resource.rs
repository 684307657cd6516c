//! Resource sampling from `/proc`.

use evoloop_core::ResourceUsage;
use std::time::Duration;
use tokio::sync::oneshot;

const SAMPLE_INTERVAL: Duration = Duration::from_millis(25);

// USER_HZ as exported by the kernel ABI.
const CLOCK_TICKS_PER_SEC: u64 = 100;

/// Sample `pid` until `stop` fires, returning the peak observations.
pub(crate) async fn sample_until(pid: u32, mut stop: oneshot::Receiver<()>) -> ResourceUsage {
    let mut usage = ResourceUsage::default();
    loop {
        merge(&mut usage, sample(pid).await);
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(SAMPLE_INTERVAL) => {}
        }
    }
    usage
}

fn merge(into: &mut ResourceUsage, sample: ResourceUsage) {
    if let Some(mem) = sample.peak_memory_bytes {
        into.peak_memory_bytes = Some(into.peak_memory_bytes.map_or(mem, |m| m.max(mem)));
    }
    if let Some(cpu) = sample.cpu_time {
        into.cpu_time = Some(into.cpu_time.map_or(cpu, |c| c.max(cpu)));
    }
}

async fn sample(pid: u32) -> ResourceUsage {
    let status = tokio::fs::read_to_string(format!("/proc/{}/status", pid)).await.ok();
    let stat = tokio::fs::read_to_string(format!("/proc/{}/stat", pid)).await.ok();
    ResourceUsage {
        peak_memory_bytes: status.as_deref().and_then(parse_vm_hwm),
        cpu_time: stat.as_deref().and_then(parse_cpu_time),
    }
}

/// `VmHWM:   1234 kB` -> bytes.
pub(crate) fn parse_vm_hwm(status: &str) -> Option<u64> {
    let line = status.lines().find(|l| l.starts_with("VmHWM:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

/// utime + stime from `/proc/<pid>/stat`.
pub(crate) fn parse_cpu_time(stat: &str) -> Option<Duration> {
    // comm may contain spaces; fields resume after the last ')'
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let ticks = utime + stime;
    Some(Duration::from_millis(ticks * 1000 / CLOCK_TICKS_PER_SEC))
}
