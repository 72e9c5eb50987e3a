//! Minimal cgroup-v2 plumbing for per-sandbox resource accounting.
//!
//! All paths are plain sysfs text files; every operation degrades to a
//! logged warning when the hierarchy is absent or read-only.

use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

const DEFAULT_BASE: &str = "/sys/fs/cgroup";

/// Cumulative usage counters read from one cgroup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CgroupUsage {
    pub cpu_usec: u64,
    pub memory_peak: u64,
    pub oom_kills: u64,
}

/// Locate a writable cgroup-v2 hierarchy, or `None` when the host does not
/// offer one to this process.
pub fn detect_base() -> Option<PathBuf> {
    let base = PathBuf::from(DEFAULT_BASE);
    if !base.join("cgroup.controllers").is_file() {
        return None;
    }
    let probe = base.join(format!("gavel-probe-{}", std::process::id()));
    match std::fs::create_dir(&probe) {
        Ok(()) => {
            let _ = std::fs::remove_dir(&probe);
            Some(base)
        }
        Err(err) => {
            debug!(error = %err, "cgroup hierarchy not writable; falling back to procfs accounting");
            None
        }
    }
}

pub fn create(base: &Path, name: &str) -> io::Result<PathBuf> {
    let path = base.join(name);
    std::fs::create_dir(&path)?;
    Ok(path)
}

/// Apply per-stage caps. Unset values reset the knob to `max`.
pub fn set_limits(cgroup: &Path, memory_bytes: Option<u64>, pids: Option<u64>) {
    let write = |file: &str, value: String| {
        if let Err(err) = std::fs::write(cgroup.join(file), value) {
            debug!(file, error = %err, "cgroup limit not applied");
        }
    };
    write(
        "memory.max",
        memory_bytes.map_or_else(|| "max".into(), |v| v.to_string()),
    );
    write(
        "pids.max",
        pids.map_or_else(|| "max".into(), |v| v.to_string()),
    );
}

/// Reset the peak-memory watermark where the kernel supports it. Returns
/// whether the subsequent `memory.peak` reading is per-stage accurate.
pub fn reset_memory_peak(cgroup: &Path) -> bool {
    std::fs::write(cgroup.join("memory.peak"), "0").is_ok()
}

pub fn read_usage(cgroup: &Path) -> CgroupUsage {
    let mut usage = CgroupUsage::default();
    if let Ok(stat) = std::fs::read_to_string(cgroup.join("cpu.stat")) {
        for line in stat.lines() {
            if let Some(value) = line.strip_prefix("usage_usec ") {
                usage.cpu_usec = value.trim().parse().unwrap_or(0);
            }
        }
    }
    if let Ok(peak) = std::fs::read_to_string(cgroup.join("memory.peak")) {
        usage.memory_peak = peak.trim().parse().unwrap_or(0);
    }
    if let Ok(events) = std::fs::read_to_string(cgroup.join("memory.events")) {
        for line in events.lines() {
            if let Some(value) = line.strip_prefix("oom_kill ") {
                usage.oom_kills = value.trim().parse().unwrap_or(0);
            }
        }
    }
    usage
}

/// Kill every process still in the group, then remove it.
pub fn destroy(cgroup: &Path) {
    // cgroup.kill SIGKILLs the whole subtree atomically (Linux 5.14+).
    let _ = std::fs::write(cgroup.join("cgroup.kill"), "1");
    for _ in 0..10 {
        match std::fs::remove_dir(cgroup) {
            Ok(()) => return,
            // EBUSY while the kernel reaps members; retry briefly.
            Err(err) if err.raw_os_error() == Some(libc::EBUSY) => {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
            Err(err) => {
                warn!(cgroup = %cgroup.display(), error = %err, "failed to remove cgroup");
                return;
            }
        }
    }
    warn!(cgroup = %cgroup.display(), "cgroup still busy after kill; leaving for host cleanup");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_of_missing_group_is_zeroed() {
        let usage = read_usage(Path::new("/nonexistent/cgroup"));
        assert_eq!(usage, CgroupUsage::default());
    }

    #[test]
    fn detect_base_never_panics() {
        // Result depends on the host; only the probe contract is asserted.
        let _ = detect_base();
    }
}
