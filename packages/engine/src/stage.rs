//! Stage runner: executes one command line inside a sandbox under a limit
//! set and produces a `StageResult`, even when the child is killed by limit
//! enforcement.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use protocol::{StageResult, StageStatus};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::Command;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use crate::error::EngineError;
use crate::runtime::EffectiveLimits;
use crate::sandbox::{cgroup, SandboxHandle};

/// How long a SIGTERMed process group gets before the unconditional kill.
const KILL_GRACE: Duration = Duration::from_millis(250);
const POLL_INTERVAL: Duration = Duration::from_millis(10);
const READ_CHUNK: usize = 8 * 1024;

/// One stage invocation: the command, its input, and every cap to enforce.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub argv: Vec<String>,
    pub stdin: Vec<u8>,
    pub limits: EffectiveLimits,
    /// Per-stream retention cap; overflow kills the child.
    pub output_cap: usize,
    pub env: Vec<(String, String)>,
    pub process_cap: Option<u64>,
    pub open_files_cap: Option<u64>,
    pub file_size_cap: Option<u64>,
    pub disable_networking: bool,
}

/// Which enforcement action the runner itself took.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KillCause {
    Output,
    Wall,
    Cpu,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProcSample {
    cpu_ms: u64,
    peak_bytes: u64,
}

/// Execute `spec` inside `sandbox`. Errors are engine faults (exec failure,
/// pipe loss); every user-code outcome, including limit kills, comes back
/// as an `Ok(StageResult)`.
pub async fn run_stage(sandbox: &SandboxHandle, spec: StageSpec) -> Result<StageResult, EngineError> {
    if spec.argv.is_empty() {
        return Err(EngineError::Stage("empty command line".into()));
    }

    let cgroup_before = sandbox.cgroup.as_deref().map(cgroup::read_usage);
    let peak_resettable = sandbox
        .cgroup
        .as_deref()
        .is_some_and(cgroup::reset_memory_peak);
    if let Some(cg) = &sandbox.cgroup {
        cgroup::set_limits(cg, spec.limits.memory_bytes, spec.process_cap);
    }

    let mut command = Command::new(&spec.argv[0]);
    command
        .args(&spec.argv[1..])
        .current_dir(&sandbox.root)
        .env_clear()
        .envs(spec.env.iter().cloned())
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let pre_exec = PreExec {
        cgroup_procs: sandbox.cgroup.as_ref().map(|c| c.join("cgroup.procs")),
        cpu_secs: spec.limits.cpu_time_ms.map(|ms| ms.div_ceil(1000).max(1)),
        memory_bytes: spec.limits.memory_bytes,
        file_size: spec.file_size_cap,
        open_files: spec.open_files_cap,
        processes: sandbox.privileged.then_some(spec.process_cap).flatten(),
        unshare_net: spec.disable_networking && sandbox.privileged,
        ids: sandbox.privileged.then_some((sandbox.uid, sandbox.gid)),
    };
    unsafe {
        command.pre_exec(move || pre_exec.apply());
    }

    let mut child = command
        .spawn()
        .map_err(|err| EngineError::Stage(format!("failed to spawn {}: {err}", spec.argv[0])))?;
    let pid = child
        .id()
        .ok_or_else(|| EngineError::Stage("child exited before it could be tracked".into()))? as i32;

    let cause: Arc<OnceLock<KillCause>> = Arc::new(OnceLock::new());

    if let Some(mut stdin_pipe) = child.stdin.take() {
        let bytes = spec.stdin;
        tokio::spawn(async move {
            // Broken pipe just means the child never read its input.
            let _ = stdin_pipe.write_all(&bytes).await;
            let _ = stdin_pipe.shutdown().await;
        });
    }

    let stdout_task = drain_capped(
        child.stdout.take().expect("stdout piped"),
        spec.output_cap,
        Arc::clone(&cause),
        pid,
    );
    let stderr_task = drain_capped(
        child.stderr.take().expect("stderr piped"),
        spec.output_cap,
        Arc::clone(&cause),
        pid,
    );

    let usage = Arc::new(Mutex::new(ProcSample::default()));
    let watchdog = spawn_watchdog(
        pid,
        spec.limits.timeout_ms,
        spec.limits.cpu_time_ms,
        Arc::clone(&cause),
        Arc::clone(&usage),
    );

    let started = Instant::now();
    let status = child
        .wait()
        .await
        .map_err(|err| EngineError::Stage(format!("wait failed: {err}")))?;
    let wall_time_ms = started.elapsed().as_millis() as u64;
    watchdog.abort();

    // Anything still holding the group open dies with the stage.
    let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);

    let (stdout, stdout_truncated) = stdout_task.await.unwrap_or_default();
    let (stderr, stderr_truncated) = stderr_task.await.unwrap_or_default();
    // Truncation outranks any other enforcement that raced with it.
    let effective_cause = if stdout_truncated || stderr_truncated {
        Some(KillCause::Output)
    } else {
        cause.get().copied()
    };

    let sampled = *usage.lock().expect("usage mutex");
    let mut cpu_time_ms = sampled.cpu_ms;
    let mut memory_bytes = sampled.peak_bytes;
    let mut oom_killed = false;
    if let (Some(cg), Some(before)) = (sandbox.cgroup.as_deref(), cgroup_before) {
        let after = cgroup::read_usage(cg);
        // Subtree-wide accounting beats single-pid sampling whenever the
        // controller files are actually populated.
        let cpu_delta = after.cpu_usec.saturating_sub(before.cpu_usec);
        if cpu_delta > 0 {
            cpu_time_ms = cpu_delta / 1_000;
        }
        oom_killed = after.oom_kills > before.oom_kills;
        if peak_resettable {
            memory_bytes = memory_bytes.max(after.memory_peak);
        }
    }

    use std::os::unix::process::ExitStatusExt;
    let exit_code = status.code();
    let raw_signal = status.signal();
    let (status_tag, message) = derive_status(
        effective_cause,
        exit_code,
        raw_signal,
        cpu_time_ms,
        memory_bytes,
        oom_killed,
        &spec.limits,
    );

    debug!(
        sandbox = %sandbox.id,
        exit = ?exit_code,
        signal = ?raw_signal,
        wall_time_ms,
        cpu_time_ms,
        status = ?status_tag,
        "stage finished"
    );

    Ok(StageResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        signal: raw_signal.map(signal_name),
        wall_time_ms,
        cpu_time_ms,
        memory_bytes,
        status: status_tag,
        message,
    })
}

/// Graceful group shutdown: SIGTERM, a short grace window, then SIGKILL.
async fn terminate_group(pid: i32) {
    let pgid = Pid::from_raw(pid);
    let _ = killpg(pgid, Signal::SIGTERM);
    let deadline = Instant::now() + KILL_GRACE;
    while Instant::now() < deadline {
        if killpg(pgid, None).is_err() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    let _ = killpg(pgid, Signal::SIGKILL);
}

fn drain_capped(
    stream: impl AsyncRead + Unpin + Send + 'static,
    cap: usize,
    cause: Arc<OnceLock<KillCause>>,
    pid: i32,
) -> JoinHandle<(Vec<u8>, bool)> {
    tokio::spawn(async move {
        let mut reader = stream;
        let mut buf: Vec<u8> = Vec::new();
        let mut truncated = false;
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            match reader.read(&mut chunk).await {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if truncated {
                        // Keep draining so the pipe never backpressures the
                        // child between the cap firing and the kill landing.
                        continue;
                    }
                    let room = cap.saturating_sub(buf.len());
                    if n > room {
                        buf.extend_from_slice(&chunk[..room]);
                        truncated = true;
                        if cause.set(KillCause::Output).is_ok() {
                            tokio::spawn(terminate_group(pid));
                        }
                    } else {
                        buf.extend_from_slice(&chunk[..n]);
                    }
                }
            }
        }
        (buf, truncated)
    })
}

/// Wall-clock and CPU watchdog doubling as the procfs usage sampler.
fn spawn_watchdog(
    pid: i32,
    wall_limit_ms: Option<u64>,
    cpu_limit_ms: Option<u64>,
    cause: Arc<OnceLock<KillCause>>,
    usage: Arc<Mutex<ProcSample>>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let started = Instant::now();
        loop {
            sleep(POLL_INTERVAL).await;
            if let Some(sample) = sample_proc(pid) {
                let mut current = usage.lock().expect("usage mutex");
                current.cpu_ms = current.cpu_ms.max(sample.cpu_ms);
                current.peak_bytes = current.peak_bytes.max(sample.peak_bytes);
            }
            if let Some(limit) = wall_limit_ms {
                if started.elapsed().as_millis() as u64 >= limit {
                    let _ = cause.set(KillCause::Wall);
                    terminate_group(pid).await;
                    return;
                }
            }
            if let Some(limit) = cpu_limit_ms {
                let cpu = usage.lock().expect("usage mutex").cpu_ms;
                if cpu >= limit {
                    let _ = cause.set(KillCause::Cpu);
                    terminate_group(pid).await;
                    return;
                }
            }
        }
    })
}

fn sample_proc(pid: i32) -> Option<ProcSample> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // Fields after the parenthesized comm: utime and stime are the 12th and
    // 13th of the remainder.
    let rest = stat.rsplit_once(')')?.1;
    let mut fields = rest.split_whitespace();
    let utime: u64 = fields.nth(11)?.parse().ok()?;
    let stime: u64 = fields.next()?.parse().ok()?;
    let hz = unsafe { libc::sysconf(libc::_SC_CLK_TCK) }.max(1) as u64;
    let cpu_ms = (utime + stime) * 1_000 / hz;

    let peak_bytes = std::fs::read_to_string(format!("/proc/{pid}/status"))
        .ok()
        .and_then(|status| {
            status.lines().find_map(|line| {
                line.strip_prefix("VmHWM:")
                    .and_then(|v| v.trim().strip_suffix("kB"))
                    .and_then(|v| v.trim().parse::<u64>().ok())
            })
        })
        .map_or(0, |kb| kb * 1024);

    Some(ProcSample { cpu_ms, peak_bytes })
}

#[allow(clippy::too_many_arguments)]
fn derive_status(
    cause: Option<KillCause>,
    exit_code: Option<i32>,
    raw_signal: Option<i32>,
    cpu_time_ms: u64,
    memory_bytes: u64,
    oom_killed: bool,
    limits: &EffectiveLimits,
) -> (StageStatus, Option<String>) {
    match cause {
        Some(KillCause::Output) => (
            StageStatus::OutputLimit,
            Some("output size limit exceeded".into()),
        ),
        Some(KillCause::Wall) => (
            StageStatus::TimeLimit,
            Some("wall time limit exceeded".into()),
        ),
        Some(KillCause::Cpu) => (
            StageStatus::TimeLimit,
            Some("CPU time limit exceeded".into()),
        ),
        None => {
            let cpu_tripped = raw_signal == Some(libc::SIGXCPU)
                || limits.cpu_time_ms.is_some_and(|limit| cpu_time_ms >= limit);
            let memory_tripped = oom_killed
                || (raw_signal.is_some()
                    && limits
                        .memory_bytes
                        .is_some_and(|limit| memory_bytes >= limit));
            if cpu_tripped {
                (
                    StageStatus::TimeLimit,
                    Some("CPU time limit exceeded".into()),
                )
            } else if memory_tripped {
                (StageStatus::MemoryLimit, Some("memory limit exceeded".into()))
            } else if let Some(raw) = raw_signal {
                (
                    StageStatus::KilledBySignal,
                    Some(format!("terminated by {}", signal_name(raw))),
                )
            } else if exit_code != Some(0) {
                (StageStatus::RuntimeError, None)
            } else {
                (StageStatus::Ok, None)
            }
        }
    }
}

fn signal_name(raw: i32) -> String {
    Signal::try_from(raw)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|_| format!("SIG{raw}"))
}

/// Applied between fork and exec, in a locked order: session leadership,
/// cgroup attach, rlimits, network detach, credential drop.
#[derive(Debug, Clone)]
struct PreExec {
    cgroup_procs: Option<PathBuf>,
    cpu_secs: Option<u64>,
    memory_bytes: Option<u64>,
    file_size: Option<u64>,
    open_files: Option<u64>,
    processes: Option<u64>,
    unshare_net: bool,
    ids: Option<(u32, u32)>,
}

impl PreExec {
    fn apply(&self) -> std::io::Result<()> {
        unsafe {
            // New session: the child leads its own process group, so the
            // runner can signal the whole tree at once.
            if libc::setsid() < 0 {
                return Err(std::io::Error::last_os_error());
            }
        }

        if let Some(path) = &self.cgroup_procs {
            std::fs::write(path, std::process::id().to_string())?;
        }

        set_rlimit(libc::RLIMIT_CORE, 0, 0)?;
        if let Some(secs) = self.cpu_secs {
            // Soft limit raises SIGXCPU; the hard limit one second later is
            // the unconditional backstop.
            set_rlimit(libc::RLIMIT_CPU, secs, secs + 1)?;
        }
        if let Some(bytes) = self.memory_bytes {
            set_rlimit(libc::RLIMIT_AS, bytes, bytes)?;
        }
        if let Some(bytes) = self.file_size {
            set_rlimit(libc::RLIMIT_FSIZE, bytes, bytes)?;
        }
        if let Some(count) = self.open_files {
            set_rlimit(libc::RLIMIT_NOFILE, count, count)?;
        }
        if let Some(count) = self.processes {
            set_rlimit(libc::RLIMIT_NPROC, count, count)?;
        }

        if self.unshare_net {
            // Best effort: hosts without CAP_SYS_ADMIN (nested containers)
            // still run, with network isolation degraded.
            unsafe {
                let _ = libc::unshare(libc::CLONE_NEWNET);
            }
        }

        if let Some((uid, gid)) = self.ids {
            unsafe {
                if libc::setgroups(0, std::ptr::null()) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setresgid(gid, gid, gid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                if libc::setresuid(uid, uid, uid) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
            }
        }
        Ok(())
    }
}

fn set_rlimit(resource: libc::__rlimit_resource_t, soft: u64, hard: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: soft as libc::rlim_t,
        rlim_max: hard as libc::rlim_t,
    };
    if unsafe { libc::setrlimit(resource, &limit) } == 0 {
        return Ok(());
    }
    // Unprivileged processes cannot raise a hard limit; retry under the
    // inherited ceiling.
    let mut current = libc::rlimit {
        rlim_cur: 0,
        rlim_max: 0,
    };
    if unsafe { libc::getrlimit(resource, &mut current) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    let clamped = libc::rlimit {
        rlim_cur: limit.rlim_cur.min(current.rlim_max),
        rlim_max: limit.rlim_max.min(current.rlim_max),
    };
    if unsafe { libc::setrlimit(resource, &clamped) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
