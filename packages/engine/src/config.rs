use config::{Config, ConfigError, Environment};
use serde::Deserialize;

use crate::runtime::StageLimits;

/// Host configuration for the judge engine.
///
/// Every field binds to the environment variable of the same (uppercased)
/// name, e.g. `COMPILE_TIMEOUT`, `MAX_CONCURRENT_JOBS`, `DISABLE_NETWORKING`.
/// A limit value ≤ 0 means "unbounded at the configured layer"; positive
/// values are the maxima that per-request overrides are clamped against.
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    /// Address the server binds. Default: "127.0.0.1:3000".
    pub bind_addr: String,
    /// Compile stage wall-clock cap in milliseconds. Default: 10000.
    pub compile_timeout: i64,
    /// Run stage wall-clock cap in milliseconds. Default: 3000.
    pub run_timeout: i64,
    /// Compile stage CPU-time cap in milliseconds. Default: 10000.
    pub compile_cpu_time: i64,
    /// Run stage CPU-time cap in milliseconds. Default: 3000.
    pub run_cpu_time: i64,
    /// Compile stage memory cap in bytes. Default: -1 (unbounded).
    pub compile_memory_limit: i64,
    /// Run stage memory cap in bytes. Default: -1 (unbounded).
    pub run_memory_limit: i64,
    /// Size of the sandbox identity pool; the host-wide session ceiling.
    /// Default: 64.
    pub max_concurrent_jobs: usize,
    /// RLIMIT_NPROC applied to every stage. Default: 256.
    pub max_process_count: i64,
    /// RLIMIT_NOFILE applied to every stage. Default: 2048.
    pub max_open_files: i64,
    /// RLIMIT_FSIZE in bytes applied to every stage. Default: 10000000.
    pub max_file_size: i64,
    /// Per-stream stdout/stderr retention cap in bytes. Default: 1048576.
    pub output_max_size: usize,
    /// Detach children from the network namespace. Default: true.
    pub disable_networking: bool,
    /// Log filter for the server binary. Default: "info".
    pub log_level: String,
    /// Directory under which per-session scratch roots are created.
    /// Default: "/tmp/gavel-boxes".
    pub sandbox_root: String,
    /// Directory scanned for installed runtime metadata. Default:
    /// "./runtimes".
    pub runtimes_dir: String,
    /// First uid of the sandbox identity range. Default: 1001.
    pub runner_uid_start: u32,
    /// First gid of the sandbox identity range. Default: 1001.
    pub runner_gid_start: u32,
    /// Grace period for a session to send `init`, in milliseconds.
    /// Default: 5000.
    pub init_timeout: u64,
}

impl EngineConfig {
    pub fn load() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .set_default("bind_addr", "127.0.0.1:3000")?
            .set_default("compile_timeout", 10_000_i64)?
            .set_default("run_timeout", 3_000_i64)?
            .set_default("compile_cpu_time", 10_000_i64)?
            .set_default("run_cpu_time", 3_000_i64)?
            .set_default("compile_memory_limit", -1_i64)?
            .set_default("run_memory_limit", -1_i64)?
            .set_default("max_concurrent_jobs", 64_i64)?
            .set_default("max_process_count", 256_i64)?
            .set_default("max_open_files", 2048_i64)?
            .set_default("max_file_size", 10_000_000_i64)?
            .set_default("output_max_size", 1_048_576_i64)?
            .set_default("disable_networking", true)?
            .set_default("log_level", "info")?
            .set_default("sandbox_root", "/tmp/gavel-boxes")?
            .set_default("runtimes_dir", "./runtimes")?
            .set_default("runner_uid_start", 1001_i64)?
            .set_default("runner_gid_start", 1001_i64)?
            .set_default("init_timeout", 5_000_i64)?
            // Override from environment (e.g., RUN_TIMEOUT=2000)
            .add_source(Environment::default())
            .build()?;
        s.try_deserialize()
    }

    /// Configured maxima for the compile stage.
    pub fn compile_limits(&self) -> StageLimits {
        StageLimits {
            timeout_ms: self.compile_timeout,
            cpu_time_ms: self.compile_cpu_time,
            memory_bytes: self.compile_memory_limit,
        }
    }

    /// Configured maxima for the run stage.
    pub fn run_limits(&self) -> StageLimits {
        StageLimits {
            timeout_ms: self.run_timeout,
            cpu_time_ms: self.run_cpu_time,
            memory_bytes: self.run_memory_limit,
        }
    }
}
