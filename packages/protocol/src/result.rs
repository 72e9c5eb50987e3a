use serde::{Deserialize, Serialize};

/// High-level outcome tag for one stage execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StageStatus {
    #[serde(rename = "OK")]
    Ok,
    TimeLimit,
    MemoryLimit,
    OutputLimit,
    RuntimeError,
    KilledBySignal,
}

/// Outcome of a single child execution (compile stage or one test run).
///
/// `signal` is non-null iff the child was terminated by a signal, including a
/// limit-enforcement kill; in that case `exit_code` is null.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageResult {
    /// Captured stdout, truncated at the configured output cap.
    pub stdout: String,
    /// Captured stderr, truncated at the configured output cap.
    pub stderr: String,
    pub exit_code: Option<i32>,
    /// Signal name (e.g. "SIGKILL") when the child died on a signal.
    pub signal: Option<String>,
    pub wall_time_ms: u64,
    pub cpu_time_ms: u64,
    pub memory_bytes: u64,
    pub status: StageStatus,
    /// Human-readable detail, e.g. which limit fired.
    pub message: Option<String>,
}

impl StageResult {
    /// Synthetic zeroed success, used for the compile stage of runtimes
    /// that have nothing to compile.
    pub fn synthetic_ok() -> Self {
        Self {
            stdout: String::new(),
            stderr: String::new(),
            exit_code: Some(0),
            signal: None,
            wall_time_ms: 0,
            cpu_time_ms: 0,
            memory_bytes: 0,
            status: StageStatus::Ok,
            message: None,
        }
    }

    /// A stage succeeded iff it exited 0 and was not signaled.
    pub fn success(&self) -> bool {
        self.exit_code == Some(0) && self.signal.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_to_contract_tags() {
        let tag = |s: StageStatus| serde_json::to_value(s).unwrap();
        assert_eq!(tag(StageStatus::Ok), "OK");
        assert_eq!(tag(StageStatus::TimeLimit), "TimeLimit");
        assert_eq!(tag(StageStatus::OutputLimit), "OutputLimit");
        assert_eq!(tag(StageStatus::KilledBySignal), "KilledBySignal");
    }

    #[test]
    fn synthetic_ok_is_a_success_with_zero_counters() {
        let r = StageResult::synthetic_ok();
        assert!(r.success());
        assert_eq!(r.wall_time_ms, 0);
        assert_eq!(r.cpu_time_ms, 0);
        assert_eq!(r.memory_bytes, 0);
    }
}
