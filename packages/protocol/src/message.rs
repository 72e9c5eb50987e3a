//! Wire messages for the `/judge` stream.
//!
//! One JSON object per text frame, discriminated by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::result::StageStatus;
use crate::source::SourceFile;

/// Client → engine messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Inbound {
    Init(InitRequest),
    RunTest(RunTestRequest),
    RunBatch(RunBatchRequest),
    Close,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InitRequest {
    pub language: String,
    pub version: String,
    #[serde(default)]
    pub files: Vec<SourceFile>,
    #[serde(default)]
    pub compile_timeout: Option<i64>,
    #[serde(default)]
    pub run_timeout: Option<i64>,
    #[serde(default)]
    pub compile_cpu_time: Option<i64>,
    #[serde(default)]
    pub run_cpu_time: Option<i64>,
    #[serde(default)]
    pub compile_memory_limit: Option<i64>,
    #[serde(default)]
    pub run_memory_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunTestRequest {
    #[serde(default)]
    pub stdin: String,
    /// Echoed verbatim in the matching `result`; the engine assigns a
    /// monotonic counter when absent.
    #[serde(default)]
    pub test_id: Option<Value>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub cpu_time: Option<i64>,
    #[serde(default)]
    pub memory_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RunBatchRequest {
    pub test_cases: Vec<BatchCase>,
    #[serde(default)]
    pub timeout: Option<i64>,
    #[serde(default)]
    pub cpu_time: Option<i64>,
    #[serde(default)]
    pub memory_limit: Option<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BatchCase {
    #[serde(default)]
    pub stdin: String,
    #[serde(default)]
    pub test_id: Option<Value>,
}

/// Engine → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Outbound {
    Ready {
        language: String,
        version: String,
        compiled: bool,
    },
    Compiled(CompiledMessage),
    Result(TestResult),
    BatchResult(BatchResult),
    Done {
        total_tests: u64,
        total_time: u64,
    },
    Error {
        #[serde(skip_serializing_if = "Option::is_none")]
        test_id: Option<Value>,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct CompiledMessage {
    pub success: bool,
    /// Compile wall time in milliseconds.
    pub time: u64,
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

/// Per-test record mirrored from the engine's `StageResult`.
#[derive(Debug, Clone, Serialize)]
pub struct TestResult {
    pub test_id: Value,
    pub stdout: String,
    pub stderr: String,
    pub code: Option<i32>,
    pub signal: Option<String>,
    pub message: Option<String>,
    pub status: StageStatus,
    /// Wall time in milliseconds.
    pub time: u64,
    pub cpu_time: u64,
    /// Peak memory in bytes.
    pub memory: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BatchResult {
    pub results: Vec<TestResult>,
    pub total_tests: u64,
    pub total_time: u64,
    pub total_cpu_time: u64,
    /// Maximum per-test peak memory in bytes.
    pub memory: u64,
    /// Conjunction of per-test exit 0 and no signal.
    pub success: bool,
    /// First non-empty per-test stderr, or empty.
    pub stderr: String,
}
