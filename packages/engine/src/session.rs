//! The `/judge` session: a message-driven state machine sequencing
//! `init` → `compiled` → N×(`run_test`|`run_batch`) → `close` → `done`,
//! with cleanup guaranteed on every termination path.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use protocol::close;
use protocol::message::{
    BatchResult, CompiledMessage, Inbound, InitRequest, Outbound, RunBatchRequest,
    RunTestRequest, TestResult,
};
use protocol::{FileEncoding, StageResult};
use serde_json::Value;
use tokio::time::{timeout_at, Instant};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::{EngineError, TransportError};
use crate::job::Job;
use crate::runtime::{LimitSet, RuntimeRegistry, FILE_LANGUAGE};
use crate::sandbox::SandboxPool;

/// Duplex text-frame channel carrying one JSON object per frame. The
/// session owns the protocol; transports only move frames and close codes.
#[async_trait]
pub trait SessionTransport: Send {
    /// Next inbound frame; `None` on orderly or abrupt disconnect.
    async fn recv(&mut self) -> Option<Result<String, TransportError>>;
    async fn send(&mut self, frame: String) -> Result<(), TransportError>;
    async fn close(&mut self, code: u16) -> Result<(), TransportError>;
}

/// Classified inbound frame; parsing never tears the session down by itself.
enum Frame {
    Init(Box<InitRequest>),
    RunTest(Box<RunTestRequest>),
    RunBatch(Box<RunBatchRequest>),
    Close,
    Unknown(String),
    Malformed(String),
}

fn classify(raw: &str) -> Frame {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(err) => return Frame::Malformed(err.to_string()),
    };
    let Some(kind) = value.get("type").and_then(Value::as_str).map(str::to_owned) else {
        return Frame::Malformed("missing \"type\" discriminant".into());
    };
    if !matches!(kind.as_str(), "init" | "run_test" | "run_batch" | "close") {
        return Frame::Unknown(kind);
    }
    match serde_json::from_value(value) {
        Ok(Inbound::Init(req)) => Frame::Init(Box::new(req)),
        Ok(Inbound::RunTest(req)) => Frame::RunTest(Box::new(req)),
        Ok(Inbound::RunBatch(req)) => Frame::RunBatch(Box::new(req)),
        Ok(Inbound::Close) => Frame::Close,
        Err(err) => Frame::Malformed(err.to_string()),
    }
}

pub struct Session<T> {
    id: Uuid,
    transport: T,
    registry: Arc<RuntimeRegistry>,
    pool: Arc<SandboxPool>,
    config: Arc<EngineConfig>,
    job: Option<Job>,
    fallback_test_id: u64,
    test_count: u64,
    total_time_ms: u64,
}

impl<T: SessionTransport> Session<T> {
    pub fn new(
        transport: T,
        registry: Arc<RuntimeRegistry>,
        pool: Arc<SandboxPool>,
        config: Arc<EngineConfig>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            transport,
            registry,
            pool,
            config,
            job: None,
            fallback_test_id: 0,
            test_count: 0,
            total_time_ms: 0,
        }
    }

    /// Drive the session to completion. Whatever path terminates it
    /// (`close`, a protocol violation, compile failure, transport loss),
    /// the job is cleaned up before this returns.
    #[instrument(skip_all, fields(session_id = %self.id))]
    pub async fn run(mut self) {
        self.drive().await;
        if let Some(job) = self.job.as_mut() {
            job.cleanup().await;
        }
        info!(tests = self.test_count, "session finished");
    }

    async fn drive(&mut self) {
        let Some(init) = self.await_init().await else {
            return;
        };
        if self.initialize(*init).await {
            self.serve().await;
        }
    }

    /// Opening state: only `init` is legal, and only within the grace
    /// period.
    async fn await_init(&mut self) -> Option<Box<InitRequest>> {
        let deadline = Instant::now() + Duration::from_millis(self.config.init_timeout);
        loop {
            let frame = match timeout_at(deadline, self.transport.recv()).await {
                Err(_) => {
                    info!("no init within grace period");
                    let _ = self.transport.close(close::INIT_TIMEOUT).await;
                    return None;
                }
                Ok(None) | Ok(Some(Err(_))) => return None,
                Ok(Some(Ok(frame))) => frame,
            };
            match classify(&frame) {
                Frame::Init(req) => return Some(req),
                Frame::RunTest(_) | Frame::RunBatch(_) | Frame::Close => {
                    let _ = self.transport.close(close::NOT_INITIALIZED).await;
                    return None;
                }
                Frame::Unknown(kind) => {
                    if self.send_unknown(kind).await.is_err() {
                        return None;
                    }
                }
                Frame::Malformed(detail) => {
                    self.fail(format!("invalid message: {detail}")).await;
                    return None;
                }
            }
        }
    }

    /// Validate the request, provision the job, compile, report. Returns
    /// whether the session may serve tests.
    async fn initialize(&mut self, init: InitRequest) -> bool {
        let job = match self.build_job(&init) {
            Ok(job) => job,
            Err(err) => {
                self.fail(err.to_string()).await;
                return false;
            }
        };
        info!(
            language = %job.runtime().language,
            version = %job.runtime().version,
            "session initialized"
        );
        self.job = Some(job);

        if let Err(err) = self.job.as_mut().expect("job just set").prime().await {
            self.fail(err.to_string()).await;
            return false;
        }

        let (language, version, compiled) = {
            let runtime = self.job.as_ref().expect("job primed").runtime();
            (
                runtime.language.clone(),
                runtime.version.to_string(),
                runtime.compiled,
            )
        };
        if self
            .send(Outbound::Ready {
                language,
                version,
                compiled,
            })
            .await
            .is_err()
        {
            return false;
        }

        let result = match self.job.as_mut().expect("job primed").compile().await {
            Ok(result) => result,
            Err(err) => {
                self.fail(err.to_string()).await;
                return false;
            }
        };
        let success = result.success();
        let message = Outbound::Compiled(CompiledMessage {
            success,
            time: result.wall_time_ms,
            stdout: result.stdout,
            stderr: result.stderr,
            error: (!success)
                .then(|| result.message.unwrap_or_else(|| "compile stage failed".into())),
        });
        if self.send(message).await.is_err() {
            return false;
        }
        if !success {
            // Terminal: post-4006 reuse of the channel is undefined.
            let _ = self.transport.close(close::COMPILE_FAILED).await;
            return false;
        }
        true
    }

    fn build_job(&self, init: &InitRequest) -> Result<Job, EngineError> {
        let language = init.language.trim();
        if language.is_empty() {
            return Err(EngineError::Validation(
                "language must be a non-empty string".into(),
            ));
        }
        let selector = init.version.trim();
        if selector.is_empty() {
            return Err(EngineError::Validation(
                "version must be a non-empty string".into(),
            ));
        }
        if init.files.is_empty() {
            return Err(EngineError::Validation("files must not be empty".into()));
        }
        let runtime = self.registry.resolve(language, selector)?;
        let utf8_present = init
            .files
            .iter()
            .any(|f| f.encoding == FileEncoding::Utf8);
        if !runtime.language.eq_ignore_ascii_case(FILE_LANGUAGE) && !utf8_present {
            return Err(EngineError::Validation(
                "at least one file must be utf8-encoded".into(),
            ));
        }
        let compile_limits = LimitSet {
            timeout_ms: init.compile_timeout,
            cpu_time_ms: init.compile_cpu_time,
            memory_bytes: init.compile_memory_limit,
        };
        compile_limits.validate(&runtime.compile_limits, "compile")?;
        let run_limits = LimitSet {
            timeout_ms: init.run_timeout,
            cpu_time_ms: init.run_cpu_time,
            memory_bytes: init.run_memory_limit,
        };
        run_limits.validate(&runtime.run_limits, "run")?;
        Ok(Job::new(
            Arc::clone(&self.pool),
            Arc::clone(&self.config),
            runtime,
            init.files.clone(),
            compile_limits,
            run_limits,
        ))
    }

    /// CompiledOk state: serve tests until `close`, violation, or
    /// disconnect. Inbound messages are strictly serialized.
    async fn serve(&mut self) {
        loop {
            let frame = match self.transport.recv().await {
                None | Some(Err(_)) => return,
                Some(Ok(frame)) => frame,
            };
            match classify(&frame) {
                Frame::Init(_) => {
                    warn!("second init on an initialized session");
                    let _ = self.transport.close(close::ALREADY_INITIALIZED).await;
                    return;
                }
                Frame::RunTest(req) => {
                    if self.handle_run_test(*req).await.is_err() {
                        return;
                    }
                }
                Frame::RunBatch(req) => {
                    if self.handle_run_batch(*req).await.is_err() {
                        return;
                    }
                }
                Frame::Close => {
                    let done = Outbound::Done {
                        total_tests: self.test_count,
                        total_time: self.total_time_ms,
                    };
                    let _ = self.send(done).await;
                    let _ = self.transport.close(close::COMPLETE).await;
                    return;
                }
                Frame::Unknown(kind) => {
                    if self.send_unknown(kind).await.is_err() {
                        return;
                    }
                }
                Frame::Malformed(detail) => {
                    let message = Outbound::Error {
                        test_id: None,
                        message: format!("invalid message: {detail}"),
                    };
                    if self.send(message).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn handle_run_test(&mut self, req: RunTestRequest) -> Result<(), ()> {
        let test_id = req
            .test_id
            .clone()
            .unwrap_or_else(|| Value::from(self.next_fallback_id()));
        let overrides = LimitSet {
            timeout_ms: req.timeout,
            cpu_time_ms: req.cpu_time,
            memory_bytes: req.memory_limit,
        };
        if let Some(problem) = negative_override(&overrides) {
            let message = Outbound::Error {
                test_id: Some(test_id),
                message: problem.into(),
            };
            return self.send(message).await.map_err(drop);
        }
        let job = self.job.as_mut().expect("serving session has a job");
        match job.run_test(req.stdin.into_bytes(), &overrides).await {
            Ok(result) => {
                self.test_count += 1;
                self.total_time_ms += result.wall_time_ms;
                self.send(Outbound::Result(test_result(test_id, result)))
                    .await
                    .map_err(drop)
            }
            // Engine fault, not a user-code outcome: report and stay open.
            Err(err) => {
                let message = Outbound::Error {
                    test_id: Some(test_id),
                    message: err.to_string(),
                };
                self.send(message).await.map_err(drop)
            }
        }
    }

    async fn handle_run_batch(&mut self, req: RunBatchRequest) -> Result<(), ()> {
        let overrides = LimitSet {
            timeout_ms: req.timeout,
            cpu_time_ms: req.cpu_time,
            memory_bytes: req.memory_limit,
        };
        if req.test_cases.is_empty() {
            let message = Outbound::Error {
                test_id: None,
                message: "test_cases must not be empty".into(),
            };
            return self.send(message).await.map_err(drop);
        }
        if let Some(problem) = negative_override(&overrides) {
            let message = Outbound::Error {
                test_id: None,
                message: problem.into(),
            };
            return self.send(message).await.map_err(drop);
        }
        let mut ids = Vec::with_capacity(req.test_cases.len());
        let mut stdins = Vec::with_capacity(req.test_cases.len());
        for case in &req.test_cases {
            ids.push(
                case.test_id
                    .clone()
                    .unwrap_or_else(|| Value::from(self.next_fallback_id())),
            );
            stdins.push(case.stdin.clone().into_bytes());
        }
        let job = self.job.as_mut().expect("serving session has a job");
        match job.run_batch(stdins, &overrides).await {
            Ok(outcome) => {
                self.test_count += outcome.results.len() as u64;
                self.total_time_ms += outcome.total_time;
                let results: Vec<TestResult> = ids
                    .into_iter()
                    .zip(outcome.results)
                    .map(|(id, result)| test_result(id, result))
                    .collect();
                let message = Outbound::BatchResult(BatchResult {
                    total_tests: results.len() as u64,
                    results,
                    total_time: outcome.total_time,
                    total_cpu_time: outcome.total_cpu_time,
                    memory: outcome.memory,
                    success: outcome.success,
                    stderr: outcome.stderr,
                });
                self.send(message).await.map_err(drop)
            }
            Err(err) => {
                let message = Outbound::Error {
                    test_id: None,
                    message: err.to_string(),
                };
                self.send(message).await.map_err(drop)
            }
        }
    }

    fn next_fallback_id(&mut self) -> u64 {
        self.fallback_test_id += 1;
        self.fallback_test_id
    }

    async fn send(&mut self, message: Outbound) -> Result<(), TransportError> {
        let frame =
            serde_json::to_string(&message).map_err(|err| TransportError(err.to_string()))?;
        self.transport.send(frame).await
    }

    async fn send_unknown(&mut self, kind: String) -> Result<(), TransportError> {
        self.send(Outbound::Error {
            test_id: None,
            message: format!("Unknown message type: {kind}"),
        })
        .await
    }

    /// Notify, then close 4002. Used for every fatal init-stage fault.
    async fn fail(&mut self, message: String) {
        warn!(error = %message, "session failed");
        let _ = self
            .send(Outbound::Error {
                test_id: None,
                message,
            })
            .await;
        let _ = self.transport.close(close::NOTIFIED_ERROR).await;
    }
}

fn negative_override(set: &LimitSet) -> Option<&'static str> {
    if set.timeout_ms.is_some_and(|v| v < 0) {
        return Some("timeout must not be negative");
    }
    if set.cpu_time_ms.is_some_and(|v| v < 0) {
        return Some("cpu_time must not be negative");
    }
    if set.memory_bytes.is_some_and(|v| v < 0) {
        return Some("memory_limit must not be negative");
    }
    None
}

fn test_result(test_id: Value, result: StageResult) -> TestResult {
    TestResult {
        test_id,
        stdout: result.stdout,
        stderr: result.stderr,
        code: result.exit_code,
        signal: result.signal,
        message: result.message,
        status: result.status,
        time: result.wall_time_ms,
        cpu_time: result.cpu_time_ms,
        memory: result.memory_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_distinguishes_unknown_from_malformed() {
        assert!(matches!(classify(r#"{"type":"close"}"#), Frame::Close));
        assert!(matches!(
            classify(r#"{"type":"destroy"}"#),
            Frame::Unknown(kind) if kind == "destroy"
        ));
        assert!(matches!(classify("not json"), Frame::Malformed(_)));
        assert!(matches!(classify(r#"{"no":"type"}"#), Frame::Malformed(_)));
        // Right discriminant, wrong payload shape.
        assert!(matches!(
            classify(r#"{"type":"init","language":5}"#),
            Frame::Malformed(_)
        ));
    }

    #[test]
    fn negative_overrides_are_named() {
        let set = LimitSet {
            timeout_ms: Some(-1),
            ..Default::default()
        };
        assert_eq!(negative_override(&set), Some("timeout must not be negative"));
        assert_eq!(negative_override(&LimitSet::default()), None);
    }
}
