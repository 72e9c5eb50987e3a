//! One compile+run lifecycle: materialize sources, compile once, run many
//! tests against the post-compile snapshot, clean up exactly once.

use std::sync::Arc;

use nix::unistd::{chown, Gid, Uid};
use protocol::{SourceFile, StageResult};
use tracing::{debug, info, instrument};
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;
use crate::runtime::{LimitSet, RuntimeDescriptor};
use crate::sandbox::{self, SandboxPool};
use crate::stage::{run_stage, StageSpec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    New,
    Primed,
    Compiled,
    Failed,
    Closed,
}

/// Aggregated outcome of a sequential batch of test runs.
#[derive(Debug)]
pub struct BatchOutcome {
    pub results: Vec<StageResult>,
    pub total_time: u64,
    pub total_cpu_time: u64,
    /// Maximum per-test peak memory.
    pub memory: u64,
    pub success: bool,
    /// First non-empty per-test stderr.
    pub stderr: String,
}

pub struct Job {
    pub uuid: Uuid,
    runtime: RuntimeDescriptor,
    files: Vec<SourceFile>,
    compile_limits: LimitSet,
    run_limits: LimitSet,
    config: Arc<EngineConfig>,
    pool: Arc<SandboxPool>,
    state: JobState,
    sandbox: Option<sandbox::SandboxHandle>,
    primary_file: Option<String>,
}

impl Job {
    pub fn new(
        pool: Arc<SandboxPool>,
        config: Arc<EngineConfig>,
        runtime: RuntimeDescriptor,
        files: Vec<SourceFile>,
        compile_limits: LimitSet,
        run_limits: LimitSet,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            runtime,
            files,
            compile_limits,
            run_limits,
            config,
            pool,
            state: JobState::New,
            sandbox: None,
            primary_file: None,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    pub fn runtime(&self) -> &RuntimeDescriptor {
        &self.runtime
    }

    /// Acquire a sandbox and materialize every source file into it.
    #[instrument(skip_all, fields(job_id = %self.uuid))]
    pub async fn prime(&mut self) -> Result<(), EngineError> {
        if self.state != JobState::New {
            return Err(EngineError::State(format!(
                "prime is only legal once, from New (state: {:?})",
                self.state
            )));
        }
        let handle = self.pool.acquire().await?;
        debug!(sandbox = %handle.id, "priming job");
        self.sandbox = Some(handle);
        match self.materialize().await {
            Ok(primary) => {
                self.primary_file = Some(primary);
                self.state = JobState::Primed;
                Ok(())
            }
            Err(err) => {
                if let Some(mut handle) = self.sandbox.take() {
                    self.pool.release(&mut handle).await;
                }
                self.state = JobState::Failed;
                Err(err)
            }
        }
    }

    async fn materialize(&self) -> Result<String, EngineError> {
        let handle = self.sandbox.as_ref().expect("sandbox acquired before materialize");
        let mut primary = None;
        for (index, file) in self.files.iter().enumerate() {
            let name = match &file.name {
                Some(name) => sanitize_file_name(name)?,
                None => format!("file{index}.{}", self.runtime.extension_hint()),
            };
            let bytes = file
                .decoded_content()
                .map_err(|err| EngineError::Validation(err.to_string()))?;
            let path = handle.root.join(&name);
            if let Some(parent) = path.parent() {
                if parent != handle.root {
                    tokio::fs::create_dir_all(parent)
                        .await
                        .map_err(|err| materialize_error(&name, err))?;
                }
            }
            tokio::fs::write(&path, &bytes)
                .await
                .map_err(|err| materialize_error(&name, err))?;
            if handle.privileged {
                chown(
                    &path,
                    Some(Uid::from_raw(handle.uid)),
                    Some(Gid::from_raw(handle.gid)),
                )
                .map_err(|err| materialize_error(&name, err.into()))?;
            }
            primary.get_or_insert(name);
        }
        primary.ok_or_else(|| EngineError::Validation("files must not be empty".into()))
    }

    /// Run the compile stage once. Uncompiled runtimes get a synthetic
    /// zeroed success without invoking anything.
    #[instrument(skip_all, fields(job_id = %self.uuid))]
    pub async fn compile(&mut self) -> Result<StageResult, EngineError> {
        if self.state != JobState::Primed {
            return Err(EngineError::State(format!(
                "compile requires a primed job (state: {:?})",
                self.state
            )));
        }
        if !self.runtime.compiled {
            self.state = JobState::Compiled;
            return Ok(StageResult::synthetic_ok());
        }
        let template = self
            .runtime
            .compile_cmd
            .clone()
            .ok_or_else(|| EngineError::Stage("compiled runtime without compile command".into()))?;
        let spec = self.stage_spec(
            &template,
            Vec::new(),
            self.compile_limits.resolve(&self.runtime.compile_limits),
        );
        let handle = self.sandbox.as_ref().expect("primed job has a sandbox");
        match run_stage(handle, spec).await {
            Ok(result) => {
                if result.success() {
                    self.state = JobState::Compiled;
                    info!(time_ms = result.wall_time_ms, "compile succeeded");
                } else {
                    self.state = JobState::Failed;
                    info!(
                        exit = ?result.exit_code,
                        signal = ?result.signal,
                        "compile failed"
                    );
                }
                Ok(result)
            }
            Err(err) => {
                self.state = JobState::Failed;
                Err(err)
            }
        }
    }

    /// Execute the run command against fresh stdin. Per-test overrides are
    /// clamped to the runtime's configured maxima; the writable scratch is
    /// wiped first so every test sees the post-compile snapshot.
    #[instrument(skip_all, fields(job_id = %self.uuid))]
    pub async fn run_test(
        &mut self,
        stdin: Vec<u8>,
        overrides: &LimitSet,
    ) -> Result<StageResult, EngineError> {
        if self.state != JobState::Compiled {
            return Err(EngineError::State(format!(
                "run_test requires a compiled job (state: {:?})",
                self.state
            )));
        }
        let handle = self.sandbox.as_ref().expect("compiled job has a sandbox");
        sandbox::reset_tmp(handle, handle.privileged)
            .await
            .map_err(|err| EngineError::Stage(format!("failed to reset scratch: {err}")))?;
        let limits = overrides
            .merged_over(&self.run_limits)
            .resolve(&self.runtime.run_limits);
        let spec = self.stage_spec(&self.runtime.run_cmd, stdin, limits);
        run_stage(handle, spec).await
    }

    /// Sequential `run_test` over every case, aggregated into one record.
    pub async fn run_batch(
        &mut self,
        stdins: Vec<Vec<u8>>,
        overrides: &LimitSet,
    ) -> Result<BatchOutcome, EngineError> {
        if stdins.is_empty() {
            return Err(EngineError::Validation("test_cases must not be empty".into()));
        }
        let mut outcome = BatchOutcome {
            results: Vec::with_capacity(stdins.len()),
            total_time: 0,
            total_cpu_time: 0,
            memory: 0,
            success: true,
            stderr: String::new(),
        };
        for stdin in stdins {
            let result = self.run_test(stdin, overrides).await?;
            outcome.total_time += result.wall_time_ms;
            outcome.total_cpu_time += result.cpu_time_ms;
            outcome.memory = outcome.memory.max(result.memory_bytes);
            outcome.success &= result.success();
            if outcome.stderr.is_empty() && !result.stderr.is_empty() {
                outcome.stderr = result.stderr.clone();
            }
            outcome.results.push(result);
        }
        Ok(outcome)
    }

    /// Release the sandbox and close the job. Safe to call from any state,
    /// any number of times.
    #[instrument(skip_all, fields(job_id = %self.uuid))]
    pub async fn cleanup(&mut self) {
        if let Some(mut handle) = self.sandbox.take() {
            self.pool.release(&mut handle).await;
            debug!("job cleaned up");
        }
        self.state = JobState::Closed;
    }

    fn stage_spec(
        &self,
        template: &[String],
        stdin: Vec<u8>,
        limits: crate::runtime::EffectiveLimits,
    ) -> StageSpec {
        let handle = self.sandbox.as_ref().expect("staged job has a sandbox");
        let primary = self.primary_file.as_deref().unwrap_or_default();
        StageSpec {
            argv: RuntimeDescriptor::render(template, primary),
            stdin,
            limits,
            output_cap: self.config.output_max_size,
            env: stage_env(handle),
            process_cap: positive(self.config.max_process_count),
            open_files_cap: positive(self.config.max_open_files),
            file_size_cap: positive(self.config.max_file_size),
            disable_networking: self.config.disable_networking,
        }
    }
}

fn positive(value: i64) -> Option<u64> {
    (value > 0).then_some(value as u64)
}

/// Environment handed to children: everything host-specific is stripped.
fn stage_env(handle: &sandbox::SandboxHandle) -> Vec<(String, String)> {
    vec![
        ("PATH".into(), "/usr/local/bin:/usr/bin:/bin".into()),
        ("HOME".into(), handle.root.to_string_lossy().into_owned()),
        ("TMPDIR".into(), handle.tmp.to_string_lossy().into_owned()),
        ("LANG".into(), "C.UTF-8".into()),
        ("LC_ALL".into(), "C.UTF-8".into()),
    ]
}

fn materialize_error(name: &str, err: std::io::Error) -> EngineError {
    EngineError::SandboxSetup(format!("failed to materialize {name}: {err}"))
}

/// Relative paths only; no traversal out of the sandbox root.
fn sanitize_file_name(name: &str) -> Result<String, EngineError> {
    if name.is_empty() {
        return Err(EngineError::Validation("file name must not be empty".into()));
    }
    if name.starts_with('/') {
        return Err(EngineError::Validation(format!(
            "file name must be relative: {name}"
        )));
    }
    for component in name.split('/') {
        if component.is_empty() || component == "." || component == ".." {
            return Err(EngineError::Validation(format!(
                "file name must not traverse directories: {name}"
            )));
        }
    }
    Ok(name.to_string())
}
