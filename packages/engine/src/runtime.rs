//! Installed-runtime descriptors and the registry that resolves
//! `(language, version)` requests against them.

use std::path::Path;

use semver::{Version, VersionReq};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Placeholder in compile/run command templates replaced by the primary
/// source file name.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Language sentinel for pre-built submissions; waives the utf8-file rule.
pub const FILE_LANGUAGE: &str = "file";

/// Configured per-stage maxima. A value ≤ 0 means unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageLimits {
    pub timeout_ms: i64,
    pub cpu_time_ms: i64,
    pub memory_bytes: i64,
}

impl StageLimits {
    fn cap(value: i64) -> Option<u64> {
        (value > 0).then_some(value as u64)
    }
}

/// Per-request limit overrides; unset fields inherit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LimitSet {
    pub timeout_ms: Option<i64>,
    pub cpu_time_ms: Option<i64>,
    pub memory_bytes: Option<i64>,
}

/// Limits as applied to one stage invocation; `None` means unbounded.
#[derive(Debug, Clone, Copy, Default)]
pub struct EffectiveLimits {
    pub timeout_ms: Option<u64>,
    pub cpu_time_ms: Option<u64>,
    pub memory_bytes: Option<u64>,
}

impl LimitSet {
    /// Reject negative values and values above the configured maximum
    /// (when that maximum is positive).
    pub fn validate(&self, max: &StageLimits, stage: &str) -> Result<(), EngineError> {
        let check = |name: &str, value: Option<i64>, max: i64| -> Result<(), EngineError> {
            let Some(v) = value else { return Ok(()) };
            if v < 0 {
                return Err(EngineError::Validation(format!(
                    "{stage} {name} must not be negative (got {v})"
                )));
            }
            if max > 0 && v > max {
                return Err(EngineError::Validation(format!(
                    "{stage} {name} {v} exceeds the configured maximum {max}"
                )));
            }
            Ok(())
        };
        check("timeout", self.timeout_ms, max.timeout_ms)?;
        check("cpu_time", self.cpu_time_ms, max.cpu_time_ms)?;
        check("memory_limit", self.memory_bytes, max.memory_bytes)?;
        Ok(())
    }

    /// Per-test overrides layered over the job-level set.
    pub fn merged_over(&self, base: &LimitSet) -> LimitSet {
        LimitSet {
            timeout_ms: self.timeout_ms.or(base.timeout_ms),
            cpu_time_ms: self.cpu_time_ms.or(base.cpu_time_ms),
            memory_bytes: self.memory_bytes.or(base.memory_bytes),
        }
    }

    /// Apply over the stage maxima: the effective limit is `min(request,
    /// max)` where both are bounded, the bounded one otherwise.
    pub fn resolve(&self, max: &StageLimits) -> EffectiveLimits {
        let pick = |requested: Option<i64>, cap: i64| -> Option<u64> {
            let cap = StageLimits::cap(cap);
            match requested {
                Some(v) if v >= 0 => {
                    let v = v as u64;
                    Some(cap.map_or(v, |c| v.min(c)))
                }
                _ => cap,
            }
        };
        EffectiveLimits {
            timeout_ms: pick(self.timeout_ms, max.timeout_ms),
            cpu_time_ms: pick(self.cpu_time_ms, max.cpu_time_ms),
            memory_bytes: pick(self.memory_bytes, max.memory_bytes),
        }
    }
}

/// Immutable description of one installed toolchain.
#[derive(Debug, Clone)]
pub struct RuntimeDescriptor {
    pub language: String,
    pub version: Version,
    pub aliases: Vec<String>,
    pub compiled: bool,
    /// Absent iff `compiled` is false.
    pub compile_cmd: Option<Vec<String>>,
    pub run_cmd: Vec<String>,
    pub compile_limits: StageLimits,
    pub run_limits: StageLimits,
}

impl RuntimeDescriptor {
    pub fn matches_language(&self, name: &str) -> bool {
        self.language.eq_ignore_ascii_case(name)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(name))
    }

    /// Extension hint for deterministic fallback file names.
    pub fn extension_hint(&self) -> &str {
        self.aliases.first().map_or(self.language.as_str(), |a| a)
    }

    /// Substitute the primary file name into a command template.
    pub fn render(cmd: &[String], primary_file: &str) -> Vec<String> {
        cmd.iter()
            .map(|arg| arg.replace(FILE_PLACEHOLDER, primary_file))
            .collect()
    }
}

/// On-disk metadata for one installed runtime (`<pkg>/runtime.json`).
#[derive(Debug, Deserialize)]
struct RuntimeMetadata {
    language: String,
    version: String,
    #[serde(default)]
    aliases: Vec<String>,
    #[serde(default)]
    compiled: bool,
    #[serde(default)]
    compile: Option<Vec<String>>,
    run: Vec<String>,
    #[serde(default)]
    compile_timeout: Option<i64>,
    #[serde(default)]
    run_timeout: Option<i64>,
    #[serde(default)]
    compile_cpu_time: Option<i64>,
    #[serde(default)]
    run_cpu_time: Option<i64>,
    #[serde(default)]
    compile_memory_limit: Option<i64>,
    #[serde(default)]
    run_memory_limit: Option<i64>,
}

/// Registry of installed runtimes, kept in install order.
#[derive(Debug, Default)]
pub struct RuntimeRegistry {
    runtimes: Vec<RuntimeDescriptor>,
}

impl RuntimeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `dir` for `<pkg>/runtime.json` entries. Entries are visited in
    /// lexicographic order, which stands in for install order; unreadable
    /// entries are skipped with a warning.
    pub fn load(dir: &Path, config: &EngineConfig) -> Self {
        let mut registry = Self::new();
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(dir = %dir.display(), error = %err, "runtimes directory not readable; starting empty");
                return registry;
            }
        };
        let mut paths: Vec<_> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path().join("runtime.json"))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();
        for path in paths {
            match Self::read_metadata(&path, config) {
                Ok(descriptor) => {
                    debug!(
                        language = %descriptor.language,
                        version = %descriptor.version,
                        "registered runtime"
                    );
                    registry.insert(descriptor);
                }
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping runtime metadata");
                }
            }
        }
        registry
    }

    fn read_metadata(path: &Path, config: &EngineConfig) -> Result<RuntimeDescriptor, String> {
        let raw = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
        let meta: RuntimeMetadata = serde_json::from_str(&raw).map_err(|e| e.to_string())?;
        let version = Version::parse(&meta.version).map_err(|e| e.to_string())?;
        if meta.compiled && meta.compile.is_none() {
            return Err("compiled runtime without a compile command".into());
        }
        let defaults_compile = config.compile_limits();
        let defaults_run = config.run_limits();
        Ok(RuntimeDescriptor {
            language: meta.language,
            version,
            aliases: meta.aliases,
            compiled: meta.compiled,
            compile_cmd: if meta.compiled { meta.compile } else { None },
            run_cmd: meta.run,
            compile_limits: StageLimits {
                timeout_ms: meta.compile_timeout.unwrap_or(defaults_compile.timeout_ms),
                cpu_time_ms: meta.compile_cpu_time.unwrap_or(defaults_compile.cpu_time_ms),
                memory_bytes: meta
                    .compile_memory_limit
                    .unwrap_or(defaults_compile.memory_bytes),
            },
            run_limits: StageLimits {
                timeout_ms: meta.run_timeout.unwrap_or(defaults_run.timeout_ms),
                cpu_time_ms: meta.run_cpu_time.unwrap_or(defaults_run.cpu_time_ms),
                memory_bytes: meta.run_memory_limit.unwrap_or(defaults_run.memory_bytes),
            },
        })
    }

    pub fn insert(&mut self, mut descriptor: RuntimeDescriptor) {
        if !descriptor.compiled {
            descriptor.compile_cmd = None;
        }
        self.runtimes.push(descriptor);
    }

    pub fn is_empty(&self) -> bool {
        self.runtimes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.runtimes.len()
    }

    /// Resolve `language` (by name or alias) against `selector`: an exact
    /// semantic version, or `*` for the latest installed. Among matches the
    /// highest version wins; ties go to the later install.
    pub fn resolve(
        &self,
        language: &str,
        selector: &str,
    ) -> Result<RuntimeDescriptor, EngineError> {
        let unknown = || EngineError::RuntimeUnknown {
            language: language.to_string(),
            selector: selector.to_string(),
        };
        let selector = selector.trim();
        let requirement = if selector.is_empty() || selector == "*" {
            VersionReq::STAR
        } else if let Ok(exact) = Version::parse(selector) {
            VersionReq::parse(&format!("={exact}")).map_err(|_| unknown())?
        } else {
            VersionReq::parse(selector).map_err(|_| unknown())?
        };

        let mut best: Option<&RuntimeDescriptor> = None;
        for candidate in &self.runtimes {
            if !candidate.matches_language(language) || !requirement.matches(&candidate.version) {
                continue;
            }
            // `>=` keeps the later install on version ties.
            if best.is_none_or(|b| candidate.version >= b.version) {
                best = Some(candidate);
            }
        }
        best.cloned().ok_or_else(unknown)
    }
}
