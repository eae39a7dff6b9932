#![forbid(unsafe_code)]

pub mod cases;
pub mod compare;
pub mod invoke;
pub mod reference;
pub mod workdir;

pub use cases::{
    CaseFixture, CaseReport, load_case_fixtures, run_case, run_fixture_suite, stage_case,
    write_suite_report,
};
pub use compare::{
    ComparisonReport, ToleranceViolation, close_to, compare_tensors, load_staged_pair,
};
pub use invoke::{CompiledArtifact, Invoker};
pub use reference::ReferenceEvaluator;
pub use workdir::{TensorRole, WorkDir};

use ncv_runtime::{LaunchError, ToolCommand, ToolKind, now_unix_ms};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, OnceLock};
use std::time::Instant;

pub const DEFAULT_TOOL: &str = "ncc";
pub const CASE_FIXTURE_FILE: &str = "conv2d_cases.json";

#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub work_root: PathBuf,
    pub fixture_root: PathBuf,
    pub compiler: ToolCommand,
    pub runtime: ToolCommand,
    /// Also require quantized cases to fail at zero tolerance.
    pub strict_mode: bool,
}

impl HarnessConfig {
    #[must_use]
    pub fn default_paths() -> Self {
        let repo_root = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../..");
        let work_root = resolve_env_override("NCV_WORK_DIR")
            .map_or_else(|| repo_root.join("target/ncv-work"), PathBuf::from);
        Self {
            work_root,
            fixture_root: PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("fixtures"),
            compiler: ToolCommand::new(
                resolve_env_override("NCV_COMPILER").unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            ),
            runtime: ToolCommand::new(
                resolve_env_override("NCV_RUNTIME").unwrap_or_else(|| DEFAULT_TOOL.to_string()),
            ),
            strict_mode: true,
        }
    }

    #[must_use]
    pub fn with_work_root(mut self, work_root: impl Into<PathBuf>) -> Self {
        self.work_root = work_root.into();
        self
    }
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self::default_paths()
    }
}

fn resolve_env_override(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SuiteReport {
    pub suite: &'static str,
    pub case_count: usize,
    pub pass_count: usize,
    pub failures: Vec<String>,
    pub cases: Vec<CaseReport>,
}

impl SuiteReport {
    #[must_use]
    pub fn all_passed(&self) -> bool {
        self.case_count == self.pass_count && self.failures.is_empty()
    }
}

// ── errors ────────

#[derive(Debug, Clone, PartialEq)]
pub enum HarnessError {
    Staging {
        path: PathBuf,
        detail: String,
    },
    ArtifactMissing {
        path: PathBuf,
        detail: String,
    },
    ModelInvalid(String),
    Reference(String),
    Launch {
        tool: ToolKind,
        detail: String,
    },
    Compile {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
    Infer {
        command: String,
        status: String,
        stdout: String,
        stderr: String,
    },
    TensorDecode {
        path: PathBuf,
        detail: String,
    },
    ShapeMismatch {
        case: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    ToleranceExceeded(Box<ToleranceViolation>),
    Config(String),
}

impl HarnessError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Staging { .. } => "harness_staging_io_failed",
            Self::ArtifactMissing { .. } => "harness_artifact_missing",
            Self::ModelInvalid(_) => "harness_model_invalid",
            Self::Reference(_) => "harness_reference_failed",
            Self::Launch { .. } => "harness_launch_failed",
            Self::Compile { .. } => "harness_compile_failed",
            Self::Infer { .. } => "harness_infer_failed",
            Self::TensorDecode { .. } => "harness_tensor_decode_failed",
            Self::ShapeMismatch { .. } => "harness_shape_mismatch",
            Self::ToleranceExceeded(_) => "harness_tolerance_exceeded",
            Self::Config(_) => "harness_config_invalid",
        }
    }

    pub(crate) fn staging(path: &Path, err: impl std::fmt::Display) -> Self {
        Self::Staging {
            path: path.to_path_buf(),
            detail: err.to_string(),
        }
    }

    pub(crate) fn missing(path: &Path, detail: impl Into<String>) -> Self {
        Self::ArtifactMissing {
            path: path.to_path_buf(),
            detail: detail.into(),
        }
    }

    pub(crate) fn launch(err: &LaunchError, tool: ToolKind) -> Self {
        Self::Launch {
            tool,
            detail: err.to_string(),
        }
    }
}

impl std::fmt::Display for HarnessError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Staging { path, detail } => {
                write!(f, "staging failed for {}: {detail}", path.display())
            }
            Self::ArtifactMissing { path, detail } => {
                write!(f, "missing artifact {}: {detail}", path.display())
            }
            Self::ModelInvalid(detail) => write!(f, "model could not be serialized: {detail}"),
            Self::Reference(detail) => write!(f, "reference evaluation failed: {detail}"),
            Self::Launch { tool, detail } => {
                write!(f, "{} could not be launched: {detail}", tool.as_str())
            }
            Self::Compile {
                command,
                status,
                stdout,
                stderr,
            } => write!(
                f,
                "compilation failed command=`{command}` status={status} stdout={} stderr={}",
                stdout.trim(),
                stderr.trim()
            ),
            Self::Infer {
                command,
                status,
                stdout,
                stderr,
            } => write!(
                f,
                "inference failed command=`{command}` status={status} stdout={} stderr={}",
                stdout.trim(),
                stderr.trim()
            ),
            Self::TensorDecode { path, detail } => {
                write!(f, "failed decoding {}: {detail}", path.display())
            }
            Self::ShapeMismatch {
                case,
                expected,
                actual,
            } => write!(
                f,
                "{case}: shape mismatch expected={expected:?} candidate={actual:?}"
            ),
            Self::ToleranceExceeded(violation) => write!(f, "{violation}"),
            Self::Config(detail) => write!(f, "invalid configuration: {detail}"),
        }
    }
}

impl std::error::Error for HarnessError {}

// ── logging ────────

static HARNESS_LOG_PATH: OnceLock<Mutex<Option<PathBuf>>> = OnceLock::new();

pub fn set_harness_log_path(path: Option<PathBuf>) {
    let cell = HARNESS_LOG_PATH.get_or_init(|| Mutex::new(None));
    if let Ok(mut slot) = cell.lock() {
        *slot = path;
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HarnessLogEntry {
    pub ts_unix_ms: u128,
    pub case_id: String,
    pub step: &'static str,
    pub outcome: &'static str,
    pub reason_code: String,
    pub duration_ms: u128,
    pub input_digest: String,
    pub output_digest: String,
    pub artifact_refs: Vec<String>,
    pub detail: String,
}

fn maybe_append_harness_log(entry: &HarnessLogEntry) -> Result<(), HarnessError> {
    let configured = HARNESS_LOG_PATH
        .get()
        .and_then(|cell| cell.lock().ok())
        .and_then(|slot| slot.clone());
    let from_env = std::env::var_os("NCV_HARNESS_LOG_PATH").map(PathBuf::from);
    let Some(path) = configured.or(from_env) else {
        return Ok(());
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| HarnessError::staging(parent, err))?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|err| HarnessError::staging(&path, err))?;
    let line = serde_json::to_string(entry).map_err(|err| HarnessError::staging(&path, err))?;
    let mut payload = line.into_bytes();
    payload.push(b'\n');
    file.write_all(&payload)
        .map_err(|err| HarnessError::staging(&path, err))
}

/// One pipeline step in flight; `finish` appends its log line.
#[derive(Debug)]
pub(crate) struct StepLog {
    case_id: String,
    step: &'static str,
    started: Instant,
    pub(crate) input_digest: String,
    pub(crate) output_digest: String,
    pub(crate) artifact_refs: Vec<String>,
    pub(crate) detail: String,
}

impl StepLog {
    pub(crate) fn start(case_id: &str, step: &'static str) -> Self {
        Self {
            case_id: case_id.to_string(),
            step,
            started: Instant::now(),
            input_digest: String::new(),
            output_digest: String::new(),
            artifact_refs: Vec::new(),
            detail: String::new(),
        }
    }

    pub(crate) fn add_artifact(&mut self, path: &Path) {
        self.artifact_refs.push(path.display().to_string());
    }

    /// Logs the step and hands the result back. A log failure only surfaces
    /// when the step itself succeeded.
    pub(crate) fn finish<T>(self, result: Result<T, HarnessError>) -> Result<T, HarnessError> {
        let (outcome, reason_code, detail) = match &result {
            Ok(_) => ("pass", "ok".to_string(), self.detail),
            Err(err) => ("fail", err.reason_code().to_string(), err.to_string()),
        };
        let entry = HarnessLogEntry {
            ts_unix_ms: now_unix_ms(),
            case_id: self.case_id,
            step: self.step,
            outcome,
            reason_code,
            duration_ms: self.started.elapsed().as_millis(),
            input_digest: self.input_digest,
            output_digest: self.output_digest,
            artifact_refs: self.artifact_refs,
            detail,
        };
        let logged = maybe_append_harness_log(&entry);
        match (result, logged) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(log_err)) => Err(log_err),
            (Err(err), _) => Err(err),
        }
    }
}

#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut out, "{byte:02x}");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::{HarnessConfig, HarnessError, StepLog, set_harness_log_path, sha256_hex};
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn temp_path(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        std::env::temp_dir().join(format!("ncv_{name}_{ts}"))
    }

    #[test]
    fn default_paths_point_at_fixtures() {
        let cfg = HarnessConfig::default_paths();
        assert!(cfg.fixture_root.ends_with("fixtures"));
        assert!(cfg.strict_mode);
        assert!(!cfg.compiler.program.is_empty());
        assert!(!cfg.runtime.program.is_empty());
    }

    #[test]
    fn sha256_hex_matches_known_digest() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn reason_codes_are_distinct_for_shape_and_tolerance() {
        let shape = HarnessError::ShapeMismatch {
            case: "test".to_string(),
            expected: vec![1, 1, 3, 3],
            actual: vec![8],
        };
        assert_eq!(shape.reason_code(), "harness_shape_mismatch");
        assert!(shape.to_string().contains("expected=[1, 1, 3, 3]"));
        assert_eq!(
            HarnessError::Config("x".to_string()).reason_code(),
            "harness_config_invalid"
        );
    }

    #[test]
    fn step_log_appends_jsonl_lines() {
        let log_path = temp_path("harness_log").with_extension("jsonl");
        set_harness_log_path(Some(log_path.clone()));

        let mut step = StepLog::start("case_log", "stage");
        step.input_digest = sha256_hex(b"input");
        assert_eq!(step.finish(Ok::<u8, HarnessError>(7)).expect("logged"), 7);
        let failed = StepLog::start("case_log", "compile")
            .finish::<()>(Err(HarnessError::Config("bad flag".to_string())));
        assert!(failed.is_err());

        set_harness_log_path(None);
        let raw = std::fs::read_to_string(&log_path).expect("log file");
        let lines: Vec<serde_json::Value> = raw
            .lines()
            .filter(|line| line.contains("case_log"))
            .map(|line| serde_json::from_str(line).expect("json line"))
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["step"], "stage");
        assert_eq!(lines[0]["outcome"], "pass");
        assert_eq!(lines[1]["reason_code"], "harness_config_invalid");
        assert_eq!(lines[1]["outcome"], "fail");
        let _ = std::fs::remove_file(&log_path);
    }
}
