#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub use ncv_io::DatasetFormat;

/// Input format handed to the compiler when a case does not name one.
pub const DEFAULT_INPUT_FORMAT: &str = "ncv-graph";
pub const DEFAULT_TARGET: &str = "cpu";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InferenceType {
    #[default]
    Float,
    Uint8,
}

impl InferenceType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Float => "float",
            Self::Uint8 => "uint8",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, OptionsError> {
        match raw.trim() {
            "float" => Ok(Self::Float),
            "uint8" => Ok(Self::Uint8),
            other => Err(OptionsError::InvalidValue {
                flag: "--inference-type".to_string(),
                value: other.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolKind {
    Compiler,
    Runtime,
}

impl ToolKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Compiler => "compiler",
            Self::Runtime => "runtime",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptionsError {
    UnknownFlag(String),
    MissingValue(String),
    InvalidValue { flag: String, value: String },
    UnexpectedArgument(String),
}

impl OptionsError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::UnknownFlag(_) => "runtime_option_unknown",
            Self::MissingValue(_) => "runtime_option_missing_value",
            Self::InvalidValue { .. } => "runtime_option_invalid_value",
            Self::UnexpectedArgument(_) => "runtime_option_unexpected_argument",
        }
    }
}

impl std::fmt::Display for OptionsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownFlag(flag) => write!(f, "unknown option '{flag}'"),
            Self::MissingValue(flag) => write!(f, "option '{flag}' requires a value"),
            Self::InvalidValue { flag, value } => {
                write!(f, "invalid value '{value}' for option '{flag}'")
            }
            Self::UnexpectedArgument(arg) => write!(f, "unexpected positional argument '{arg}'"),
        }
    }
}

impl std::error::Error for OptionsError {}

fn take_value<'a>(
    flag: &str,
    iter: &mut impl Iterator<Item = &'a str>,
) -> Result<&'a str, OptionsError> {
    iter.next()
        .filter(|value| !value.starts_with("--"))
        .ok_or_else(|| OptionsError::MissingValue(flag.to_string()))
}

fn parse_dataset_format(flag: &str, raw: &str) -> Result<DatasetFormat, OptionsError> {
    DatasetFormat::parse(raw).map_err(|_| OptionsError::InvalidValue {
        flag: flag.to_string(),
        value: raw.to_string(),
    })
}

/// Compiler flags for one case. The model and artifact paths are positional
/// and supplied by the invoker, not by these options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileOptions {
    pub inference_type: InferenceType,
    pub target: String,
    /// Calibration data; required for `uint8`.
    pub dataset: Option<PathBuf>,
    pub dataset_format: DatasetFormat,
    pub use_float_input: bool,
    pub input_format: String,
}

impl Default for CompileOptions {
    fn default() -> Self {
        Self {
            inference_type: InferenceType::Float,
            target: DEFAULT_TARGET.to_string(),
            dataset: None,
            dataset_format: DatasetFormat::Raw,
            use_float_input: false,
            input_format: DEFAULT_INPUT_FORMAT.to_string(),
        }
    }
}

impl CompileOptions {
    #[must_use]
    pub fn with_inference_type(mut self, inference_type: InferenceType) -> Self {
        self.inference_type = inference_type;
        self
    }

    #[must_use]
    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = target.into();
        self
    }

    #[must_use]
    pub fn with_dataset(mut self, dataset: impl Into<PathBuf>, format: DatasetFormat) -> Self {
        self.dataset = Some(dataset.into());
        self.dataset_format = format;
        self
    }

    #[must_use]
    pub fn with_use_float_input(mut self, use_float_input: bool) -> Self {
        self.use_float_input = use_float_input;
        self
    }

    #[must_use]
    pub fn with_input_format(mut self, input_format: impl Into<String>) -> Self {
        self.input_format = input_format.into();
        self
    }

    #[must_use]
    pub fn requires_calibration(&self) -> bool {
        self.inference_type == InferenceType::Uint8
    }

    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.input_format.clone(),
            "-t".to_string(),
            self.target.clone(),
            "--inference-type".to_string(),
            self.inference_type.as_str().to_string(),
        ];
        if let Some(dataset) = &self.dataset {
            args.push("--dataset".to_string());
            args.push(dataset.display().to_string());
            args.push("--dataset-format".to_string());
            args.push(self.dataset_format.as_str().to_string());
        }
        if self.use_float_input {
            args.push("--use-float-input".to_string());
        }
        args
    }

    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        let mut iter = args.iter().map(AsRef::<str>::as_ref);
        while let Some(arg) = iter.next() {
            match arg {
                "-i" | "--input-format" => {
                    options.input_format = take_value(arg, &mut iter)?.to_string();
                }
                "-t" | "--target" => {
                    options.target = take_value(arg, &mut iter)?.to_string();
                }
                "--inference-type" => {
                    options.inference_type = InferenceType::parse(take_value(arg, &mut iter)?)?;
                }
                "--dataset" => {
                    options.dataset = Some(PathBuf::from(take_value(arg, &mut iter)?));
                }
                "--dataset-format" => {
                    options.dataset_format =
                        parse_dataset_format(arg, take_value(arg, &mut iter)?)?;
                }
                "--use-float-input" => options.use_float_input = true,
                flag if flag.starts_with('-') => {
                    return Err(OptionsError::UnknownFlag(flag.to_string()));
                }
                other => return Err(OptionsError::UnexpectedArgument(other.to_string())),
            }
        }
        Ok(options)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InferOptions {
    pub dataset_format: DatasetFormat,
}

impl InferOptions {
    #[must_use]
    pub fn to_args(&self) -> Vec<String> {
        vec![
            "--dataset-format".to_string(),
            self.dataset_format.as_str().to_string(),
        ]
    }

    pub fn from_args<S: AsRef<str>>(args: &[S]) -> Result<Self, OptionsError> {
        let mut options = Self::default();
        let mut iter = args.iter().map(AsRef::<str>::as_ref);
        while let Some(arg) = iter.next() {
            match arg {
                "--dataset-format" => {
                    options.dataset_format =
                        parse_dataset_format(arg, take_value(arg, &mut iter)?)?;
                }
                flag if flag.starts_with('-') => {
                    return Err(OptionsError::UnknownFlag(flag.to_string()));
                }
                other => return Err(OptionsError::UnexpectedArgument(other.to_string())),
            }
        }
        Ok(options)
    }
}

// ── tool launching ────────

/// An external executable plus arguments that precede every invocation
/// (e.g. a wrapper script or a subcommand prefix).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub leading_args: Vec<String>,
}

impl ToolCommand {
    #[must_use]
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            leading_args: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_leading_args(mut self, leading_args: Vec<String>) -> Self {
        self.leading_args = leading_args;
        self
    }

    #[must_use]
    pub fn request(
        &self,
        tool: ToolKind,
        args: Vec<String>,
        working_dir: &Path,
    ) -> InvocationRequest {
        let mut full_args = self.leading_args.clone();
        full_args.extend(args);
        InvocationRequest {
            tool,
            program: self.program.clone(),
            args: full_args,
            working_dir: working_dir.to_path_buf(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationRequest {
    pub tool: ToolKind,
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
}

impl InvocationRequest {
    #[must_use]
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationOutcome {
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u128,
}

impl InvocationOutcome {
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    #[must_use]
    pub fn status_label(&self) -> String {
        self.exit_code
            .map_or_else(|| "signal".to_string(), |code| code.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchError {
    EmptyProgram(ToolKind),
    Spawn { program: String, detail: String },
}

impl LaunchError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::EmptyProgram(_) => "runtime_launch_program_empty",
            Self::Spawn { .. } => "runtime_launch_spawn_failed",
        }
    }
}

impl std::fmt::Display for LaunchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::EmptyProgram(tool) => write!(f, "no program configured for {}", tool.as_str()),
            Self::Spawn { program, detail } => {
                write!(f, "failed to launch '{program}': {detail}")
            }
        }
    }
}

impl std::error::Error for LaunchError {}

/// Runs one external tool invocation to completion. Exit status is reported
/// in the outcome, not as an error; `Err` means the tool never ran.
pub trait ToolLauncher {
    fn launch(&self, request: &InvocationRequest) -> Result<InvocationOutcome, LaunchError>;
}

/// Blocking subprocess launcher.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessLauncher;

impl ToolLauncher for ProcessLauncher {
    fn launch(&self, request: &InvocationRequest) -> Result<InvocationOutcome, LaunchError> {
        if request.program.trim().is_empty() {
            return Err(LaunchError::EmptyProgram(request.tool));
        }
        let started = Instant::now();
        let output = Command::new(&request.program)
            .args(&request.args)
            .current_dir(&request.working_dir)
            .output()
            .map_err(|err| LaunchError::Spawn {
                program: request.program.clone(),
                detail: err.to_string(),
            })?;
        Ok(InvocationOutcome {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration_ms: started.elapsed().as_millis(),
        })
    }
}

impl<L: ToolLauncher + ?Sized> ToolLauncher for &L {
    fn launch(&self, request: &InvocationRequest) -> Result<InvocationOutcome, LaunchError> {
        (**self).launch(request)
    }
}

// ── invocation ledger ────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationEvent {
    pub ts_millis: u128,
    pub tool: ToolKind,
    pub args: Vec<String>,
    /// `None` when the tool could not be launched or was killed by a signal.
    pub exit_code: Option<i32>,
    pub duration_ms: u128,
    pub note: String,
}

#[derive(Debug, Default, Clone)]
pub struct InvocationLedger {
    events: Vec<InvocationEvent>,
}

impl InvocationLedger {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, event: InvocationEvent) {
        self.events.push(event);
    }

    #[must_use]
    pub fn events(&self) -> &[InvocationEvent] {
        &self.events
    }

    #[must_use]
    pub fn last(&self) -> Option<&InvocationEvent> {
        self.events.last()
    }
}

#[must_use]
pub fn now_unix_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_millis())
}

pub fn launch_and_record(
    ledger: &mut InvocationLedger,
    launcher: &dyn ToolLauncher,
    request: &InvocationRequest,
    note: impl Into<String>,
) -> Result<InvocationOutcome, LaunchError> {
    let result = launcher.launch(request);
    let (exit_code, duration_ms) = match &result {
        Ok(outcome) => (outcome.exit_code, outcome.duration_ms),
        Err(_) => (None, 0),
    };
    ledger.record(InvocationEvent {
        ts_millis: now_unix_ms(),
        tool: request.tool,
        args: request.args.clone(),
        exit_code,
        duration_ms,
        note: note.into(),
    });
    result
}

#[cfg(test)]
mod tests {
    use super::{
        CompileOptions, DatasetFormat, InferOptions, InferenceType, InvocationLedger,
        InvocationOutcome, InvocationRequest, LaunchError, OptionsError, ProcessLauncher,
        ToolCommand, ToolKind, ToolLauncher, launch_and_record,
    };
    use std::path::{Path, PathBuf};

    struct CannedLauncher {
        exit_code: Option<i32>,
    }

    impl ToolLauncher for CannedLauncher {
        fn launch(&self, request: &InvocationRequest) -> Result<InvocationOutcome, LaunchError> {
            Ok(InvocationOutcome {
                exit_code: self.exit_code,
                stdout: request.command_line(),
                stderr: String::new(),
                duration_ms: 3,
            })
        }
    }

    #[test]
    fn float_compile_args_are_minimal() {
        let args = CompileOptions::default().to_args();
        assert_eq!(
            args,
            vec!["-i", "ncv-graph", "-t", "cpu", "--inference-type", "float"]
        );
    }

    #[test]
    fn uint8_compile_args_carry_calibration_dataset() {
        let options = CompileOptions::default()
            .with_inference_type(InferenceType::Uint8)
            .with_target("k210")
            .with_dataset("/tmp/calib", DatasetFormat::Raw)
            .with_use_float_input(true);
        assert!(options.requires_calibration());
        let args = options.to_args();
        assert_eq!(
            args,
            vec![
                "-i",
                "ncv-graph",
                "-t",
                "k210",
                "--inference-type",
                "uint8",
                "--dataset",
                "/tmp/calib",
                "--dataset-format",
                "raw",
                "--use-float-input",
            ]
        );
        assert_eq!(CompileOptions::from_args(&args).expect("parse"), options);
    }

    #[test]
    fn compile_parser_accepts_long_target_and_rejects_unknown_flags() {
        let options =
            CompileOptions::from_args(&["--target", "k210", "--inference-type", "uint8"])
                .expect("parse");
        assert_eq!(options.target, "k210");
        assert_eq!(options.inference_type, InferenceType::Uint8);
        assert_eq!(options.dataset, None);

        let err = CompileOptions::from_args(&["--optimize"]).expect_err("unknown");
        assert_eq!(err, OptionsError::UnknownFlag("--optimize".to_string()));

        let err = CompileOptions::from_args(&["-t"]).expect_err("missing value");
        assert_eq!(err.reason_code(), "runtime_option_missing_value");

        let err = CompileOptions::from_args(&["--inference-type", "int16"]).expect_err("bad");
        assert_eq!(err.reason_code(), "runtime_option_invalid_value");

        let err = CompileOptions::from_args(&["model.json"]).expect_err("positional");
        assert_eq!(err.reason_code(), "runtime_option_unexpected_argument");
    }

    #[test]
    fn infer_options_parse_dataset_format() {
        let options = InferOptions::from_args(&["--dataset-format", "npy"]).expect("parse");
        assert_eq!(options.dataset_format, DatasetFormat::Npy);
        assert_eq!(options.to_args(), vec!["--dataset-format", "npy"]);
        assert_eq!(InferOptions::default().dataset_format, DatasetFormat::Raw);

        let err = InferOptions::from_args(&["--dataset-format", "image"]).expect_err("bad");
        assert_eq!(
            err,
            OptionsError::InvalidValue {
                flag: "--dataset-format".to_string(),
                value: "image".to_string(),
            }
        );
        assert!(InferOptions::from_args(&["--target", "cpu"]).is_err());
    }

    #[test]
    fn tool_command_prepends_leading_args() {
        let tool = ToolCommand::new("python3").with_leading_args(vec!["ncc.py".to_string()]);
        let request = tool.request(
            ToolKind::Compiler,
            vec!["compile".to_string(), "model.json".to_string()],
            Path::new("/tmp"),
        );
        assert_eq!(request.args, vec!["ncc.py", "compile", "model.json"]);
        assert_eq!(request.working_dir, PathBuf::from("/tmp"));
        assert_eq!(request.command_line(), "python3 ncc.py compile model.json");
    }

    #[test]
    fn records_invocations() {
        let mut ledger = InvocationLedger::new();
        let request = ToolCommand::new("ncc").request(
            ToolKind::Runtime,
            vec!["infer".to_string()],
            Path::new("."),
        );
        let outcome = launch_and_record(
            &mut ledger,
            &CannedLauncher { exit_code: Some(2) },
            &request,
            "case_a",
        )
        .expect("canned launch");
        assert!(!outcome.success());
        assert_eq!(outcome.status_label(), "2");
        let event = ledger.last().expect("event should be present");
        assert_eq!(event.tool, ToolKind::Runtime);
        assert_eq!(event.exit_code, Some(2));
        assert_eq!(event.note, "case_a");
        assert_eq!(ledger.events().len(), 1);
    }

    #[test]
    fn process_launcher_reports_missing_programs() {
        let launcher = ProcessLauncher;
        let request = ToolCommand::new("ncv-definitely-not-installed-tool").request(
            ToolKind::Compiler,
            Vec::new(),
            &std::env::temp_dir(),
        );
        let err = launcher.launch(&request).expect_err("spawn should fail");
        assert_eq!(err.reason_code(), "runtime_launch_spawn_failed");

        let empty = ToolCommand::new("  ").request(ToolKind::Runtime, Vec::new(), Path::new("."));
        assert_eq!(
            launcher.launch(&empty).expect_err("empty program"),
            LaunchError::EmptyProgram(ToolKind::Runtime)
        );
    }
}
