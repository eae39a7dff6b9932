//! Compiler and runtime invocation against a staged work directory.
//!
//! Compiler argv: `compile <model> <artifact> -i <fmt> -t <target>
//! --inference-type <t> [--dataset <path> --dataset-format <f>]
//! [--use-float-input]`.
//! Runtime argv: `infer <artifact> <candidate> --dataset <input>
//! --dataset-format <f>`.

use crate::workdir::{TensorEntry, TensorRole, WorkDir, read_existing};
use crate::{HarnessError, StepLog, sha256_hex};
use ncv_io::{KModelSummary, inspect_kmodel};
use ncv_ndarray::ElementType;
use ncv_runtime::{
    CompileOptions, InferOptions, InferenceType, InvocationLedger, InvocationOutcome,
    InvocationRequest, ToolCommand, ToolKind, ToolLauncher, launch_and_record,
};
use std::fs;
use std::path::{Path, PathBuf};

/// Result of a successful compilation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledArtifact {
    pub path: PathBuf,
    pub sha256: String,
    /// `None` when the artifact header is not a recognizable kmodel.
    pub summary: Option<KModelSummary>,
}

/// Drives the external compiler and runtime through a [`ToolLauncher`],
/// keeping a ledger of every invocation.
pub struct Invoker<'a> {
    launcher: &'a dyn ToolLauncher,
    compiler: ToolCommand,
    runtime: ToolCommand,
    ledger: InvocationLedger,
}

impl<'a> Invoker<'a> {
    #[must_use]
    pub fn new(
        launcher: &'a dyn ToolLauncher,
        compiler: ToolCommand,
        runtime: ToolCommand,
    ) -> Self {
        Self {
            launcher,
            compiler,
            runtime,
            ledger: InvocationLedger::new(),
        }
    }

    #[must_use]
    pub fn ledger(&self) -> &InvocationLedger {
        &self.ledger
    }

    /// Compiles the staged model into `model.kmodel`. Exit code zero must
    /// leave the artifact behind; any other exit is fatal.
    pub fn compile(
        &mut self,
        workdir: &WorkDir,
        options: &CompileOptions,
    ) -> Result<CompiledArtifact, HarnessError> {
        let mut step = StepLog::start("", "compile");
        let result = self.compile_staged(workdir, options, &mut step);
        step.finish(result)
    }

    fn compile_staged(
        &mut self,
        workdir: &WorkDir,
        options: &CompileOptions,
        step: &mut StepLog,
    ) -> Result<CompiledArtifact, HarnessError> {
        let (model_path, model_format) = workdir.model()?;
        let inputs = workdir.staged_inputs()?;
        if inputs.is_empty() {
            return Err(HarnessError::missing(
                workdir.root(),
                "no input tensor staged before compilation",
            ));
        }
        if options.input_format != model_format {
            return Err(HarnessError::Config(format!(
                "compile input format '{}' does not match staged model format '{model_format}'",
                options.input_format
            )));
        }

        let artifact = workdir.artifact_path();
        let mut args = vec![
            "compile".to_string(),
            model_path.display().to_string(),
            artifact.display().to_string(),
        ];
        args.extend(options.to_args());
        let request = self
            .compiler
            .request(ToolKind::Compiler, args, workdir.root());

        check_calibration(options, &request)?;
        check_input_interface(options, &inputs)?;

        remove_stale(&artifact)?;
        step.input_digest = sha256_hex(&read_existing(&model_path)?);
        step.add_artifact(&model_path);

        let outcome = self.launch(&request, "compile")?;
        if !outcome.success() {
            return Err(HarnessError::Compile {
                command: request.command_line(),
                status: outcome.status_label(),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            });
        }

        if !artifact.is_file() {
            return Err(HarnessError::missing(
                &artifact,
                "compiler exited 0 without writing the compiled artifact",
            ));
        }
        let bytes = read_existing(&artifact)?;
        let sha256 = sha256_hex(&bytes);
        let summary = match inspect_kmodel(&bytes) {
            Ok(summary) => {
                step.detail = format!(
                    "{} kmodel v{} weights={}bit layers={} output_bytes={}",
                    options.inference_type.as_str(),
                    summary.version,
                    summary.weights_bits(),
                    summary.layer_count(),
                    summary.main_mem_output_size
                );
                Some(summary)
            }
            Err(err) => {
                step.detail = format!(
                    "{} artifact header not inspected: {err}",
                    options.inference_type.as_str()
                );
                None
            }
        };
        step.output_digest = sha256.clone();
        step.add_artifact(&artifact);

        Ok(CompiledArtifact {
            path: artifact,
            sha256,
            summary,
        })
    }

    /// Runs the compiled artifact on the staged input of `case`, staging the
    /// runtime's output as the case's candidate.
    pub fn infer(
        &mut self,
        workdir: &WorkDir,
        case: &str,
        options: &InferOptions,
    ) -> Result<PathBuf, HarnessError> {
        let mut step = StepLog::start(case, "infer");
        let result = self.infer_staged(workdir, case, options, &mut step);
        step.finish(result)
    }

    fn infer_staged(
        &mut self,
        workdir: &WorkDir,
        case: &str,
        options: &InferOptions,
        step: &mut StepLog,
    ) -> Result<PathBuf, HarnessError> {
        let artifact = workdir.artifact_path();
        if !artifact.is_file() {
            return Err(HarnessError::missing(
                &artifact,
                "no compiled artifact; compile must succeed before inference",
            ));
        }
        if !workdir.has_tensor(case, TensorRole::Input)? {
            return Err(HarnessError::missing(
                &workdir.tensor_path(case, TensorRole::Input),
                format!("no input tensor staged for case '{case}'"),
            ));
        }
        if options.dataset_format != workdir.format() {
            return Err(HarnessError::Config(format!(
                "inference dataset format '{}' does not match staged format '{}'",
                options.dataset_format.as_str(),
                workdir.format().as_str()
            )));
        }

        let input = workdir.tensor_path(case, TensorRole::Input);
        let candidate = workdir.tensor_path(case, TensorRole::Candidate);
        remove_stale(&candidate)?;

        let mut args = vec![
            "infer".to_string(),
            artifact.display().to_string(),
            candidate.display().to_string(),
            "--dataset".to_string(),
            input.display().to_string(),
        ];
        args.extend(options.to_args());
        let request = self.runtime.request(ToolKind::Runtime, args, workdir.root());
        step.input_digest = sha256_hex(&read_existing(&input)?);
        step.add_artifact(&artifact);
        step.add_artifact(&input);

        let outcome = self.launch(&request, case)?;
        if !outcome.success() {
            return Err(HarnessError::Infer {
                command: request.command_line(),
                status: outcome.status_label(),
                stdout: outcome.stdout,
                stderr: outcome.stderr,
            });
        }
        if !candidate.is_file() {
            return Err(HarnessError::missing(
                &candidate,
                "runtime exited 0 without writing the candidate output",
            ));
        }

        let entry = workdir.record_external(case, TensorRole::Candidate, ElementType::F32)?;
        step.output_digest = entry.sha256;
        step.add_artifact(&candidate);
        Ok(candidate)
    }

    fn launch(
        &mut self,
        request: &InvocationRequest,
        note: &str,
    ) -> Result<InvocationOutcome, HarnessError> {
        launch_and_record(&mut self.ledger, self.launcher, request, note)
            .map_err(|err| HarnessError::launch(&err, request.tool))
    }
}

/// A quantized artifact takes uint8 input unless `--use-float-input` keeps
/// the float interface, so float inputs need that flag.
fn check_input_interface(
    options: &CompileOptions,
    inputs: &[TensorEntry],
) -> Result<(), HarnessError> {
    if options.inference_type != InferenceType::Uint8 || options.use_float_input {
        return Ok(());
    }
    match inputs
        .iter()
        .find(|entry| entry.dtype == ElementType::F32.name())
    {
        Some(entry) => Err(HarnessError::Config(format!(
            "{}: uint8 compilation without --use-float-input expects uint8 input, but '{}' is {}",
            entry.case, entry.file, entry.dtype
        ))),
        None => Ok(()),
    }
}

/// Quantized compilation needs calibration data that actually exists.
fn check_calibration(
    options: &CompileOptions,
    request: &InvocationRequest,
) -> Result<(), HarnessError> {
    let rejected = |detail: String| HarnessError::Compile {
        command: request.command_line(),
        status: "not_launched".to_string(),
        stdout: String::new(),
        stderr: detail,
    };
    match (&options.dataset, options.requires_calibration()) {
        (None, true) => Err(rejected(
            "inference type uint8 requires a calibration --dataset".to_string(),
        )),
        (Some(dataset), _) if !dataset.exists() => Err(rejected(format!(
            "calibration dataset {} does not exist",
            dataset.display()
        ))),
        _ => Ok(()),
    }
}

fn remove_stale(path: &Path) -> Result<(), HarnessError> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(HarnessError::staging(path, err)),
    }
}
