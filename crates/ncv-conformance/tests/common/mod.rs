//! In-process stand-ins for the external compiler and runtime.
//!
//! The fake compiler validates its argv, then writes a kmodel v3 container
//! whose single layer body names the model and inference type. The fake
//! runtime reads that back, evaluates the model with the reference
//! interpreter in channel-first layout and, for `uint8` artifacts, snaps
//! every output onto a fixed quantization grid.

#![allow(dead_code)]

use ncv_conformance::{HarnessConfig, ReferenceEvaluator};
use ncv_interp::{GraphInterpreter, GraphModel, ModelSource};
use ncv_io::{KMODEL_FLAG_WEIGHTS_8BIT, KMODEL_VERSION, decode_tensor, encode_tensor};
use ncv_ndarray::{ElementType, Layout, NHWC_TO_NCHW, Tensor, permuted_shape};
use ncv_runtime::{
    CompileOptions, InferOptions, InferenceType, InvocationOutcome, InvocationRequest,
    LaunchError, ToolKind, ToolLauncher,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

/// Output grid for quantized artifacts; worst-case error is half a step.
pub const QUANT_STEP: f32 = 0.23;
const FAKE_LAYER_TYPE: u32 = 0x4E43;
const KMODEL_PREFIX_BYTES: usize = 8 * 4 + 2 * 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    CompilerExit,
    RuntimeExit,
    /// Runtime exits 0 without writing a candidate.
    RuntimeSilent,
    /// Runtime drops the last output element.
    RuntimeTruncated,
}

#[derive(Debug, Serialize, Deserialize)]
struct FakeArtifact {
    model: String,
    inference_type: String,
}

#[derive(Debug, Clone, Copy)]
pub struct FakeToolchain {
    /// `None` makes quantized artifacts exact.
    pub quant_step: Option<f32>,
    pub fault: Fault,
}

impl FakeToolchain {
    pub fn faithful() -> Self {
        Self {
            quant_step: Some(QUANT_STEP),
            fault: Fault::None,
        }
    }

    pub fn with_fault(fault: Fault) -> Self {
        Self {
            fault,
            ..Self::faithful()
        }
    }

    fn compile(&self, args: &[String]) -> Result<(), String> {
        if self.fault == Fault::CompilerExit {
            return Err("error: operator conv2d is not supported on this target".to_string());
        }
        let [command, model, artifact, rest @ ..] = args else {
            return Err(format!("usage: compile <model> <artifact> [options], got {args:?}"));
        };
        if command != "compile" {
            return Err(format!("unexpected subcommand {command}"));
        }
        let options = CompileOptions::from_args(rest).map_err(|err| err.to_string())?;
        if options.requires_calibration() && options.dataset.is_none() {
            return Err("uint8 requires --dataset".to_string());
        }

        let body = serde_json::to_vec(&FakeArtifact {
            model: model.clone(),
            inference_type: options.inference_type.as_str().to_string(),
        })
        .map_err(|err| err.to_string())?;
        let flags = if options.inference_type == InferenceType::Uint8 {
            KMODEL_FLAG_WEIGHTS_8BIT
        } else {
            0
        };
        let words = [
            KMODEL_VERSION,
            flags,
            0,
            1,
            0,
            0,
            0,
            0,
            FAKE_LAYER_TYPE,
            body.len() as u32,
        ];
        let mut bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
        bytes.extend_from_slice(&body);
        std::fs::write(artifact, bytes).map_err(|err| format!("writing {artifact}: {err}"))
    }

    fn infer(&self, args: &[String]) -> Result<(), String> {
        if self.fault == Fault::RuntimeExit {
            return Err("error: artifact arch mismatch".to_string());
        }
        let [command, artifact, candidate, dataset_flag, input, rest @ ..] = args else {
            return Err(format!("usage: infer <artifact> <out> --dataset <in>, got {args:?}"));
        };
        if command != "infer" || dataset_flag != "--dataset" {
            return Err(format!("malformed runtime argv {args:?}"));
        }
        let options = InferOptions::from_args(rest).map_err(|err| err.to_string())?;
        if self.fault == Fault::RuntimeSilent {
            return Ok(());
        }

        let artifact_bytes = std::fs::read(artifact).map_err(|err| err.to_string())?;
        let body = artifact_bytes
            .get(KMODEL_PREFIX_BYTES..)
            .ok_or("artifact too short")?;
        let meta: FakeArtifact = serde_json::from_slice(body).map_err(|err| err.to_string())?;
        let model_bytes = std::fs::read(&meta.model).map_err(|err| err.to_string())?;
        let model = GraphModel::from_slice(&model_bytes).map_err(|err| err.to_string())?;

        let nchw_shape = permuted_shape(&model.input_spec().shape, &NHWC_TO_NCHW)
            .map_err(|err| err.to_string())?;
        let input_bytes = std::fs::read(input).map_err(|err| err.to_string())?;
        let input = decode_tensor(
            &input_bytes,
            options.dataset_format,
            &nchw_shape,
            ElementType::F32,
        )
        .map_err(|err| err.to_string())?;

        let evaluator = ReferenceEvaluator::new(GraphInterpreter, Layout::Nchw);
        let mut output = evaluator
            .evaluate(&model_bytes, &input)
            .map_err(|err| err.to_string())?;

        if meta.inference_type == InferenceType::Uint8.as_str() {
            if let Some(step) = self.quant_step {
                let values = output
                    .as_f32()
                    .ok_or("float output expected")?
                    .iter()
                    .map(|v| (v / step).round() * step)
                    .collect();
                output = Tensor::from_f32(output.shape().to_vec(), values)
                    .map_err(|err| err.to_string())?;
            }
        }
        if self.fault == Fault::RuntimeTruncated {
            let values = output.as_f32().ok_or("float output expected")?;
            let kept = values[..values.len() - 1].to_vec();
            output = Tensor::from_f32(vec![kept.len()], kept).map_err(|err| err.to_string())?;
        }

        let encoded =
            encode_tensor(&output, options.dataset_format).map_err(|err| err.to_string())?;
        std::fs::write(candidate, encoded).map_err(|err| format!("writing {candidate}: {err}"))
    }
}

impl ToolLauncher for FakeToolchain {
    fn launch(&self, request: &InvocationRequest) -> Result<InvocationOutcome, LaunchError> {
        let result = match request.tool {
            ToolKind::Compiler => self.compile(&request.args),
            ToolKind::Runtime => self.infer(&request.args),
        };
        let (exit_code, stderr) = match result {
            Ok(()) => (0, String::new()),
            Err(message) => (1, message),
        };
        Ok(InvocationOutcome {
            exit_code: Some(exit_code),
            stdout: format!("fake {} ran", request.tool.as_str()),
            stderr,
            duration_ms: 0,
        })
    }
}

pub fn temp_work_root(name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_nanos());
    std::env::temp_dir().join(format!("ncv_it_{name}_{ts}"))
}

pub fn test_config(name: &str) -> HarnessConfig {
    HarnessConfig::default_paths().with_work_root(temp_work_root(name))
}
