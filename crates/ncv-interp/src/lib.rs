#![forbid(unsafe_code)]

//! Reference side of the harness: the capability a model must offer to be
//! staged and compiled, and an interpreter that evaluates serialized graph
//! models independently of the compiler under test.
//!
//! Graph models are evaluated channel-last (`NHWC`) with filters stored as
//! `[kh, kw, in_channels, out_channels]`, matching TensorFlow conventions.

use ncv_ndarray::{ElementType, Layout, ShapeError, Tensor, element_count};
use serde::{Deserialize, Serialize};

pub const GRAPH_MODEL_FORMAT: ModelFormat = ModelFormat {
    name: "ncv-graph",
    extension: "json",
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelFormat {
    /// Value handed to the compiler's input-format flag.
    pub name: &'static str,
    pub extension: &'static str,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TensorSpec {
    pub shape: Vec<usize>,
    pub element_type: ElementType,
}

impl TensorSpec {
    #[must_use]
    pub fn f32(shape: Vec<usize>) -> Self {
        Self {
            shape,
            element_type: ElementType::F32,
        }
    }

    #[must_use]
    pub fn matches(&self, tensor: &Tensor) -> bool {
        self.shape == tensor.shape() && self.element_type == tensor.element_type()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum InterpError {
    Encode(String),
    Decode(String),
    InputMismatch {
        expected: TensorSpec,
        actual_shape: Vec<usize>,
        actual_type: ElementType,
    },
    InvalidOp {
        index: usize,
        detail: String,
    },
    Shape(ShapeError),
}

impl InterpError {
    #[must_use]
    pub fn reason_code(&self) -> &'static str {
        match self {
            Self::Encode(_) => "interp_model_encode_failed",
            Self::Decode(_) => "interp_model_decode_failed",
            Self::InputMismatch { .. } => "interp_input_signature_mismatch",
            Self::InvalidOp { .. } => "interp_op_contract_violation",
            Self::Shape(_) => "interp_shape_contract_violation",
        }
    }
}

impl std::fmt::Display for InterpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Encode(detail) => write!(f, "model serialization failed: {detail}"),
            Self::Decode(detail) => write!(f, "model deserialization failed: {detail}"),
            Self::InputMismatch {
                expected,
                actual_shape,
                actual_type,
            } => write!(
                f,
                "input signature mismatch expected={:?}/{} actual={:?}/{}",
                expected.shape,
                expected.element_type.name(),
                actual_shape,
                actual_type.name()
            ),
            Self::InvalidOp { index, detail } => write!(f, "op #{index}: {detail}"),
            Self::Shape(err) => write!(f, "shape error: {err}"),
        }
    }
}

impl std::error::Error for InterpError {}

impl From<ShapeError> for InterpError {
    fn from(err: ShapeError) -> Self {
        Self::Shape(err)
    }
}

/// What the harness needs from a model: a fixed input signature and a
/// compiler-consumable serialization.
pub trait ModelSource {
    fn input_spec(&self) -> TensorSpec;

    fn format(&self) -> ModelFormat;

    fn serialize(&self) -> Result<Vec<u8>, InterpError>;
}

/// Evaluates a serialized model on one input, independently of the compiler.
pub trait BaselineInterpreter {
    fn name(&self) -> &'static str;

    /// Channel ordering the interpreter expects its input in and produces its
    /// output in.
    fn layout(&self) -> Layout;

    fn invoke(&self, serialized: &[u8], input: &Tensor) -> Result<Tensor, InterpError>;
}

/// An already-serialized model file, e.g. one exported by another front end.
#[derive(Debug, Clone)]
pub struct SerializedModel {
    pub bytes: Vec<u8>,
    pub format: ModelFormat,
    pub input_spec: TensorSpec,
}

impl ModelSource for SerializedModel {
    fn input_spec(&self) -> TensorSpec {
        self.input_spec.clone()
    }

    fn format(&self) -> ModelFormat {
        self.format
    }

    fn serialize(&self) -> Result<Vec<u8>, InterpError> {
        Ok(self.bytes.clone())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Padding {
    Same,
    Valid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationKind {
    #[default]
    None,
    Relu,
    Relu6,
}

impl ActivationKind {
    #[must_use]
    pub fn apply(self, value: f32) -> f32 {
        match self {
            Self::None => value,
            Self::Relu => value.max(0.0),
            Self::Relu6 => value.clamp(0.0, 6.0),
        }
    }
}

fn default_unit_pair() -> [usize; 2] {
    [1, 1]
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvParams {
    /// `[kh, kw, in_channels, out_channels]`; for depthwise convolutions the
    /// last axis is the channel multiplier.
    pub filter_shape: [usize; 4],
    pub filter: Vec<f32>,
    #[serde(default)]
    pub bias: Option<Vec<f32>>,
    #[serde(default = "default_unit_pair")]
    pub strides: [usize; 2],
    #[serde(default = "default_unit_pair")]
    pub dilations: [usize; 2],
    pub padding: Padding,
    #[serde(default)]
    pub activation: ActivationKind,
}

impl ConvParams {
    #[must_use]
    pub fn new(filter_shape: [usize; 4], filter: Vec<f32>, padding: Padding) -> Self {
        Self {
            filter_shape,
            filter,
            bias: None,
            strides: [1, 1],
            dilations: [1, 1],
            padding,
            activation: ActivationKind::None,
        }
    }

    #[must_use]
    pub fn with_bias(mut self, bias: Vec<f32>) -> Self {
        self.bias = Some(bias);
        self
    }

    #[must_use]
    pub fn with_strides(mut self, strides: [usize; 2]) -> Self {
        self.strides = strides;
        self
    }

    #[must_use]
    pub fn with_activation(mut self, activation: ActivationKind) -> Self {
        self.activation = activation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum GraphOp {
    Conv2d(ConvParams),
    DepthwiseConv2d(ConvParams),
    BiasAdd { bias: Vec<f32> },
    Activation { kind: ActivationKind },
    Reshape { shape: Vec<usize> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphInput {
    pub shape: Vec<usize>,
    #[serde(default = "default_input_dtype", with = "element_type_name")]
    pub dtype: ElementType,
}

fn default_input_dtype() -> ElementType {
    ElementType::F32
}

/// Element types travel as their names (`float32`, `uint8`); unknown names
/// are rejected when the model is read.
mod element_type_name {
    use ncv_ndarray::ElementType;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &ElementType, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(value.name())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ElementType, D::Error> {
        let name = String::deserialize(deserializer)?;
        ElementType::parse(&name).ok_or_else(|| {
            <D::Error as serde::de::Error>::custom(format!("unsupported input dtype '{name}'"))
        })
    }
}

/// A single-input, single-output graph, evaluated channel-last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphModel {
    #[serde(default = "default_schema_version")]
    pub schema_version: u8,
    pub input: GraphInput,
    pub ops: Vec<GraphOp>,
}

fn default_schema_version() -> u8 {
    1
}

impl GraphModel {
    #[must_use]
    pub fn new(input_shape_nhwc: Vec<usize>) -> Self {
        Self {
            schema_version: 1,
            input: GraphInput {
                shape: input_shape_nhwc,
                dtype: default_input_dtype(),
            },
            ops: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_op(mut self, op: GraphOp) -> Self {
        self.ops.push(op);
        self
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, InterpError> {
        serde_json::from_slice(bytes).map_err(|err| InterpError::Decode(err.to_string()))
    }

    #[must_use]
    pub fn spec(&self) -> TensorSpec {
        TensorSpec {
            shape: self.input.shape.clone(),
            element_type: self.input.dtype,
        }
    }

    /// Runs the graph on a channel-last input matching the signature.
    pub fn evaluate(&self, input: &Tensor) -> Result<Tensor, InterpError> {
        let spec = self.spec();
        if !spec.matches(input) {
            return Err(InterpError::InputMismatch {
                expected: spec,
                actual_shape: input.shape().to_vec(),
                actual_type: input.element_type(),
            });
        }

        let mut shape = input.shape().to_vec();
        let mut values: Vec<f32> = input.to_f64_values().into_iter().map(|v| v as f32).collect();

        for (index, op) in self.ops.iter().enumerate() {
            let invalid = |detail: String| InterpError::InvalidOp { index, detail };
            (shape, values) = match op {
                GraphOp::Conv2d(params) => conv2d_nhwc(&shape, &values, params, false)
                    .map_err(invalid)?,
                GraphOp::DepthwiseConv2d(params) => {
                    conv2d_nhwc(&shape, &values, params, true).map_err(invalid)?
                }
                GraphOp::BiasAdd { bias } => {
                    let channels = shape.last().copied().unwrap_or(1);
                    if bias.len() != channels {
                        return Err(invalid(format!(
                            "bias length {} does not match {channels} channels",
                            bias.len()
                        )));
                    }
                    let out = values
                        .iter()
                        .enumerate()
                        .map(|(i, v)| v + bias[i % channels])
                        .collect();
                    (shape, out)
                }
                GraphOp::Activation { kind } => {
                    let out = values.iter().map(|&v| kind.apply(v)).collect();
                    (shape, out)
                }
                GraphOp::Reshape { shape: target } => {
                    if element_count(target)? != values.len() {
                        return Err(invalid(format!(
                            "cannot reshape {} elements into {target:?}",
                            values.len()
                        )));
                    }
                    (target.clone(), values)
                }
            };
        }

        Ok(Tensor::from_f32(shape, values)?)
    }
}

impl ModelSource for GraphModel {
    fn input_spec(&self) -> TensorSpec {
        self.spec()
    }

    fn format(&self) -> ModelFormat {
        GRAPH_MODEL_FORMAT
    }

    fn serialize(&self) -> Result<Vec<u8>, InterpError> {
        serde_json::to_vec_pretty(self).map_err(|err| InterpError::Encode(err.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct GraphInterpreter;

impl BaselineInterpreter for GraphInterpreter {
    fn name(&self) -> &'static str {
        "ncv-graph-interpreter"
    }

    fn layout(&self) -> Layout {
        Layout::Nhwc
    }

    fn invoke(&self, serialized: &[u8], input: &Tensor) -> Result<Tensor, InterpError> {
        GraphModel::from_slice(serialized)?.evaluate(input)
    }
}

/// Output extent and leading pad of one spatial axis, TensorFlow rules:
/// `SAME` keeps `ceil(input / stride)` and puts the odd pad element at the end.
pub fn output_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    dilation: usize,
    padding: Padding,
) -> Result<(usize, usize), String> {
    if kernel == 0 || stride == 0 || dilation == 0 {
        return Err("kernel, stride and dilation must be > 0".to_string());
    }
    let overflow =
        || format!("kernel {kernel} with dilation {dilation} and stride {stride} overflows");
    let effective = (kernel - 1)
        .checked_mul(dilation)
        .and_then(|span| span.checked_add(1))
        .ok_or_else(overflow)?;
    match padding {
        Padding::Same => {
            let out = input.div_ceil(stride);
            let needed = out
                .saturating_sub(1)
                .checked_mul(stride)
                .and_then(|span| span.checked_add(effective))
                .ok_or_else(overflow)?
                .saturating_sub(input);
            Ok((out, needed / 2))
        }
        Padding::Valid => {
            if input < effective {
                return Err(format!(
                    "VALID padding needs input extent {input} >= effective kernel {effective}"
                ));
            }
            Ok(((input - effective) / stride + 1, 0))
        }
    }
}

fn conv2d_nhwc(
    shape: &[usize],
    input: &[f32],
    params: &ConvParams,
    depthwise: bool,
) -> Result<(Vec<usize>, Vec<f32>), String> {
    let &[batch, in_h, in_w, in_c] = shape else {
        return Err(format!("convolution expects a rank-4 NHWC input, got {shape:?}"));
    };
    let [kh, kw, filter_in, filter_out] = params.filter_shape;
    if filter_in != in_c {
        return Err(format!(
            "filter expects {filter_in} input channels but input has {in_c}"
        ));
    }
    let filter_len = element_count(&params.filter_shape)
        .map_err(|err| format!("filter shape {:?}: {err}", params.filter_shape))?;
    if params.filter.len() != filter_len {
        return Err(format!(
            "filter holds {} values but shape {:?} needs {filter_len}",
            params.filter.len(),
            params.filter_shape,
        ));
    }
    let out_c = if depthwise {
        in_c.checked_mul(filter_out)
            .ok_or_else(|| format!("{in_c} channels x multiplier {filter_out} overflows"))?
    } else {
        filter_out
    };
    if let Some(bias) = &params.bias {
        if bias.len() != out_c {
            return Err(format!(
                "bias length {} does not match {out_c} output channels",
                bias.len()
            ));
        }
    }

    let (out_h, pad_top) = output_extent(
        in_h,
        kh,
        params.strides[0],
        params.dilations[0],
        params.padding,
    )?;
    let (out_w, pad_left) = output_extent(
        in_w,
        kw,
        params.strides[1],
        params.dilations[1],
        params.padding,
    )?;

    let out_shape = vec![batch, out_h, out_w, out_c];
    let out_len = element_count(&out_shape).map_err(|err| format!("output {out_shape:?}: {err}"))?;
    let mut out = vec![0.0_f32; out_len];
    for n in 0..batch {
        for oy in 0..out_h {
            for ox in 0..out_w {
                for oc in 0..out_c {
                    let mut acc = 0.0_f32;
                    for ky in 0..kh {
                        let iy = (oy * params.strides[0] + ky * params.dilations[0]) as isize
                            - pad_top as isize;
                        if iy < 0 || iy as usize >= in_h {
                            continue;
                        }
                        for kx in 0..kw {
                            let ix = (ox * params.strides[1] + kx * params.dilations[1]) as isize
                                - pad_left as isize;
                            if ix < 0 || ix as usize >= in_w {
                                continue;
                            }
                            let base = ((n * in_h + iy as usize) * in_w + ix as usize) * in_c;
                            let tap = (ky * kw + kx) * filter_in;
                            if depthwise {
                                let ic = oc / filter_out;
                                let m = oc % filter_out;
                                acc += input[base + ic]
                                    * params.filter[(tap + ic) * filter_out + m];
                            } else {
                                for ic in 0..in_c {
                                    acc += input[base + ic]
                                        * params.filter[(tap + ic) * filter_out + oc];
                                }
                            }
                        }
                    }
                    if let Some(bias) = &params.bias {
                        acc += bias[oc];
                    }
                    out[((n * out_h + oy) * out_w + ox) * out_c + oc] =
                        params.activation.apply(acc);
                }
            }
        }
    }

    Ok((out_shape, out))
}
