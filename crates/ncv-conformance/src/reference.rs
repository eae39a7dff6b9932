use crate::workdir::{TensorRole, WorkDir};
use crate::{HarnessError, StepLog, sha256_hex};
use ncv_interp::{BaselineInterpreter, ModelSource};
use ncv_io::encode_raw;
use ncv_ndarray::{Layout, Tensor, permuted_shape};

/// Produces `expected` tensors by running the baseline interpreter, moving
/// tensors between the runtime's layout and the interpreter's around the call.
#[derive(Debug, Clone)]
pub struct ReferenceEvaluator<I> {
    interpreter: I,
    runtime_layout: Layout,
}

impl<I: BaselineInterpreter> ReferenceEvaluator<I> {
    #[must_use]
    pub fn new(interpreter: I, runtime_layout: Layout) -> Self {
        Self {
            interpreter,
            runtime_layout,
        }
    }

    #[must_use]
    pub fn interpreter(&self) -> &I {
        &self.interpreter
    }

    #[must_use]
    pub const fn runtime_layout(&self) -> Layout {
        self.runtime_layout
    }

    /// Evaluates `serialized` on an input given in the runtime layout and
    /// returns the output in the runtime layout. Outputs that are not rank 4
    /// carry no channel axis to move and are returned as produced.
    pub fn evaluate(&self, serialized: &[u8], input: &Tensor) -> Result<Tensor, HarnessError> {
        let model_layout = self.interpreter.layout();
        let converted = self.to_interpreter_layout(input)?;
        let output = self
            .interpreter
            .invoke(serialized, &converted)
            .map_err(|err| {
                HarnessError::Reference(format!(
                    "{} [{}]: {err}",
                    self.interpreter.name(),
                    err.reason_code()
                ))
            })?;
        if output.shape().len() != 4 {
            return Ok(output);
        }
        output
            .convert_layout(model_layout, self.runtime_layout)
            .map_err(|err| HarnessError::Reference(format!("output layout conversion: {err}")))
    }

    fn to_interpreter_layout(&self, input: &Tensor) -> Result<Tensor, HarnessError> {
        input
            .convert_layout(self.runtime_layout, self.interpreter.layout())
            .map_err(|err| HarnessError::Reference(format!("input layout conversion: {err}")))
    }

    /// Stages `input` and the reference output as `expected` for `case`.
    pub fn stage_expected(
        &self,
        workdir: &WorkDir,
        case: &str,
        model: &dyn ModelSource,
        input: &Tensor,
    ) -> Result<Tensor, HarnessError> {
        let signature = model.input_spec();
        let perm = self.runtime_layout.permutation_to(self.interpreter.layout());
        let runtime_shape_ok = permuted_shape(input.shape(), &perm)
            .is_ok_and(|shape| shape == signature.shape)
            && input.element_type() == signature.element_type;
        if !runtime_shape_ok {
            return Err(HarnessError::Config(format!(
                "{case}: input {:?}/{} in {} does not match model signature {:?}/{} in {}",
                input.shape(),
                input.element_type().name(),
                self.runtime_layout.name(),
                signature.shape,
                signature.element_type.name(),
                self.interpreter.layout().name()
            )));
        }

        workdir.save_input(case, input)?;

        let mut step = StepLog::start(case, "reference");
        step.add_artifact(&workdir.tensor_path(case, TensorRole::Input));
        let result = (|| -> Result<Tensor, HarnessError> {
            let serialized = model
                .serialize()
                .map_err(|err| HarnessError::ModelInvalid(err.to_string()))?;
            step.input_digest = sha256_hex(&encode_raw(input));
            let expected = self.evaluate(&serialized, input)?;
            step.output_digest = sha256_hex(&encode_raw(&expected));
            step.detail = format!("{} shape={:?}", self.interpreter.name(), expected.shape());
            Ok(expected)
        })();
        let expected = step.finish(result)?;

        workdir.save_expect(case, &expected)?;
        Ok(expected)
    }
}

#[cfg(test)]
mod tests {
    use super::ReferenceEvaluator;
    use crate::workdir::{TensorRole, WorkDir};
    use ncv_interp::{
        BaselineInterpreter, ConvParams, GraphInterpreter, GraphModel, GraphOp, InterpError,
        Padding,
    };
    use ncv_io::DatasetFormat;
    use ncv_ndarray::{Layout, Tensor};
    use std::cell::RefCell;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    /// Records the shape it was called with and echoes the input.
    struct ShapeProbe {
        seen: RefCell<Vec<Vec<usize>>>,
    }

    impl BaselineInterpreter for ShapeProbe {
        fn name(&self) -> &'static str {
            "shape-probe"
        }

        fn layout(&self) -> Layout {
            Layout::Nhwc
        }

        fn invoke(&self, _serialized: &[u8], input: &Tensor) -> Result<Tensor, InterpError> {
            self.seen.borrow_mut().push(input.shape().to_vec());
            Ok(input.clone())
        }
    }

    fn temp_dir(name: &str) -> PathBuf {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos());
        std::env::temp_dir().join(format!("ncv_reference_{name}_{ts}"))
    }

    fn conv_model() -> GraphModel {
        let weights = (1..=9).map(|v| v as f32).collect();
        GraphModel::new(vec![1, 3, 3, 1]).with_op(GraphOp::Conv2d(ConvParams::new(
            [3, 3, 1, 1],
            weights,
            Padding::Same,
        )))
    }

    #[test]
    fn converts_layout_in_both_directions() {
        let probe = ShapeProbe {
            seen: RefCell::new(Vec::new()),
        };
        let evaluator = ReferenceEvaluator::new(probe, Layout::Nchw);
        let input = Tensor::arange_f32(vec![1, 2, 3, 4], 0.0).expect("input");
        let output = evaluator.evaluate(b"{}", &input).expect("evaluate");
        assert_eq!(evaluator.interpreter().seen.borrow()[0], vec![1, 3, 4, 2]);
        // identity model: round trip must be bit exact
        assert_eq!(output, input);
    }

    #[test]
    fn stages_input_and_expected_for_conv_case() {
        let root = temp_dir("conv");
        let workdir = WorkDir::new(&root, DatasetFormat::Raw);
        workdir.clear().expect("clear");
        let evaluator = ReferenceEvaluator::new(GraphInterpreter, Layout::Nchw);
        let input = Tensor::arange_f32(vec![1, 1, 3, 3], 1.0).expect("input");

        let expected = evaluator
            .stage_expected(&workdir, "test", &conv_model(), &input)
            .expect("stage");
        assert_eq!(expected.shape(), &[1, 1, 3, 3]);
        assert_eq!(
            expected.as_f32().expect("f32"),
            &[94.0, 154.0, 106.0, 186.0, 285.0, 186.0, 106.0, 154.0, 94.0]
        );
        let loaded = workdir
            .load_tensor("test", TensorRole::Expected)
            .expect("expected staged");
        assert_eq!(loaded, expected);
        assert!(workdir.has_tensor("test", TensorRole::Input).expect("manifest"));

        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn rejects_inputs_that_do_not_match_the_signature() {
        let root = temp_dir("signature");
        let workdir = WorkDir::new(&root, DatasetFormat::Raw);
        let evaluator = ReferenceEvaluator::new(GraphInterpreter, Layout::Nchw);
        // already channel-last, so the permuted shape is wrong
        let input = Tensor::arange_f32(vec![1, 3, 3, 1], 1.0).expect("input");
        let err = evaluator
            .stage_expected(&workdir, "test", &conv_model(), &input)
            .expect_err("signature");
        assert_eq!(err.reason_code(), "harness_config_invalid");
        assert!(!workdir.has_tensor("test", TensorRole::Input).expect("manifest"));
    }

    #[test]
    fn interpreter_failures_are_reference_errors() {
        let evaluator = ReferenceEvaluator::new(GraphInterpreter, Layout::Nchw);
        let input = Tensor::arange_f32(vec![1, 1, 3, 3], 1.0).expect("input");
        let err = evaluator.evaluate(b"[]", &input).expect_err("bad model");
        assert_eq!(err.reason_code(), "harness_reference_failed");
        assert!(err.to_string().contains("interp_model_decode_failed"));
    }
}
