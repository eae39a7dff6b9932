use crate::workdir::{TensorRole, WorkDir};
use crate::{HarnessError, StepLog, sha256_hex};
use ncv_io::encode_raw;
use ncv_ndarray::{Tensor, unravel_index};
use serde::Serialize;

/// Tolerance used for uint8-quantized compilation.
pub const QUANTIZED_TOLERANCE: f64 = 0.12;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComparisonReport {
    pub case_id: String,
    pub tolerance: f64,
    pub element_count: usize,
    pub max_abs_error: f64,
    pub pass: bool,
}

/// First element outside tolerance, plus the worst error over the tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct ToleranceViolation {
    pub case: String,
    pub tolerance: f64,
    pub flat_index: usize,
    pub index: Vec<usize>,
    pub expected: f64,
    pub actual: f64,
    pub abs_error: f64,
    pub max_abs_error: f64,
}

impl std::fmt::Display for ToleranceViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: not close within tolerance={} at flat index {} {:?}: expected={} actual={} abs_error={} (max_abs_error={})",
            self.case,
            self.tolerance,
            self.flat_index,
            self.index,
            self.expected,
            self.actual,
            self.abs_error,
            self.max_abs_error
        )
    }
}

fn element_error(expected: f64, actual: f64) -> f64 {
    if expected == actual || (expected.is_nan() && actual.is_nan()) {
        return 0.0;
    }
    let diff = (expected - actual).abs();
    if diff.is_nan() { f64::INFINITY } else { diff }
}

/// Element-wise absolute comparison. Shapes must match exactly; equal values
/// (including equal infinities and NaN against NaN) always pass.
pub fn compare_tensors(
    case: &str,
    expected: &Tensor,
    candidate: &Tensor,
    tolerance: f64,
) -> Result<ComparisonReport, HarnessError> {
    if !tolerance.is_finite() || tolerance < 0.0 {
        return Err(HarnessError::Config(format!(
            "{case}: tolerance must be finite and >= 0, got {tolerance}"
        )));
    }
    if expected.shape() != candidate.shape() {
        return Err(HarnessError::ShapeMismatch {
            case: case.to_string(),
            expected: expected.shape().to_vec(),
            actual: candidate.shape().to_vec(),
        });
    }

    let expected_values = expected.to_f64_values();
    let actual_values = candidate.to_f64_values();
    let mut max_abs_error = 0.0_f64;
    let mut first_violation: Option<(usize, f64)> = None;
    for (flat, (&e, &a)) in expected_values.iter().zip(&actual_values).enumerate() {
        let err = element_error(e, a);
        max_abs_error = max_abs_error.max(err);
        if err > tolerance && first_violation.is_none() {
            first_violation = Some((flat, err));
        }
    }

    if let Some((flat_index, abs_error)) = first_violation {
        let index = unravel_index(flat_index, expected.shape()).unwrap_or_default();
        return Err(HarnessError::ToleranceExceeded(Box::new(ToleranceViolation {
            case: case.to_string(),
            tolerance,
            flat_index,
            index,
            expected: expected_values[flat_index],
            actual: actual_values[flat_index],
            abs_error,
            max_abs_error,
        })));
    }

    Ok(ComparisonReport {
        case_id: case.to_string(),
        tolerance,
        element_count: expected_values.len(),
        max_abs_error,
        pass: true,
    })
}

/// Staged `expected` and `candidate` tensors of `case`, plus the candidate
/// file digest. Headerless candidates take the expected shape when element
/// counts agree.
pub fn load_staged_pair(
    workdir: &WorkDir,
    case: &str,
) -> Result<(Tensor, Tensor, String), HarnessError> {
    let expected = workdir.load_tensor(case, TensorRole::Expected)?;
    let candidate_entry = workdir.tensor_entry(case, TensorRole::Candidate)?;
    let candidate = workdir.load_tensor(case, TensorRole::Candidate)?;
    if candidate_entry.shape.is_some() {
        return Ok((expected, candidate, candidate_entry.sha256));
    }
    if candidate.len() != expected.len() {
        return Err(HarnessError::ShapeMismatch {
            case: case.to_string(),
            expected: expected.shape().to_vec(),
            actual: candidate.shape().to_vec(),
        });
    }
    let reshaped = candidate
        .reshaped(expected.shape().to_vec())
        .map_err(|err| HarnessError::ShapeMismatch {
            case: format!("{case} ({err})"),
            expected: expected.shape().to_vec(),
            actual: candidate.shape().to_vec(),
        })?;
    Ok((expected, reshaped, candidate_entry.sha256))
}

/// Compares the staged `expected` and `candidate` tensors of `case`.
pub fn close_to(
    workdir: &WorkDir,
    case: &str,
    tolerance: f64,
) -> Result<ComparisonReport, HarnessError> {
    let mut step = StepLog::start(case, "compare");
    let result = (|| -> Result<ComparisonReport, HarnessError> {
        let (expected, candidate, candidate_sha256) = load_staged_pair(workdir, case)?;
        step.add_artifact(&workdir.tensor_path(case, TensorRole::Expected));
        step.add_artifact(&workdir.tensor_path(case, TensorRole::Candidate));
        step.input_digest = sha256_hex(&encode_raw(&expected));
        step.output_digest = candidate_sha256;

        let report = compare_tensors(case, &expected, &candidate, tolerance)?;
        step.detail = format!(
            "tolerance={} max_abs_error={}",
            report.tolerance, report.max_abs_error
        );
        Ok(report)
    })();
    step.finish(result)
}
