mod common;

use common::{Fault, FakeToolchain, QUANT_STEP, test_config};
use ncv_conformance::{
    CASE_FIXTURE_FILE, CaseFixture, HarnessConfig, HarnessError, Invoker, ReferenceEvaluator,
    TensorRole, WorkDir, close_to, load_case_fixtures, run_case, run_fixture_suite,
    write_suite_report,
};
use ncv_interp::{ConvParams, GraphInterpreter, GraphModel, GraphOp, Padding};
use ncv_io::DatasetFormat;
use ncv_ndarray::{Layout, Tensor};
use ncv_runtime::{CompileOptions, InferOptions, InferenceType, ProcessLauncher, ToolCommand};

const SAME_CONV_EXPECTED: [f32; 9] = [94.0, 154.0, 106.0, 186.0, 285.0, 186.0, 106.0, 154.0, 94.0];

fn fixture(id: &str) -> CaseFixture {
    let cfg = HarnessConfig::default_paths();
    load_case_fixtures(&cfg.fixture_root.join(CASE_FIXTURE_FILE))
        .expect("fixtures should load")
        .into_iter()
        .find(|case| case.id == id)
        .unwrap_or_else(|| panic!("fixture {id} missing"))
}

fn conv_model() -> GraphModel {
    let weights = (1..=9).map(|v| v as f32).collect();
    GraphModel::new(vec![1, 3, 3, 1]).with_op(GraphOp::Conv2d(ConvParams::new(
        [3, 3, 1, 1],
        weights,
        Padding::Same,
    )))
}

fn cleanup(cfg: &HarnessConfig) {
    let _ = std::fs::remove_dir_all(&cfg.work_root);
}

#[test]
fn float_conv_end_to_end_is_exact() {
    let cfg = test_config("float_e2e");
    let workdir = WorkDir::new(cfg.work_root.join("manual"), DatasetFormat::Raw);
    workdir.clear().expect("clear");
    let model = conv_model();
    workdir.save_model(&model).expect("save model");

    let input = Tensor::arange_f32(vec![1, 1, 3, 3], 1.0).expect("input");
    let expected = ReferenceEvaluator::new(GraphInterpreter, Layout::Nchw)
        .stage_expected(&workdir, "test", &model, &input)
        .expect("reference");
    assert_eq!(expected.as_f32().expect("f32"), &SAME_CONV_EXPECTED);

    let toolchain = FakeToolchain::faithful();
    let mut invoker = Invoker::new(&toolchain, ToolCommand::new("ncc"), ToolCommand::new("ncc"));
    let options = CompileOptions::default()
        .with_target("cpu")
        .with_inference_type(InferenceType::Float);
    let compiled = invoker.compile(&workdir, &options).expect("compile");
    let summary = compiled.summary.expect("fake artifact is a kmodel");
    assert_eq!(summary.version, 3);
    assert_eq!(summary.weights_bits(), 16);
    assert_eq!(summary.layer_count(), 1);

    invoker
        .infer(&workdir, "test", &InferOptions::default())
        .expect("infer");
    let report = close_to(&workdir, "test", 0.0).expect("exact match");
    assert!(report.pass);
    assert_eq!(report.max_abs_error, 0.0);
    assert_eq!(report.element_count, 9);
    assert_eq!(invoker.ledger().events().len(), 2);

    cleanup(&cfg);
}

#[test]
fn quantized_conv_passes_at_012_and_fails_exact() {
    let cfg = test_config("uint8_e2e");
    let toolchain = FakeToolchain::faithful();
    let case = fixture("conv2d_3x3_same_uint8");
    let report = run_case(&cfg, &toolchain, &case).expect("quantized case");
    assert!(report.passed, "{}", report.detail);
    assert_eq!(report.zero_tolerance_rejected, Some(true));
    let comparison = report.comparison.expect("comparison");
    assert!(comparison.max_abs_error > 0.0);
    assert!(comparison.max_abs_error <= f64::from(QUANT_STEP) / 2.0 + 1e-4);
    assert!(comparison.max_abs_error < 0.12);

    let workdir = WorkDir::new(cfg.work_root.join(&case.id), DatasetFormat::Raw);
    let err = close_to(&workdir, "test", 0.0).expect_err("exact comparison must fail");
    let HarnessError::ToleranceExceeded(violation) = err else {
        panic!("expected a tolerance violation, got {err:?}");
    };
    assert_eq!(violation.case, "test");
    assert_eq!(violation.tolerance, 0.0);
    assert_eq!(violation.index.len(), 4);
    assert!(violation.abs_error > 0.0);

    cleanup(&cfg);
}

#[test]
fn quantized_exact_output_fails_strict_mode_only() {
    let toolchain = FakeToolchain {
        quant_step: None,
        fault: Fault::None,
    };
    let case = fixture("conv2d_3x3_same_uint8");

    let strict = test_config("uint8_strict");
    let report = run_case(&strict, &toolchain, &case).expect("pipeline runs");
    assert!(!report.passed);
    assert_eq!(report.reason_code, "harness_zero_tolerance_passed");
    assert_eq!(report.zero_tolerance_rejected, Some(false));
    cleanup(&strict);

    let mut lenient = test_config("uint8_lenient");
    lenient.strict_mode = false;
    let report = run_case(&lenient, &toolchain, &case).expect("pipeline runs");
    assert!(report.passed);
    assert_eq!(report.zero_tolerance_rejected, None);
    cleanup(&lenient);
}

#[test]
fn clear_leaves_nothing_from_the_previous_case() {
    let cfg = test_config("leak");
    let toolchain = FakeToolchain::faithful();
    let case = fixture("conv2d_3x3_same_float");
    run_case(&cfg, &toolchain, &case).expect("first run");

    let workdir = WorkDir::new(cfg.work_root.join(&case.id), DatasetFormat::Raw);
    assert!(workdir.has_tensor("test", TensorRole::Candidate).expect("manifest"));
    workdir.clear().expect("clear");
    let input = Tensor::arange_f32(vec![1, 1, 3, 3], 1.0).expect("input");
    workdir.save_input("test", &input).expect("restage input");

    assert!(!workdir.artifact_path().exists());
    assert!(!workdir.has_tensor("test", TensorRole::Expected).expect("manifest"));
    assert!(!workdir.has_tensor("test", TensorRole::Candidate).expect("manifest"));
    let err = close_to(&workdir, "test", 0.0).expect_err("expected is gone");
    assert_eq!(err.reason_code(), "harness_artifact_missing");

    cleanup(&cfg);
}

#[test]
fn truncated_candidate_is_a_shape_mismatch() {
    let cfg = test_config("shape");
    let toolchain = FakeToolchain::with_fault(Fault::RuntimeTruncated);
    for id in ["conv2d_3x3_same_float", "conv2d_bias_relu6_npy_float"] {
        let err = run_case(&cfg, &toolchain, &fixture(id)).expect_err("shape mismatch");
        assert_eq!(err.reason_code(), "harness_shape_mismatch", "{id}: {err}");
    }
    cleanup(&cfg);
}

#[test]
fn compiler_failure_is_fatal_and_carries_output() {
    let cfg = test_config("compile_fail");
    let toolchain = FakeToolchain::with_fault(Fault::CompilerExit);
    let err = run_case(&cfg, &toolchain, &fixture("conv2d_3x3_same_float"))
        .expect_err("compile fails");
    let HarnessError::Compile {
        command,
        status,
        stdout,
        stderr,
    } = &err
    else {
        panic!("expected compile failure, got {err:?}");
    };
    assert!(command.starts_with("ncc compile "));
    assert_eq!(status, "1");
    assert_eq!(stdout, "fake compiler ran");
    assert!(stderr.contains("not supported"));
    cleanup(&cfg);
}

#[test]
fn runtime_failures_are_fatal() {
    let cfg = test_config("infer_fail");
    let case = fixture("conv2d_3x3_same_float");

    let err = run_case(&cfg, &FakeToolchain::with_fault(Fault::RuntimeExit), &case)
        .expect_err("runtime exits non-zero");
    assert_eq!(err.reason_code(), "harness_infer_failed");
    assert!(err.to_string().contains("arch mismatch"));

    let err = run_case(&cfg, &FakeToolchain::with_fault(Fault::RuntimeSilent), &case)
        .expect_err("runtime writes nothing");
    assert_eq!(err.reason_code(), "harness_artifact_missing");
    cleanup(&cfg);
}

#[test]
fn unlaunchable_compiler_is_a_launch_error() {
    let mut cfg = test_config("launch");
    cfg.compiler = ToolCommand::new("ncv-compiler-that-does-not-exist");
    let err = run_case(&cfg, &ProcessLauncher, &fixture("conv2d_3x3_same_float"))
        .expect_err("spawn fails");
    assert_eq!(err.reason_code(), "harness_launch_failed");
    cleanup(&cfg);
}

#[test]
fn fixture_suite_passes_with_faithful_toolchain() {
    let cfg = test_config("suite");
    let report = run_fixture_suite(&cfg, &FakeToolchain::faithful()).expect("suite runs");
    assert!(report.all_passed(), "failures: {:?}", report.failures);
    assert_eq!(report.case_count, report.cases.len());
    assert!(report.cases.iter().all(|case| case.invocations == 2));

    let report_path = cfg.work_root.join("suite_report.json");
    write_suite_report(&report_path, &report).expect("write report");
    let raw = std::fs::read_to_string(&report_path).expect("read report");
    let value: serde_json::Value = serde_json::from_str(&raw).expect("report json");
    assert_eq!(value["suite"], "conv2d_pipeline");
    assert_eq!(value["pass_count"], report.case_count);
    cleanup(&cfg);
}

#[test]
fn suite_records_failures_per_case() {
    let cfg = test_config("suite_fail");
    let report = run_fixture_suite(&cfg, &FakeToolchain::with_fault(Fault::RuntimeExit))
        .expect("suite runs");
    assert!(!report.all_passed());
    assert_eq!(report.pass_count, 0);
    assert_eq!(report.failures.len(), report.case_count);
    assert!(report.failures[0].contains("[harness_infer_failed]"));
    // compile ran and the failing runtime was launched
    assert!(report.cases.iter().all(|case| case.invocations == 2));
    cleanup(&cfg);

    let cfg = test_config("suite_compile_fail");
    let report = run_fixture_suite(&cfg, &FakeToolchain::with_fault(Fault::CompilerExit))
        .expect("suite runs");
    assert_eq!(report.pass_count, 0);
    assert!(report.cases.iter().all(|case| case.invocations == 1));
    assert!(
        report
            .cases
            .iter()
            .all(|case| case.reason_code == "harness_compile_failed")
    );
    cleanup(&cfg);
}
