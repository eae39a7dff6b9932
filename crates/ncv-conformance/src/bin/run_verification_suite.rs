#![forbid(unsafe_code)]

use ncv_conformance::{HarnessConfig, run_fixture_suite, write_suite_report};
use ncv_runtime::ProcessLauncher;

fn main() {
    if let Err(err) = run() {
        eprintln!("run_verification_suite failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cfg = HarnessConfig::default_paths();
    let report = run_fixture_suite(&cfg, &ProcessLauncher).map_err(|err| err.to_string())?;
    let report_path = cfg.work_root.join("suite_report.json");
    write_suite_report(&report_path, &report).map_err(|err| err.to_string())?;

    println!(
        "{}: cases={} passed={} failed={} compiler={} runtime={}",
        report.suite,
        report.case_count,
        report.pass_count,
        report.failures.len(),
        cfg.compiler.program,
        cfg.runtime.program
    );
    println!("wrote {}", report_path.display());

    if report.all_passed() {
        Ok(())
    } else {
        for failure in &report.failures {
            eprintln!("  {failure}");
        }
        Err(format!("{} case(s) failed", report.failures.len()))
    }
}
