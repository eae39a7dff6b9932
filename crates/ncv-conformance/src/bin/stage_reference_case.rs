#![forbid(unsafe_code)]

use ncv_conformance::{CASE_FIXTURE_FILE, HarnessConfig, load_case_fixtures, stage_case};

fn main() {
    if let Err(err) = run() {
        eprintln!("stage_reference_case failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    let cfg = HarnessConfig::default_paths();
    let only = std::env::args().nth(1);
    let fixtures = load_case_fixtures(&cfg.fixture_root.join(CASE_FIXTURE_FILE))
        .map_err(|err| err.to_string())?;

    let mut staged = 0usize;
    for fixture in fixtures
        .iter()
        .filter(|fixture| only.as_deref().is_none_or(|id| id == fixture.id))
    {
        let workdir = stage_case(&cfg, fixture).map_err(|err| err.to_string())?;
        println!("staged {} -> {}", fixture.id, workdir.root().display());
        staged += 1;
    }

    if staged == 0 {
        return Err(format!(
            "no fixture case matched {}",
            only.as_deref().unwrap_or("<all>")
        ));
    }
    Ok(())
}
