//! Stub Monte Carlo solver for development testing
//!
//! Mimics the solver's observable contract without doing any transport:
//! reads `settings.xml` from its working directory (the bundle's
//! `inputs/`), prints batch progress on stdout, and writes a statepoint
//! container plus `summary.h5` next to the inputs. Behavior is driven by
//! environment variables so tests can exercise failure paths:
//!
//! - `AONP_STUB_KEFF` / `AONP_STUB_KEFF_STD`: reported estimator
//!   (defaults 1.62 / 0.004)
//! - `AONP_STUB_LINE_DELAY_MS`: sleep between batch lines (default 0)
//! - `AONP_STUB_EXIT_CODE`: exit with this code after printing, without
//!   writing a statepoint
//! - `AONP_STUB_SKIP_STATEPOINT`: exit 0 but write nothing
//! - `AONP_STUB_STDERR`: line to emit on stderr before finishing

use std::collections::BTreeMap;
use std::io::Write;
use std::thread;
use std::time::Duration;

use camino::Utf8Path;

use aonp_extract::{DatasetValue, Statepoint, write_statepoint};

fn main() {
    if let Err(message) = run() {
        eprintln!("solver-stub: {message}");
        std::process::exit(3);
    }
}

fn run() -> Result<(), String> {
    let settings = std::fs::read_to_string("settings.xml")
        .map_err(|e| format!("cannot read settings.xml: {e}"))?;
    let batches: u32 = tag_value(&settings, "batches")?;
    let inactive: u32 = tag_value(&settings, "inactive")?;
    let particles: i64 = tag_value(&settings, "particles")?;
    let seed: i64 = tag_value(&settings, "seed")?;

    let keff = env_f64("AONP_STUB_KEFF", 1.62);
    let keff_std = env_f64("AONP_STUB_KEFF_STD", 0.004);
    let line_delay = Duration::from_millis(env_f64("AONP_STUB_LINE_DELAY_MS", 0.0) as u64);

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = writeln!(out, " ======================  solver-stub  ======================");
    let _ = writeln!(out, " Reading settings XML file...");
    let _ = writeln!(
        out,
        " Simulating {batches} batches ({inactive} inactive) of {particles} particles, seed {seed}"
    );

    // Deterministic per-batch wobble around the target keff so the output
    // looks like converging batch statistics.
    let mut state = seed as u64 ^ 0x9e37_79b9_7f4a_7c15;
    for batch in 1..=batches {
        state = state.wrapping_mul(6_364_136_223_846_793_005).wrapping_add(1);
        let wobble = ((state >> 33) as f64 / f64::from(u32::MAX) - 0.5) * 6.0 * keff_std;
        let tag = if batch <= inactive { "(inactive)" } else { "" };
        let _ = writeln!(out, " Bat./Gen. {batch:>5}    k = {:.5} {tag}", keff + wobble);
        let _ = out.flush();
        if !line_delay.is_zero() {
            thread::sleep(line_delay);
        }
    }
    let _ = writeln!(out, " Combined k-effective = {keff:.5} +/- {keff_std:.5}");

    if let Ok(line) = std::env::var("AONP_STUB_STDERR") {
        eprintln!("{line}");
    }
    if let Ok(code) = std::env::var("AONP_STUB_EXIT_CODE") {
        let code: i32 = code.parse().map_err(|_| "AONP_STUB_EXIT_CODE must be an integer")?;
        std::process::exit(code);
    }
    if std::env::var_os("AONP_STUB_SKIP_STATEPOINT").is_some() {
        return Ok(());
    }

    let mut datasets = BTreeMap::new();
    datasets.insert("keff/mean".to_string(), DatasetValue::F64(keff));
    datasets.insert("keff/std_dev".to_string(), DatasetValue::F64(keff_std));
    datasets.insert("n_batches".to_string(), DatasetValue::I64(i64::from(batches)));
    datasets.insert("n_inactive".to_string(), DatasetValue::I64(i64::from(inactive)));
    datasets.insert("n_particles".to_string(), DatasetValue::I64(particles));
    let statepoint_name = format!("statepoint.{batches}.h5");
    write_statepoint(Utf8Path::new(&statepoint_name), &Statepoint { datasets })
        .map_err(|e| format!("cannot write statepoint: {e}"))?;
    std::fs::write("summary.h5", b"solver-stub summary placeholder")
        .map_err(|e| format!("cannot write summary.h5: {e}"))?;
    let _ = writeln!(out, " Statepoint written to {statepoint_name}");
    Ok(())
}

/// Pull `<tag>value</tag>` out of the settings document.
fn tag_value<T: std::str::FromStr>(xml: &str, tag: &str) -> Result<T, String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open).ok_or_else(|| format!("settings.xml has no <{tag}>"))?
        + open.len();
    let end = xml[start..]
        .find(&close)
        .map(|offset| start + offset)
        .ok_or_else(|| format!("settings.xml has an unterminated <{tag}>"))?;
    xml[start..end]
        .trim()
        .parse()
        .map_err(|_| format!("settings.xml <{tag}> is not a number"))
}

fn env_f64(var: &str, default: f64) -> f64 {
    std::env::var(var).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}
