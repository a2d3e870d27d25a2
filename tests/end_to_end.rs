//! End-to-end scenarios against the stub solver
//!
//! These tests exercise the full path (submit, claim, bundle, solver
//! subprocess, extract, release) with the `solver-stub` binary standing
//! in for the real solver and a shell script standing in for the geometry
//! script.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use aonp::{Config, Core, Run, RunErrorKind, RunStatus};

const SOLVER_STUB: &str = env!("CARGO_BIN_EXE_solver-stub");

struct TestEnv {
    _tmp: TempDir,
    core: Core,
    geometry_script: Utf8PathBuf,
}

fn write_script(path: &Utf8Path, body: &str) {
    fs::write(path.as_std_path(), body).unwrap();
    fs::set_permissions(path.as_std_path(), fs::Permissions::from_mode(0o755)).unwrap();
}

/// Fresh store, runs root, and geometry script, with the solver pointed
/// at `solver_cmd`.
fn test_env(solver_cmd: &str) -> TestEnv {
    let tmp = TempDir::new().unwrap();
    let root = Utf8Path::from_path(tmp.path()).unwrap().to_path_buf();

    let geometry_script = root.join("geom.sh");
    write_script(
        &geometry_script,
        "#!/bin/sh\ncat > /dev/null\nprintf '<geometry><cell id=\"1\"/></geometry>\\n' > \"$2\"\n",
    );

    let config = Config {
        runs_root: root.join("runs"),
        store_uri: root.join("store.db").to_string(),
        db_name: "aonp".to_string(),
        nuclear_data_index: None,
        worker_id: "itest-worker".to_string(),
        lease_ttl: Duration::from_secs(60),
        max_runtime: Duration::from_secs(60),
        solver_cmd: solver_cmd.to_string(),
    };
    let core = Core::open(config).unwrap();
    TestEnv { _tmp: tmp, core, geometry_script }
}

fn pincell_yaml(geometry_script: &Utf8Path) -> String {
    format!(
        r#"
name: pincell
materials:
  fuel:
    density: 10.4
    density_units: g/cm3
    temperature: 900.0
    nuclides:
      - {{ name: U235, fraction: 0.03, fraction_type: atom }}
      - {{ name: U238, fraction: 0.27, fraction_type: atom }}
      - {{ name: O16, fraction: 0.70, fraction_type: atom }}
  moderator:
    density: 1.0
    density_units: g/cm3
    temperature: 600.0
    nuclides:
      - {{ name: H1, fraction: 0.6667, fraction_type: atom }}
      - {{ name: O16, fraction: 0.3333, fraction_type: atom }}
geometry:
  type: script
  path: {geometry_script}
  entry: build
settings:
  batches: 120
  inactive: 20
  particles: 10000
  seed: 42
nuclear_data:
  library: endfb-viii.0-hdf5
  cross_sections: /data/endfb80/cross_sections.xml
"#
    )
}

/// The same study, reordered and reformatted: must hash identically.
fn pincell_yaml_reformatted(geometry_script: &Utf8Path) -> String {
    format!(
        r#"
# pin-cell regression study
settings:
  seed: 42
  particles: 10000
  inactive: 20
  batches: 120
nuclear_data:
  cross_sections: /data/endfb80/cross_sections.xml
  library: endfb-viii.0-hdf5
name: pincell
geometry:
  entry: build
  path: {geometry_script}
  type: script
materials:
  moderator:
    temperature: 600.0
    density_units: g/cm3
    density: 1.0
    nuclides:
      - {{ name: H1,  fraction: 0.6667, fraction_type: atom }}
      - {{ name: O16, fraction: 0.3333, fraction_type: atom }}
  fuel:
    nuclides:
      - {{ name: U235, fraction: 0.03, fraction_type: atom }}
      - {{ name: U238, fraction: 0.27, fraction_type: atom }}
      - {{ name: O16,  fraction: 0.70, fraction_type: atom }}
    temperature: 900.0
    density_units: g/cm3
    density: 10.4
"#
    )
}

async fn wait_terminal(core: &Core, run_id: &str, timeout: Duration) -> Run {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let run = core.get_run(run_id).await.unwrap();
        if run.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} still {:?}/{:?} after {timeout:?}",
            run.status,
            run.phase
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[tokio::test]
async fn test_pincell_study_runs_to_success() {
    let env = test_env(SOLVER_STUB);

    // Two submissions of the same content in different formatting: same
    // study, two distinct runs.
    let first = env
        .core
        .submit_study_yaml(&pincell_yaml(&env.geometry_script))
        .await
        .unwrap();
    let second = env
        .core
        .submit_study_yaml(&pincell_yaml_reformatted(&env.geometry_script))
        .await
        .unwrap();
    assert_eq!(first.spec_hash, second.spec_hash, "formatting must not change the hash");
    assert_ne!(first.run_id, second.run_id, "every submission is a fresh run");

    let workers = env.core.start_workers(2);
    let run_a = wait_terminal(&env.core, &first.run_id, Duration::from_secs(60)).await;
    let run_b = wait_terminal(&env.core, &second.run_id, Duration::from_secs(60)).await;
    workers.shutdown().await;

    for run in [&run_a, &run_b] {
        assert_eq!(run.status, RunStatus::Succeeded, "error: {:?}", run.error);
        let bundle = run.artifacts.bundle_path.as_ref().unwrap();
        assert!(bundle.join("study_spec.json").is_file());
        assert!(bundle.join("inputs/geometry.xml").is_file());
        assert!(run.artifacts.statepoint_path.as_ref().unwrap().is_file());
        assert!(run.artifacts.summary_path.as_ref().unwrap().is_file());

        let summary = env.core.get_summary(&run.run_id).await.unwrap().unwrap();
        assert!(
            (1.5..=1.7).contains(&summary.keff),
            "keff {} outside the expected window",
            summary.keff
        );
        assert!(summary.keff_std <= 0.01);
        assert!((summary.keff_uncertainty_pcm - summary.keff_std * 1e5).abs() < 1e-9);
        assert_eq!(summary.n_batches, 120);
        assert_eq!(summary.n_particles, 10_000);
    }

    // The two bundles carry byte-identical canonical specs.
    let spec_a = fs::read(
        run_a.artifacts.bundle_path.as_ref().unwrap().join("study_spec.json").as_std_path(),
    )
    .unwrap();
    let spec_b = fs::read(
        run_b.artifacts.bundle_path.as_ref().unwrap().join("study_spec.json").as_std_path(),
    )
    .unwrap();
    assert_eq!(spec_a, spec_b);
}

#[tokio::test]
async fn test_event_stream_order() {
    let env = test_env(SOLVER_STUB);
    let receipt = env
        .core
        .submit_study_yaml(&pincell_yaml(&env.geometry_script))
        .await
        .unwrap();

    // Subscribe before any worker exists so the stream sees the whole
    // lifecycle.
    let stream = env.core.stream_run(&receipt.run_id).await.unwrap();
    let workers = env.core.start_workers(1);

    let events = tokio::time::timeout(Duration::from_secs(60), stream.collect())
        .await
        .expect("stream must terminate");
    workers.shutdown().await;

    let kinds: Vec<&str> = events.iter().map(|e| e.kind.as_str()).collect();
    let expected = [
        "run_created",
        "run_claimed",
        "phase_changed",
        "stdout_line",
        "phase_changed",
        "summary_extracted",
        "run_released",
        "stream_end",
    ];
    let mut cursor = 0;
    for kind in &kinds {
        if cursor < expected.len() && *kind == expected[cursor] {
            cursor += 1;
        }
    }
    assert_eq!(
        cursor,
        expected.len(),
        "expected lifecycle subsequence {expected:?} within {kinds:?}"
    );
    assert!(
        events.iter().filter(|e| e.kind == "stdout_line").count() >= 100,
        "one stdout_line per solver batch"
    );

    // Timestamps of durable events are strictly monotone.
    let stored: Vec<_> = events.iter().filter(|e| e.seq.is_some()).collect();
    for pair in stored.windows(2) {
        assert!(pair[0].ts < pair[1].ts, "event timestamps must be strictly monotone");
    }

    // The phase_changed events walk execute then extract.
    let phases: Vec<&str> = events
        .iter()
        .filter(|e| e.kind == "phase_changed")
        .filter_map(|e| e.payload["phase"].as_str())
        .collect();
    assert_eq!(phases, vec!["execute", "extract"]);
}

#[tokio::test]
async fn test_cancellation_kills_solver() {
    // Wrapper slows the stub down to one line every 200ms so there is
    // time to cancel mid-execute.
    let tmp_env = test_env("placeholder");
    let slow = tmp_env.geometry_script.parent().unwrap().join("slow-solver.sh");
    write_script(
        &slow,
        &format!("#!/bin/sh\nAONP_STUB_LINE_DELAY_MS=200 exec '{SOLVER_STUB}'\n"),
    );
    let mut config = tmp_env.core.config().clone();
    config.solver_cmd = slow.to_string();
    let core = Core::open(config).unwrap();

    let receipt = core
        .submit_study_yaml(&pincell_yaml(&tmp_env.geometry_script))
        .await
        .unwrap();
    let workers = core.start_workers(1);

    // Let the solver get going before cancelling.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(30);
    loop {
        let run = core.get_run(&receipt.run_id).await.unwrap();
        if run.status == RunStatus::Running && run.artifacts.bundle_path.is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "run never started executing");
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    core.cancel_run(&receipt.run_id).await.unwrap();

    let run = wait_terminal(&core, &receipt.run_id, Duration::from_secs(30)).await;
    workers.shutdown().await;

    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.error.as_ref().unwrap().kind, RunErrorKind::Cancelled);
    assert!(core.get_summary(&receipt.run_id).await.unwrap().is_none(), "no summary");

    // A late subscriber still gets a finite stream ending in stream_end.
    let events = core.stream_run(&receipt.run_id).await.unwrap().collect().await;
    assert_eq!(events.last().unwrap().kind, "stream_end");
}

#[tokio::test]
async fn test_dead_worker_lease_is_recovered() {
    let env = test_env(SOLVER_STUB);
    let receipt = env
        .core
        .submit_study_yaml(&pincell_yaml(&env.geometry_script))
        .await
        .unwrap();

    // A worker claims the run and dies without ever renewing: simulated
    // by claiming with an already-expired lease.
    let claimed = env
        .core
        .store()
        .claim_next("w-dead", Duration::ZERO)
        .await
        .unwrap()
        .expect("the queued run must be claimable");
    assert_eq!(claimed.0.attempt, 1);

    // A live worker picks the expired claim back up and finishes it.
    let workers = env.core.start_workers(1);
    let run = wait_terminal(&env.core, &receipt.run_id, Duration::from_secs(60)).await;
    workers.shutdown().await;

    assert_eq!(run.status, RunStatus::Succeeded, "error: {:?}", run.error);
    assert!(run.attempt >= 2, "recovery must be a distinguishable attempt");
    assert!(env.core.get_summary(&receipt.run_id).await.unwrap().is_some());
}

#[tokio::test]
async fn test_solver_failure_carries_stderr_tail() {
    let tmp_env = test_env("placeholder");
    let failing = tmp_env.geometry_script.parent().unwrap().join("failing-solver.sh");
    write_script(
        &failing,
        &format!(
            "#!/bin/sh\nAONP_STUB_EXIT_CODE=2 \
             AONP_STUB_STDERR='FATAL: no cross sections at /data/endfb80' \
             exec '{SOLVER_STUB}'\n"
        ),
    );
    let mut config = tmp_env.core.config().clone();
    config.solver_cmd = failing.to_string();
    let core = Core::open(config).unwrap();

    let receipt = core
        .submit_study_yaml(&pincell_yaml(&tmp_env.geometry_script))
        .await
        .unwrap();
    let workers = core.start_workers(1);
    let run = wait_terminal(&core, &receipt.run_id, Duration::from_secs(60)).await;
    workers.shutdown().await;

    assert_eq!(run.status, RunStatus::Failed);
    let error = run.error.unwrap();
    assert_eq!(error.kind, RunErrorKind::Solver);
    assert!(
        error.detail.unwrap().contains("no cross sections"),
        "stderr tail must reach error.detail"
    );
}
