//! Solver subprocess lifecycle for the execute phase
//!
//! The solver runs with its working directory inside the bundle's
//! `inputs/`. Its stdout and stderr are consumed line-by-line: every line
//! goes to the run's log file, into the durable event log (batched), and
//! out on the live bus. The loop also owns the clocks of the execute
//! phase: lease renewal at a third of the TTL, a cancellation poll, and
//! the per-run wall-clock cap.

use std::collections::VecDeque;
use std::fs;
use std::io::Write as _;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::{Instant, MissedTickBehavior, interval, sleep_until};

use aonp_events::EventBus;
use aonp_store::{EventKind, LeaseOutcome, NewEvent, RunStore, StoreError};

use crate::SupervisorConfig;

/// Grace window between SIGTERM and SIGKILL.
pub const KILL_GRACE: Duration = Duration::from_secs(10);
/// Stderr lines retained for `error.detail`.
const STDERR_TAIL_LINES: usize = 40;
/// Stdout events buffered before a durable flush is forced.
const EVENT_FLUSH_LINES: usize = 16;
/// Upper bound on the latency of a durable stdout flush.
const EVENT_FLUSH_INTERVAL: Duration = Duration::from_millis(250);
/// Cancellation poll cadence while the solver runs.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// How the execute phase ended.
#[derive(Debug)]
pub(crate) enum ExecuteOutcome {
    /// Exit 0 with a statepoint harvested into `outputs/`.
    Completed { statepoint: Utf8PathBuf },
    /// Solver failed: non-zero exit, signal death, or no statepoint.
    SolverFailed { message: String, stderr_tail: String },
    /// Cancellation observed; child terminated.
    Cancelled,
    /// Wall-clock cap hit; child terminated.
    TimedOut { limit: Duration, stderr_tail: String },
    /// Lease renewal reported another owner; child terminated.
    LeaseLost,
    /// Store failure that exhausted the adapter's retries.
    Store(StoreError),
}

/// Drive the solver child for one claimed run.
pub(crate) async fn run_solver(
    store: &Arc<dyn RunStore>,
    bus: &EventBus,
    config: &SupervisorConfig,
    run_id: &str,
    worker_id: &str,
    bundle_root: &Utf8Path,
) -> ExecuteOutcome {
    let inputs = bundle_root.join("inputs");
    let outputs = bundle_root.join("outputs");
    let log_path = outputs.join("solver.log");
    let mut log = match fs::OpenOptions::new().create(true).append(true).open(log_path.as_std_path())
    {
        Ok(file) => file,
        Err(e) => {
            return ExecuteOutcome::SolverFailed {
                message: format!("cannot open solver log: {e}"),
                stderr_tail: String::new(),
            };
        }
    };

    let mut command = Command::new(&config.solver_cmd);
    command
        .current_dir(inputs.as_std_path())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if let Some(index) = &config.nuclear_data_index {
        command.env("AONP_NUCLEAR_DATA_INDEX", index.as_str());
    }
    // The operator's own OMP_NUM_THREADS wins; otherwise leave two cores
    // for the store and the event plumbing.
    if std::env::var_os("OMP_NUM_THREADS").is_none() {
        command.env("OMP_NUM_THREADS", config.effective_omp_threads().to_string());
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            return ExecuteOutcome::SolverFailed {
                message: format!("failed to spawn solver '{}': {e}", config.solver_cmd),
                stderr_tail: String::new(),
            };
        }
    };

    let mut stdout_lines =
        BufReader::new(child.stdout.take().expect("stdout was piped")).lines();
    let mut stderr_lines =
        BufReader::new(child.stderr.take().expect("stderr was piped")).lines();
    let mut stdout_done = false;
    let mut stderr_done = false;

    let mut stderr_tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
    let mut pending: Vec<NewEvent> = Vec::new();

    let mut renew_ticker = interval(config.renew_interval());
    renew_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    renew_ticker.reset(); // skip the immediate first tick
    let mut cancel_ticker = interval(CANCEL_POLL_INTERVAL);
    cancel_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut flush_ticker = interval(EVENT_FLUSH_INTERVAL);
    flush_ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let deadline = Instant::now() + config.max_runtime;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            line = stdout_lines.next_line(), if !stdout_done => match line {
                Ok(Some(line)) => {
                    let _ = writeln!(log, "{line}");
                    pending.push(stdout_event(&line, "stdout"));
                    if pending.len() >= EVENT_FLUSH_LINES
                        && let Err(e) = flush_events(store, bus, run_id, &mut pending).await
                    {
                        terminate(&mut child).await;
                        return ExecuteOutcome::Store(e);
                    }
                }
                Ok(None) => stdout_done = true,
                Err(e) => {
                    tracing::warn!(run_id, error = %e, "solver stdout read failed");
                    stdout_done = true;
                }
            },
            line = stderr_lines.next_line(), if !stderr_done => match line {
                Ok(Some(line)) => {
                    let _ = writeln!(log, "[stderr] {line}");
                    if stderr_tail.len() == STDERR_TAIL_LINES {
                        stderr_tail.pop_front();
                    }
                    stderr_tail.push_back(line.clone());
                    pending.push(stdout_event(&line, "stderr"));
                }
                Ok(None) => stderr_done = true,
                Err(e) => {
                    tracing::warn!(run_id, error = %e, "solver stderr read failed");
                    stderr_done = true;
                }
            },
            _ = flush_ticker.tick() => {
                if let Err(e) = flush_events(store, bus, run_id, &mut pending).await {
                    terminate(&mut child).await;
                    return ExecuteOutcome::Store(e);
                }
            }
            _ = renew_ticker.tick() => {
                match store.renew_lease(run_id, worker_id, config.lease_ttl).await {
                    Ok(LeaseOutcome::Renewed(event)) => bus.publish(&event),
                    Ok(LeaseOutcome::Stolen) => {
                        tracing::warn!(run_id, worker_id, "lease stolen; terminating solver");
                        terminate(&mut child).await;
                        return ExecuteOutcome::LeaseLost;
                    }
                    Err(e) => {
                        terminate(&mut child).await;
                        return ExecuteOutcome::Store(e);
                    }
                }
            }
            _ = cancel_ticker.tick() => {
                match store.get_run(run_id).await {
                    Ok(run) if run.cancel_requested => {
                        terminate(&mut child).await;
                        let _ = flush_events(store, bus, run_id, &mut pending).await;
                        return ExecuteOutcome::Cancelled;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        terminate(&mut child).await;
                        return ExecuteOutcome::Store(e);
                    }
                }
            }
            _ = sleep_until(deadline) => {
                terminate(&mut child).await;
                let _ = flush_events(store, bus, run_id, &mut pending).await;
                return ExecuteOutcome::TimedOut {
                    limit: config.max_runtime,
                    stderr_tail: tail_text(&stderr_tail),
                };
            }
        }
    }

    if let Err(e) = flush_events(store, bus, run_id, &mut pending).await {
        terminate(&mut child).await;
        return ExecuteOutcome::Store(e);
    }

    let status = match child.wait().await {
        Ok(status) => status,
        Err(e) => {
            return ExecuteOutcome::SolverFailed {
                message: format!("failed waiting for solver: {e}"),
                stderr_tail: tail_text(&stderr_tail),
            };
        }
    };

    if !status.success() {
        return ExecuteOutcome::SolverFailed {
            message: format!("solver exited with {status}"),
            stderr_tail: tail_text(&stderr_tail),
        };
    }

    match harvest_outputs(&inputs, &outputs) {
        Ok(Some(statepoint)) => ExecuteOutcome::Completed { statepoint },
        Ok(None) => ExecuteOutcome::SolverFailed {
            message: "solver exited cleanly but produced no statepoint".to_string(),
            stderr_tail: tail_text(&stderr_tail),
        },
        Err(e) => ExecuteOutcome::SolverFailed {
            message: format!("failed to harvest solver outputs: {e}"),
            stderr_tail: tail_text(&stderr_tail),
        },
    }
}

fn stdout_event(line: &str, stream: &str) -> NewEvent {
    NewEvent::core(
        EventKind::StdoutLine,
        serde_json::json!({ "line": line, "stream": stream }),
    )
}

/// Persist buffered line events and republish the stored records live.
async fn flush_events(
    store: &Arc<dyn RunStore>,
    bus: &EventBus,
    run_id: &str,
    pending: &mut Vec<NewEvent>,
) -> Result<(), StoreError> {
    if pending.is_empty() {
        return Ok(());
    }
    let batch = std::mem::take(pending);
    let records = store.append_events(run_id, &batch).await?;
    for record in &records {
        bus.publish(record);
    }
    Ok(())
}

/// Move solver products from `inputs/` to `outputs/` and pick the
/// statepoint of record (lexicographically last).
fn harvest_outputs(
    inputs: &Utf8Path,
    outputs: &Utf8Path,
) -> std::io::Result<Option<Utf8PathBuf>> {
    let mut statepoints = Vec::new();
    for entry in inputs.read_dir_utf8()? {
        let entry = entry?;
        let name = entry.file_name().to_string();
        let is_statepoint = name.starts_with("statepoint.") && name.ends_with(".h5");
        if is_statepoint || name == "summary.h5" {
            let target = outputs.join(&name);
            fs::rename(entry.path(), target.as_std_path())?;
            if is_statepoint {
                statepoints.push(target);
            }
        }
    }
    statepoints.sort();
    Ok(statepoints.pop())
}

/// SIGTERM, wait out the grace window, then SIGKILL.
pub(crate) async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        use nix::sys::signal::{Signal, kill};
        use nix::unistd::Pid;
        let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        if tokio::time::timeout(KILL_GRACE, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.start_kill();
    let _ = child.wait().await;
}

fn tail_text(tail: &VecDeque<String>) -> String {
    tail.iter().cloned().collect::<Vec<_>>().join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_harvest_picks_lexicographically_last_statepoint() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let inputs = root.join("inputs");
        let outputs = root.join("outputs");
        fs::create_dir(inputs.as_std_path()).unwrap();
        fs::create_dir(outputs.as_std_path()).unwrap();
        for name in ["statepoint.050.h5", "statepoint.120.h5", "summary.h5", "materials.xml"] {
            fs::write(inputs.join(name).as_std_path(), b"x").unwrap();
        }
        let picked = harvest_outputs(&inputs, &outputs).unwrap().unwrap();
        assert_eq!(picked, outputs.join("statepoint.120.h5"));
        assert!(outputs.join("statepoint.050.h5").is_file());
        assert!(outputs.join("summary.h5").is_file());
        assert!(inputs.join("materials.xml").is_file(), "solver inputs stay put");
        assert!(!inputs.join("summary.h5").exists());
    }

    #[test]
    fn test_harvest_with_no_statepoint_is_none() {
        let tmp = tempfile::tempdir().unwrap();
        let root = Utf8Path::from_path(tmp.path()).unwrap();
        let inputs = root.join("inputs");
        let outputs = root.join("outputs");
        fs::create_dir(inputs.as_std_path()).unwrap();
        fs::create_dir(outputs.as_std_path()).unwrap();
        fs::write(inputs.join("settings.xml").as_std_path(), b"x").unwrap();
        assert!(harvest_outputs(&inputs, &outputs).unwrap().is_none());
    }

    #[test]
    fn test_stderr_tail_text_joins_lines() {
        let mut tail = VecDeque::new();
        tail.push_back("warning: low statistics".to_string());
        tail.push_back("error: lost particle".to_string());
        assert_eq!(tail_text(&tail), "warning: low statistics\nerror: lost particle");
    }
}
