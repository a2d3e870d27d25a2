//! Execution supervision for claimed runs
//!
//! A [`Supervisor`] drives one claimed run through its phases (bundle,
//! execute, extract) and converts every failure into a terminal release
//! plus a final event. Phases return values, never panics or bare early
//! exits, so no code path can leave a run without its audit trail. The
//! one deliberate exception is a lost lease: the new claimer owns the run
//! and its event stream, so the old supervisor walks away silently.

mod solver;

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8PathBuf;

use aonp_bundle::{BundleError, create_bundle};
use aonp_events::EventBus;
use aonp_extract::ExtractError;
use aonp_spec::StudySpec;
use aonp_store::{
    ArtifactsDelta, PhaseUpdate, ReleaseOutcome, ReleaseRequest, Run, RunError, RunErrorKind,
    RunPhase, RunStatus, RunStore, StoreError,
};

pub use solver::KILL_GRACE;
use solver::ExecuteOutcome;

/// Static configuration a supervisor needs to run solvers.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Root of the bundle tree.
    pub runs_root: Utf8PathBuf,
    /// Solver executable invoked for the execute phase.
    pub solver_cmd: String,
    /// Cross-sections index passed to the solver environment.
    pub nuclear_data_index: Option<Utf8PathBuf>,
    /// Claim lease TTL; renewed at a third of this.
    pub lease_ttl: Duration,
    /// Per-run wall-clock cap for the solver child.
    pub max_runtime: Duration,
    /// Explicit solver thread count; derived from the host when absent.
    pub omp_threads: Option<usize>,
}

impl SupervisorConfig {
    /// Lease renewal cadence.
    #[must_use]
    pub fn renew_interval(&self) -> Duration {
        (self.lease_ttl / 3).max(Duration::from_millis(100))
    }

    /// Solver thread count: the configured value, or all host cores minus
    /// two, floored at one.
    #[must_use]
    pub fn effective_omp_threads(&self) -> usize {
        self.omp_threads.unwrap_or_else(|| num_cpus::get().saturating_sub(2).max(1))
    }
}

/// How a supervision pass ended.
#[derive(Debug, PartialEq, Eq)]
pub enum SupervisionOutcome {
    /// Run released as succeeded with a summary in the store.
    Succeeded,
    /// Run released as failed with the given error kind.
    Failed(RunErrorKind),
    /// Ownership moved to another worker; nothing was released.
    LeaseLost,
}

/// Interrupts that short-circuit the phase chain.
enum Interrupt {
    Fail(RunError),
    Cancelled,
    LeaseLost,
    Store(StoreError),
}

impl From<StoreError> for Interrupt {
    fn from(e: StoreError) -> Self {
        Self::Store(e)
    }
}

/// Drives claimed runs to a terminal state.
pub struct Supervisor {
    store: Arc<dyn RunStore>,
    bus: EventBus,
    config: SupervisorConfig,
}

impl Supervisor {
    /// Build a supervisor over the given store and bus.
    #[must_use]
    pub fn new(store: Arc<dyn RunStore>, bus: EventBus, config: SupervisorConfig) -> Self {
        Self { store, bus, config }
    }

    /// Drive one claimed run to a terminal state (or walk away on a lost
    /// lease). `run` must have been claimed by `worker_id`; a re-claimed
    /// run resumes from whatever phase the previous owner reached.
    pub async fn supervise(&self, run: Run, worker_id: &str) -> SupervisionOutcome {
        let run_id = run.run_id.clone();
        let result = self.drive(run, worker_id).await;
        match result {
            Ok(()) => SupervisionOutcome::Succeeded,
            Err(Interrupt::Fail(error)) => {
                let kind = error.kind;
                self.finalize_failed(&run_id, worker_id, error).await;
                SupervisionOutcome::Failed(kind)
            }
            Err(Interrupt::Cancelled) => {
                let error = RunError::new(RunErrorKind::Cancelled, "cancelled by request");
                self.finalize_failed(&run_id, worker_id, error).await;
                SupervisionOutcome::Failed(RunErrorKind::Cancelled)
            }
            Err(Interrupt::LeaseLost) => SupervisionOutcome::LeaseLost,
            Err(Interrupt::Store(e)) => {
                tracing::error!(run_id = %run_id, error = %e, "store failure during supervision");
                let error = RunError::new(RunErrorKind::Store, "durable store unavailable")
                    .with_detail(e.to_string());
                self.finalize_failed(&run_id, worker_id, error).await;
                SupervisionOutcome::Failed(RunErrorKind::Store)
            }
        }
    }

    async fn drive(&self, mut run: Run, worker_id: &str) -> Result<(), Interrupt> {
        self.check_cancel(&run.run_id).await?;

        if run.phase == RunPhase::Bundle {
            run = self.phase_bundle(run).await?;
            self.check_cancel(&run.run_id).await?;
        }
        if run.phase == RunPhase::Execute {
            run = self.phase_execute(run, worker_id).await?;
            self.check_cancel(&run.run_id).await?;
        }
        debug_assert_eq!(run.phase, RunPhase::Extract);
        self.phase_extract(run, worker_id).await
    }

    /// Cooperative cancellation check at a phase boundary.
    async fn check_cancel(&self, run_id: &str) -> Result<(), Interrupt> {
        let run = self.store.get_run(run_id).await?;
        if run.cancel_requested { Err(Interrupt::Cancelled) } else { Ok(()) }
    }

    async fn phase_bundle(&self, run: Run) -> Result<Run, Interrupt> {
        let study = self.store.get_study(&run.spec_hash).await?;
        let spec = parse_canonical_spec(&study.canonical_spec).map_err(Interrupt::Fail)?;

        let paths = self.bundle_blocking(&spec, &run.run_id).await?;
        let (run, event) = self
            .store
            .update_run_phase(
                &run.run_id,
                PhaseUpdate {
                    phase: RunPhase::Execute,
                    artifacts: ArtifactsDelta {
                        bundle_path: Some(paths.root),
                        ..ArtifactsDelta::default()
                    },
                },
            )
            .await?;
        self.bus.publish(&event);
        Ok(run)
    }

    /// Run the bundler off the async executor. The claim holder owns the
    /// bundle directory exclusively, so a conflicting directory is a
    /// leftover from a crashed previous attempt: it is removed and
    /// bundling retried once.
    async fn bundle_blocking(
        &self,
        spec: &StudySpec,
        run_id: &str,
    ) -> Result<aonp_bundle::BundlePaths, Interrupt> {
        match self.bundle_once(spec, run_id).await? {
            Ok(paths) => Ok(paths),
            Err(BundleError::Conflict { path }) => {
                tracing::warn!(run_id, bundle = %path, "removing stale bundle from earlier attempt");
                if let Err(e) = std::fs::remove_dir_all(path.as_std_path()) {
                    return Err(Interrupt::Fail(
                        RunError::new(RunErrorKind::Bundle, "cannot remove stale bundle")
                            .with_detail(e.to_string()),
                    ));
                }
                self.bundle_once(spec, run_id)
                    .await?
                    .map_err(|e| Interrupt::Fail(bundle_run_error(&e)))
            }
            Err(e) => Err(Interrupt::Fail(bundle_run_error(&e))),
        }
    }

    async fn bundle_once(
        &self,
        spec: &StudySpec,
        run_id: &str,
    ) -> Result<Result<aonp_bundle::BundlePaths, BundleError>, Interrupt> {
        let spec = spec.clone();
        let run_id = run_id.to_string();
        let runs_root = self.config.runs_root.clone();
        tokio::task::spawn_blocking(move || create_bundle(&spec, &run_id, &runs_root))
            .await
            .map_err(|e| {
                Interrupt::Fail(
                    RunError::new(RunErrorKind::Bundle, "bundler task failed")
                        .with_detail(e.to_string()),
                )
            })
    }

    async fn phase_execute(&self, run: Run, worker_id: &str) -> Result<Run, Interrupt> {
        let bundle_root = run.artifacts.bundle_path.clone().ok_or_else(|| {
            Interrupt::Fail(RunError::new(
                RunErrorKind::Bundle,
                "run reached execute phase without a bundle",
            ))
        })?;

        let outcome = solver::run_solver(
            &self.store,
            &self.bus,
            &self.config,
            &run.run_id,
            worker_id,
            &bundle_root,
        )
        .await;

        match outcome {
            ExecuteOutcome::Completed { statepoint } => {
                let (run, event) = self
                    .store
                    .update_run_phase(
                        &run.run_id,
                        PhaseUpdate {
                            phase: RunPhase::Extract,
                            artifacts: ArtifactsDelta {
                                statepoint_path: Some(statepoint),
                                ..ArtifactsDelta::default()
                            },
                        },
                    )
                    .await?;
                self.bus.publish(&event);
                Ok(run)
            }
            ExecuteOutcome::SolverFailed { message, stderr_tail } => {
                let mut error = RunError::new(RunErrorKind::Solver, message);
                if !stderr_tail.is_empty() {
                    error = error.with_detail(stderr_tail);
                }
                Err(Interrupt::Fail(error))
            }
            ExecuteOutcome::TimedOut { limit, stderr_tail } => {
                let mut error = RunError::new(
                    RunErrorKind::Solver,
                    format!("solver exceeded the {}s wall-clock limit", limit.as_secs()),
                );
                if !stderr_tail.is_empty() {
                    error = error.with_detail(stderr_tail);
                }
                Err(Interrupt::Fail(error))
            }
            ExecuteOutcome::Cancelled => Err(Interrupt::Cancelled),
            ExecuteOutcome::LeaseLost => Err(Interrupt::LeaseLost),
            ExecuteOutcome::Store(e) => Err(Interrupt::Store(e)),
        }
    }

    async fn phase_extract(&self, run: Run, worker_id: &str) -> Result<(), Interrupt> {
        let statepoint = run.artifacts.statepoint_path.clone().ok_or_else(|| {
            Interrupt::Fail(RunError::new(
                RunErrorKind::Extract,
                "run reached extract phase without a statepoint",
            ))
        })?;
        let bundle_root = run.artifacts.bundle_path.clone().ok_or_else(|| {
            Interrupt::Fail(RunError::new(
                RunErrorKind::Extract,
                "run reached extract phase without a bundle",
            ))
        })?;
        let outputs = bundle_root.join("outputs");

        let extract_result = tokio::task::spawn_blocking({
            let statepoint = statepoint.clone();
            let outputs = outputs.clone();
            move || aonp_extract::extract_summary(&statepoint, &outputs)
        })
        .await
        .map_err(|e| {
            Interrupt::Fail(
                RunError::new(RunErrorKind::Extract, "extractor task failed")
                    .with_detail(e.to_string()),
            )
        })?;

        let (fields, summary_path) =
            extract_result.map_err(|e| Interrupt::Fail(extract_run_error(&e)))?;

        match self.store.insert_summary(&run.run_id, &fields).await {
            Ok((_, event)) => self.bus.publish(&event),
            // A previous owner extracted before losing its lease; the
            // summary is already durable.
            Err(StoreError::Conflict { .. }) => {
                tracing::debug!(run_id = %run.run_id, "summary already present, keeping it");
            }
            Err(e) => return Err(Interrupt::Store(e)),
        }

        let request = ReleaseRequest {
            status: RunStatus::Succeeded,
            error: None,
            artifacts: ArtifactsDelta {
                summary_path: Some(summary_path),
                ..ArtifactsDelta::default()
            },
        };
        match self.store.release(&run.run_id, worker_id, request).await? {
            ReleaseOutcome::Released(_, event) => {
                self.bus.publish(&event);
                self.bus.finish_run(&run.run_id);
                Ok(())
            }
            ReleaseOutcome::Stolen => Err(Interrupt::LeaseLost),
        }
    }

    /// Terminal release for every failure path. A stolen release means
    /// the new owner has the run; nothing further to do here.
    async fn finalize_failed(&self, run_id: &str, worker_id: &str, error: RunError) {
        let request = ReleaseRequest {
            status: RunStatus::Failed,
            error: Some(error),
            artifacts: ArtifactsDelta::default(),
        };
        match self.store.release(run_id, worker_id, request).await {
            Ok(ReleaseOutcome::Released(_, event)) => {
                self.bus.publish(&event);
                self.bus.finish_run(run_id);
            }
            Ok(ReleaseOutcome::Stolen) => {
                tracing::warn!(run_id, worker_id, "release lost to another claimer");
            }
            Err(e) => {
                // The lease will expire and another worker will retry.
                tracing::error!(run_id, error = %e, "failed to release run");
            }
        }
    }
}

fn parse_canonical_spec(canonical: &str) -> Result<StudySpec, RunError> {
    let value: serde_json::Value = serde_json::from_str(canonical).map_err(|e| {
        RunError::new(RunErrorKind::Store, "stored canonical spec is not JSON")
            .with_detail(e.to_string())
    })?;
    aonp_spec::parse_json(&value).map_err(|e| {
        RunError::new(RunErrorKind::Store, "stored canonical spec failed validation")
            .with_detail(e.to_string())
    })
}

fn bundle_run_error(error: &BundleError) -> RunError {
    let mut run_error = RunError::new(RunErrorKind::Bundle, error.to_string());
    if let BundleError::GeometryScript { stderr_tail: Some(tail), .. } = error {
        run_error = run_error.with_detail(tail.clone());
    }
    run_error
}

fn extract_run_error(error: &ExtractError) -> RunError {
    RunError::new(RunErrorKind::Extract, error.to_string())
}
