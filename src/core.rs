//! The `Core` handle
//!
//! One value owns everything the external collaborators need: the durable
//! store, the live event bus, and the resolved configuration. There is no
//! process-wide state; background tasks (workers, reaper) get clones of
//! the same handles and a shared shutdown signal with a defined
//! startup/shutdown lifecycle.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use aonp_events::{EventBus, EventStream};
use aonp_sched::{Reaper, WorkerLoop, shutdown_channel};
use aonp_spec::{SpecHash, StudySpec, ValidationError, canonical_bytes, spec_hash};
use aonp_store::{
    CancelOutcome, Run, RunFilter, RunStore, SqliteRunStore, StoreError, Summary,
};
use aonp_supervisor::Supervisor;

use crate::config::Config;

/// Synchronous answer to a study submission.
#[derive(Debug, Clone, Serialize)]
pub struct SubmitReceipt {
    /// Fresh run identifier; unique per submission.
    pub run_id: String,
    /// Content hash of the study; shared by equivalent submissions.
    pub spec_hash: SpecHash,
    /// Always `"queued"`.
    pub status: &'static str,
}

/// Submission failures.
///
/// Validation errors are returned to the submitter synchronously and
/// leave no trace in the store.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    /// The spec was rejected; nothing was persisted.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The store could not record the study or run.
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Handles for a started worker fleet.
pub struct WorkerSet {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl WorkerSet {
    /// Signal shutdown and wait for every loop to stop.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

/// Owner of the store, the bus, and the configuration.
#[derive(Clone)]
pub struct Core {
    store: Arc<dyn RunStore>,
    bus: EventBus,
    config: Config,
}

impl Core {
    /// Open the configured store and build the core handle.
    ///
    /// # Errors
    ///
    /// `StoreError` when the store location is unusable.
    pub fn open(config: Config) -> Result<Self, StoreError> {
        let store: Arc<dyn RunStore> =
            Arc::new(SqliteRunStore::open(&config.store_uri, &config.db_name)?);
        Ok(Self::with_store(config, store))
    }

    /// Build a core over an existing store adapter.
    #[must_use]
    pub fn with_store(config: Config, store: Arc<dyn RunStore>) -> Self {
        let bus = EventBus::new(Arc::clone(&store));
        Self { store, bus, config }
    }

    /// The durable store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn RunStore> {
        &self.store
    }

    /// The live event bus.
    #[must_use]
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// The resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Validate a raw JSON tree, record the study (idempotently) and a
    /// fresh queued run.
    ///
    /// Submitting equivalent content twice yields two distinct runs with
    /// the same `spec_hash`.
    ///
    /// # Errors
    ///
    /// [`SubmitError::Validation`] for rejected specs (nothing persisted),
    /// [`SubmitError::Store`] for store failures.
    pub async fn submit_study(
        &self,
        raw: &serde_json::Value,
    ) -> Result<SubmitReceipt, SubmitError> {
        let spec = aonp_spec::parse_json(raw)?;
        self.submit_spec(&spec).await
    }

    /// [`Core::submit_study`] for YAML text.
    ///
    /// # Errors
    ///
    /// Same as [`Core::submit_study`].
    pub async fn submit_study_yaml(&self, text: &str) -> Result<SubmitReceipt, SubmitError> {
        let spec = aonp_spec::parse_yaml(text)?;
        self.submit_spec(&spec).await
    }

    async fn submit_spec(&self, spec: &StudySpec) -> Result<SubmitReceipt, SubmitError> {
        let hash = spec_hash(spec);
        let canonical = String::from_utf8(canonical_bytes(spec))
            .expect("canonical bytes are UTF-8 JSON");
        self.store.upsert_study(hash.as_str(), &canonical).await?;

        let run_id = Uuid::new_v4().to_string();
        let (run, event) = self.store.create_run(&run_id, hash.as_str()).await?;
        self.bus.publish(&event);
        tracing::info!(run_id = %run.run_id, spec_hash = %hash, "study submitted");
        Ok(SubmitReceipt { run_id: run.run_id, spec_hash: hash, status: "queued" })
    }

    /// Fetch a run.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown ids.
    pub async fn get_run(&self, run_id: &str) -> Result<Run, StoreError> {
        self.store.get_run(run_id).await
    }

    /// Fetch a run's summary, if extracted.
    ///
    /// # Errors
    ///
    /// Store failures only; an absent summary is `Ok(None)`.
    pub async fn get_summary(&self, run_id: &str) -> Result<Option<Summary>, StoreError> {
        self.store.get_summary(run_id).await
    }

    /// List runs matching a filter, newest first.
    ///
    /// # Errors
    ///
    /// Store failures.
    pub async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError> {
        self.store.list_runs(filter).await
    }

    /// Subscribe to a run's event stream (replay + live, SSE-compatible
    /// framing).
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs.
    pub async fn stream_run(&self, run_id: &str) -> Result<EventStream, StoreError> {
        self.bus.subscribe(run_id).await
    }

    /// Request cooperative cancellation of a run.
    ///
    /// # Errors
    ///
    /// `NotFound` for unknown runs.
    pub async fn cancel_run(&self, run_id: &str) -> Result<CancelOutcome, StoreError> {
        let outcome = self.store.request_cancel(run_id).await?;
        if let CancelOutcome::Requested(event) = &outcome {
            self.bus.publish(event);
        }
        Ok(outcome)
    }

    /// Start `worker_count` claim loops plus the lease reaper.
    ///
    /// Worker identities derive from the configured worker id with a
    /// per-loop suffix so claims stay distinguishable.
    #[must_use]
    pub fn start_workers(&self, worker_count: usize) -> WorkerSet {
        let (tx, rx) = shutdown_channel();
        let supervisor = Arc::new(Supervisor::new(
            Arc::clone(&self.store),
            self.bus.clone(),
            self.config.supervisor_config(),
        ));

        let mut handles = Vec::with_capacity(worker_count + 1);
        for index in 0..worker_count {
            let worker_id = if worker_count == 1 {
                self.config.worker_id.clone()
            } else {
                format!("{}-{index}", self.config.worker_id)
            };
            let worker = WorkerLoop::new(
                Arc::clone(&self.store),
                self.bus.clone(),
                Arc::clone(&supervisor),
                worker_id,
                self.config.lease_ttl,
                rx.clone(),
            );
            handles.push(tokio::spawn(worker.run()));
        }
        let reaper = Reaper::new(Arc::clone(&self.store), self.bus.clone(), rx);
        handles.push(tokio::spawn(reaper.run()));

        WorkerSet { shutdown: tx, handles }
    }
}
