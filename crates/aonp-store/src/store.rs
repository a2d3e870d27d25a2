//! The `RunStore` adapter contract
//!
//! Every mutating operation that corresponds to a run state transition
//! appends its audit [`EventRecord`] in the same atomic step and returns
//! it, so callers can republish the exact persisted event on the live bus
//! without a second read.

use std::time::Duration;

use async_trait::async_trait;

use crate::entities::{
    AgentOutput, ArtifactsDelta, EventQuery, EventRecord, NewEvent, Run, RunError, RunFilter,
    RunPhase, RunStatus, Study, Summary, SummaryFields,
};
use crate::error::StoreError;

/// Phase progression request for a running run.
///
/// Claiming and terminating own the status/lease fields, so this update
/// only moves `phase` forward and merges artifacts; attaching an error
/// here records context without terminating (termination goes through
/// [`RunStore::release`]).
#[derive(Debug, Clone)]
pub struct PhaseUpdate {
    /// Phase to move to; must be the direct successor of the current one.
    pub phase: RunPhase,
    /// Artifact paths to merge.
    pub artifacts: ArtifactsDelta,
}

/// Result of a lease renewal attempt.
#[derive(Debug)]
pub enum LeaseOutcome {
    /// Lease extended; carries the persisted `lease_renewed` event.
    Renewed(EventRecord),
    /// The run is no longer owned by the renewing worker.
    Stolen,
}

/// Terminal outcome a worker reports through [`RunStore::release`].
#[derive(Debug, Clone)]
pub struct ReleaseRequest {
    /// Terminal status; must be `Succeeded` or `Failed`.
    pub status: RunStatus,
    /// Structured error for failed runs.
    pub error: Option<RunError>,
    /// Last artifact paths to merge before the run freezes.
    pub artifacts: ArtifactsDelta,
}

/// Result of a release attempt.
#[derive(Debug)]
pub enum ReleaseOutcome {
    /// Run terminated; carries the final state and the persisted
    /// `run_released` event.
    Released(Box<Run>, EventRecord),
    /// The run is no longer owned by the releasing worker.
    Stolen,
}

/// Result of a cancellation request.
#[derive(Debug)]
pub enum CancelOutcome {
    /// Flag set; carries the persisted `cancel_requested` event.
    Requested(EventRecord),
    /// The run had already reached a terminal status.
    AlreadyTerminal,
}

/// Durable store for studies, runs, summaries, events, and agent outputs.
///
/// # Atomicity
///
/// `claim_next`, `renew_lease`, `release`, and `update_run_phase` MUST be
/// single compare-and-set steps against the backend: two concurrent
/// `claim_next` calls observing the same ready run must resolve to exactly
/// one winner. Operations on a single run are linearizable through these
/// CAS semantics.
///
/// # Timestamps
///
/// The adapter assigns every instant. Event timestamps are strictly
/// monotone per run.
#[async_trait]
pub trait RunStore: Send + Sync {
    /// Insert-if-absent on `spec_hash`; returns the existing record on
    /// collision. Idempotent, emits no event.
    async fn upsert_study(&self, spec_hash: &str, canonical_spec: &str)
    -> Result<Study, StoreError>;

    /// Fetch a study by content hash.
    async fn get_study(&self, spec_hash: &str) -> Result<Study, StoreError>;

    /// Create a queued run for an existing study. Emits `run_created`.
    ///
    /// # Errors
    ///
    /// `Conflict` if `run_id` already exists, `NotFound` if the study does
    /// not.
    async fn create_run(&self, run_id: &str, spec_hash: &str)
    -> Result<(Run, EventRecord), StoreError>;

    /// Fetch a run by id.
    async fn get_run(&self, run_id: &str) -> Result<Run, StoreError>;

    /// List runs matching a filter, newest first.
    async fn list_runs(&self, filter: &RunFilter) -> Result<Vec<Run>, StoreError>;

    /// Advance a running run's phase and/or merge artifacts. Emits
    /// `phase_changed` when the phase moves.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` when the run is not running or the phase step
    /// is not the direct successor.
    async fn update_run_phase(
        &self,
        run_id: &str,
        update: PhaseUpdate,
    ) -> Result<(Run, EventRecord), StoreError>;

    /// Insert the summary for a run. Emits `summary_extracted`.
    ///
    /// # Errors
    ///
    /// `Conflict` on a duplicate per-run summary.
    async fn insert_summary(
        &self,
        run_id: &str,
        fields: &SummaryFields,
    ) -> Result<(Summary, EventRecord), StoreError>;

    /// Fetch the summary of a run, if extracted.
    async fn get_summary(&self, run_id: &str) -> Result<Option<Summary>, StoreError>;

    /// Append a batch of events in order, in one atomic step.
    async fn append_events(
        &self,
        run_id: &str,
        events: &[NewEvent],
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Read a run's events in append order.
    async fn get_events(
        &self,
        run_id: &str,
        query: &EventQuery,
    ) -> Result<Vec<EventRecord>, StoreError>;

    /// Attach an opaque collaborator record to a run.
    async fn insert_agent_output(
        &self,
        run_id: &str,
        agent: &str,
        kind: &str,
        data: serde_json::Value,
        schema_version: u32,
    ) -> Result<AgentOutput, StoreError>;

    /// Read a run's collaborator records in append order.
    async fn get_agent_outputs(&self, run_id: &str) -> Result<Vec<AgentOutput>, StoreError>;

    /// Atomically claim the oldest ready run (queued, or running with an
    /// expired lease) for `worker_id`, incrementing `attempt` and setting
    /// the lease deadline. Emits `run_claimed`. Returns `None` when no
    /// candidate exists.
    async fn claim_next(
        &self,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<Option<(Run, EventRecord)>, StoreError>;

    /// Extend the lease if `worker_id` still owns the run.
    async fn renew_lease(
        &self,
        run_id: &str,
        worker_id: &str,
        lease_ttl: Duration,
    ) -> Result<LeaseOutcome, StoreError>;

    /// Terminate the run if `worker_id` still owns it: set the terminal
    /// status, `phase = done`, `ended_at`, and clear the lease. Emits
    /// `run_released`.
    async fn release(
        &self,
        run_id: &str,
        worker_id: &str,
        request: ReleaseRequest,
    ) -> Result<ReleaseOutcome, StoreError>;

    /// Set the cooperative cancellation flag. Emits `cancel_requested`
    /// unless the run is already terminal.
    async fn request_cancel(&self, run_id: &str) -> Result<CancelOutcome, StoreError>;

    /// Re-queue every running run whose lease has expired (status back to
    /// queued, phase back to bundle, claim cleared). Emits one
    /// `lease_expired` per victim and returns them.
    async fn expire_leases(&self) -> Result<Vec<(Run, EventRecord)>, StoreError>;
}
