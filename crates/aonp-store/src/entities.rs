//! Store entities and their lifecycle vocabulary
//!
//! Every timestamp is a UTC instant with millisecond precision; the store
//! adapter is the authority for all of them, callers never supply times.

use camino::Utf8PathBuf;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Run lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    /// Waiting for a worker claim.
    Queued,
    /// Claimed and leased by a worker.
    Running,
    /// Terminal: completed with a summary.
    Succeeded,
    /// Terminal: ended with a structured error.
    Failed,
}

impl RunStatus {
    /// Store-facing spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    /// Whether this status ends the lifecycle.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

/// Progress marker within a running run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    /// Materializing the on-disk bundle.
    Bundle,
    /// Solver subprocess in flight.
    Execute,
    /// Reading the statepoint into a summary.
    Extract,
    /// Terminal marker, only ever set alongside a terminal status.
    Done,
}

impl RunPhase {
    /// Store-facing spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Bundle => "bundle",
            Self::Execute => "execute",
            Self::Extract => "extract",
            Self::Done => "done",
        }
    }

    /// The phase that follows this one in the happy path.
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        match self {
            Self::Bundle => Some(Self::Execute),
            Self::Execute => Some(Self::Extract),
            Self::Extract => Some(Self::Done),
            Self::Done => None,
        }
    }
}

/// Artifact paths populated as phases complete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunArtifacts {
    /// Root of the run's bundle directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bundle_path: Option<Utf8PathBuf>,
    /// Harvested statepoint file (lexicographically last one).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statepoint_path: Option<Utf8PathBuf>,
    /// Columnar summary file written by the extractor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_path: Option<Utf8PathBuf>,
}

/// Partial artifact update merged into [`RunArtifacts`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ArtifactsDelta {
    /// New bundle root, if just materialized.
    pub bundle_path: Option<Utf8PathBuf>,
    /// New statepoint path, if just harvested.
    pub statepoint_path: Option<Utf8PathBuf>,
    /// New summary path, if just extracted.
    pub summary_path: Option<Utf8PathBuf>,
}

impl ArtifactsDelta {
    /// True when the delta carries nothing.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.bundle_path.is_none() && self.statepoint_path.is_none() && self.summary_path.is_none()
    }
}

impl RunArtifacts {
    /// Merge a delta; present fields win, absent fields are kept.
    pub fn apply(&mut self, delta: &ArtifactsDelta) {
        if let Some(p) = &delta.bundle_path {
            self.bundle_path = Some(p.clone());
        }
        if let Some(p) = &delta.statepoint_path {
            self.statepoint_path = Some(p.clone());
        }
        if let Some(p) = &delta.summary_path {
            self.summary_path = Some(p.clone());
        }
    }
}

/// Semantic error kind attached to a failed run.
///
/// The serialized spellings are part of the external contract and match
/// the taxonomy consumers key on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunErrorKind {
    /// Malformed or rejected spec (never actually persisted on a run;
    /// rejected submissions do not enter the lifecycle).
    #[serde(rename = "ValidationError")]
    Validation,
    /// Filesystem or geometry-script failure during bundling.
    #[serde(rename = "BundleError")]
    Bundle,
    /// Non-zero exit, signal death, or missing statepoint.
    #[serde(rename = "SolverError")]
    Solver,
    /// Corrupt or incomplete statepoint, or invariant violation on
    /// extracted values.
    #[serde(rename = "ExtractError")]
    Extract,
    /// User-initiated termination.
    #[serde(rename = "Cancelled")]
    Cancelled,
    /// The supervisor lost its lease mid-flight.
    #[serde(rename = "LeaseLost")]
    LeaseLost,
    /// Durable-store failure that exhausted retries.
    #[serde(rename = "StoreError")]
    Store,
}

/// Structured error carried by a failed run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunError {
    /// Semantic kind, see [`RunErrorKind`].
    #[serde(rename = "type")]
    pub kind: RunErrorKind,
    /// One-line human-readable message.
    pub message: String,
    /// Longer detail, e.g. the solver's stderr tail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunError {
    /// Build an error without detail.
    #[must_use]
    pub fn new(kind: RunErrorKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into(), detail: None }
    }

    /// Attach a detail blob.
    #[must_use]
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One execution attempt of a study.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    /// Unique opaque identifier.
    pub run_id: String,
    /// Content hash linking to the study.
    pub spec_hash: String,
    /// Lifecycle status.
    pub status: RunStatus,
    /// Progress within `running`.
    pub phase: RunPhase,
    /// Claim counter; increments on every claim, so retries after lease
    /// expiry are distinguishable.
    pub attempt: u32,
    /// Worker currently holding the lease, if any.
    pub claimed_by: Option<String>,
    /// Lease deadline, if leased.
    pub lease_expires_at: Option<DateTime<Utc>>,
    /// Cooperative cancellation flag.
    pub cancel_requested: bool,
    /// Creation instant.
    pub created_at: DateTime<Utc>,
    /// First-claim instant.
    pub started_at: Option<DateTime<Utc>>,
    /// Terminal instant.
    pub ended_at: Option<DateTime<Utc>>,
    /// Populated artifact paths.
    pub artifacts: RunArtifacts,
    /// Terminal error, if the run failed.
    pub error: Option<RunError>,
}

impl Run {
    /// Whether the run has reached a terminal status.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Deduplicated study record, immutable after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Study {
    /// Content hash; unique.
    pub spec_hash: String,
    /// Canonical JSON of the spec, byte-identical to `study_spec.json`.
    pub canonical_spec: String,
    /// Insert instant.
    pub created_at: DateTime<Utc>,
}

/// Extracted result summary, one per succeeded run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Summary {
    /// Run this summary belongs to; unique.
    pub run_id: String,
    /// Combined multiplication factor estimate.
    pub keff: f64,
    /// Standard deviation of the estimate, non-negative.
    pub keff_std: f64,
    /// `keff_std` in per cent mille.
    pub keff_uncertainty_pcm: f64,
    /// Batches the solver ran.
    pub n_batches: u32,
    /// Inactive batches discarded from statistics.
    pub n_inactive: u32,
    /// Particles per batch.
    pub n_particles: u64,
    /// Extraction instant.
    pub extracted_at: DateTime<Utc>,
}

/// Summary fields supplied by the extractor; the store derives the rest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryFields {
    /// Combined multiplication factor estimate.
    pub keff: f64,
    /// Standard deviation of the estimate.
    pub keff_std: f64,
    /// Batches the solver ran.
    pub n_batches: u32,
    /// Inactive batches discarded from statistics.
    pub n_inactive: u32,
    /// Particles per batch.
    pub n_particles: u64,
}

impl SummaryFields {
    /// `keff_std` expressed in per cent mille.
    #[must_use]
    pub fn uncertainty_pcm(&self) -> f64 {
        self.keff_std * 1e5
    }
}

/// Well-known event kinds produced by the core.
///
/// The event log is an open set (collaborators may append their own
/// kinds), so [`EventRecord::kind`] stays a string; this enum only names
/// the kinds the core itself emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    RunCreated,
    RunClaimed,
    LeaseRenewed,
    LeaseExpired,
    PhaseChanged,
    StdoutLine,
    CancelRequested,
    SummaryExtracted,
    RunReleased,
    /// Bus-synthesized terminator; never persisted.
    StreamEnd,
    /// Bus-synthesized lag notice; never persisted.
    SubscriberLag,
}

impl EventKind {
    /// Wire spelling.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RunCreated => "run_created",
            Self::RunClaimed => "run_claimed",
            Self::LeaseRenewed => "lease_renewed",
            Self::LeaseExpired => "lease_expired",
            Self::PhaseChanged => "phase_changed",
            Self::StdoutLine => "stdout_line",
            Self::CancelRequested => "cancel_requested",
            Self::SummaryExtracted => "summary_extracted",
            Self::RunReleased => "run_released",
            Self::StreamEnd => "stream_end",
            Self::SubscriberLag => "subscriber_lag",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Append-only audit record. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// Store-assigned global sequence number; per-run order follows it.
    pub seq: i64,
    /// Run the event belongs to.
    pub run_id: String,
    /// Store-assigned instant, strictly monotone per run.
    pub ts: DateTime<Utc>,
    /// Event kind, see [`EventKind`] for the core's vocabulary.
    #[serde(rename = "type")]
    pub kind: String,
    /// Optional producing agent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
}

/// Event not yet persisted; the store assigns `seq` and `ts`.
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// Event kind.
    pub kind: String,
    /// Optional producing agent.
    pub agent: Option<String>,
    /// Structured payload.
    pub payload: serde_json::Value,
}

impl NewEvent {
    /// Event from the core's own vocabulary.
    #[must_use]
    pub fn core(kind: EventKind, payload: serde_json::Value) -> Self {
        Self { kind: kind.as_str().to_string(), agent: None, payload }
    }
}

/// Opaque collaborator record attached to a run. The core stores and
/// returns `data` without interpreting it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentOutput {
    /// Run the output belongs to.
    pub run_id: String,
    /// Producing agent identifier.
    pub agent: String,
    /// Collaborator-defined record kind.
    pub kind: String,
    /// Opaque payload.
    pub data: serde_json::Value,
    /// Collaborator schema version for `data`.
    pub schema_version: u32,
    /// Store-assigned instant.
    pub ts: DateTime<Utc>,
}

/// Filter for [`crate::RunStore::list_runs`].
#[derive(Debug, Clone, Default)]
pub struct RunFilter {
    /// Only runs in this status.
    pub status: Option<RunStatus>,
    /// Only runs of this study.
    pub spec_hash: Option<String>,
    /// Only runs created at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Maximum rows returned (default 100).
    pub limit: Option<u32>,
}

/// Filter for [`crate::RunStore::get_events`].
#[derive(Debug, Clone, Default)]
pub struct EventQuery {
    /// Only events at or after this instant.
    pub since: Option<DateTime<Utc>>,
    /// Only events of this kind.
    pub kind: Option<String>,
    /// Maximum rows returned (default 1000).
    pub limit: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_terminality() {
        assert!(!RunStatus::Queued.is_terminal());
        assert!(!RunStatus::Running.is_terminal());
        assert!(RunStatus::Succeeded.is_terminal());
        assert!(RunStatus::Failed.is_terminal());
    }

    #[test]
    fn test_phase_progression() {
        assert_eq!(RunPhase::Bundle.next(), Some(RunPhase::Execute));
        assert_eq!(RunPhase::Execute.next(), Some(RunPhase::Extract));
        assert_eq!(RunPhase::Extract.next(), Some(RunPhase::Done));
        assert_eq!(RunPhase::Done.next(), None);
    }

    #[test]
    fn test_error_kind_wire_spelling() {
        let err = RunError::new(RunErrorKind::Solver, "exit code 1");
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["type"], "SolverError");
        assert_eq!(json["message"], "exit code 1");
        assert!(json.get("detail").is_none());
    }

    #[test]
    fn test_artifacts_apply_keeps_absent_fields() {
        let mut artifacts = RunArtifacts {
            bundle_path: Some(Utf8PathBuf::from("/runs/r1")),
            ..RunArtifacts::default()
        };
        artifacts.apply(&ArtifactsDelta {
            statepoint_path: Some(Utf8PathBuf::from("/runs/r1/outputs/statepoint.120.h5")),
            ..ArtifactsDelta::default()
        });
        assert_eq!(artifacts.bundle_path.as_deref(), Some(camino::Utf8Path::new("/runs/r1")));
        assert!(artifacts.statepoint_path.is_some());
        assert!(artifacts.summary_path.is_none());
    }

    #[test]
    fn test_uncertainty_pcm_derivation() {
        let fields = SummaryFields {
            keff: 1.62,
            keff_std: 0.004,
            n_batches: 120,
            n_inactive: 20,
            n_particles: 10_000,
        };
        assert!((fields.uncertainty_pcm() - 400.0).abs() < 1e-9);
    }
}
