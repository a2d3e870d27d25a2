//! Durable persistence for studies, runs, summaries, events, and agent
//! outputs
//!
//! The physical backend sits behind the [`RunStore`] trait so that an
//! alternative store is substitutable; the adapter contract is strict about
//! the one thing the scheduler depends on: claim, renew, and release are
//! single compare-and-set steps. An adapter that cannot provide that
//! atomicity must not implement the trait.
//!
//! The shipped adapter is [`SqliteRunStore`]: entities persist as canonical
//! JSON documents with the indexed fields extracted into columns, WAL
//! journaling keeps appends from blocking reads, and transient busy errors
//! retry inside the adapter with exponential backoff.

pub mod entities;
pub mod error;
pub mod sqlite;
pub mod store;

pub use entities::{
    AgentOutput, ArtifactsDelta, EventKind, EventQuery, EventRecord, NewEvent, Run, RunArtifacts,
    RunError, RunErrorKind, RunFilter, RunPhase, RunStatus, Study, Summary, SummaryFields,
};
pub use error::StoreError;
pub use sqlite::SqliteRunStore;
pub use store::{
    CancelOutcome, LeaseOutcome, PhaseUpdate, ReleaseOutcome, ReleaseRequest, RunStore,
};
