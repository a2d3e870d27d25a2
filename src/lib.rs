//! aonp - durable orchestration core for neutronics Monte Carlo studies
//!
//! A submitted study spec is validated, content-addressed, and queued as a
//! run; independent workers claim runs through atomic store leases, bundle
//! the solver inputs, supervise the solver subprocess with line-granular
//! output streaming, and promote the extracted keff summary back into the
//! durable store. Everything external collaborators need goes through the
//! [`Core`] handle.

pub mod cli;
pub mod config;
pub mod core;
pub mod logging;

// Core types and errors used by external consumers
pub use crate::config::{Config, ConfigError};
pub use crate::core::{Core, SubmitError, SubmitReceipt, WorkerSet};
pub use aonp_events::{EventStream, StreamEvent};
pub use aonp_spec::{SpecHash, StudySpec, ValidationError};
pub use aonp_store::{
    CancelOutcome, Run, RunError, RunErrorKind, RunFilter, RunPhase, RunStatus, StoreError,
    Summary,
};
