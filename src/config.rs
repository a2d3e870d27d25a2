//! Environment-driven configuration
//!
//! The core is configured entirely through `AONP_*` environment
//! variables; everything else in the process environment passes through
//! untouched to child processes. Defaults match a single-host developer
//! setup: bundles under `./runs`, the embedded store in `./aonp.db`.

use std::time::Duration;

use camino::Utf8PathBuf;
use uuid::Uuid;

use aonp_supervisor::SupervisorConfig;

/// Environment variable names consumed by the core.
pub mod env_vars {
    /// Bundle tree root (default `./runs`).
    pub const RUNS_ROOT: &str = "AONP_RUNS_ROOT";
    /// Cross-sections index path handed to the solver.
    pub const NUCLEAR_DATA_INDEX: &str = "AONP_NUCLEAR_DATA_INDEX";
    /// Durable store location (default `./aonp.db`).
    pub const STORE_URI: &str = "AONP_MONGO_URI";
    /// Database name within the store location (default `aonp`).
    pub const DB_NAME: &str = "AONP_DB_NAME";
    /// Worker identifier; autogenerated when missing.
    pub const WORKER_ID: &str = "AONP_WORKER_ID";
    /// Claim lease TTL in seconds (default 300).
    pub const LEASE_TTL_SECONDS: &str = "AONP_LEASE_TTL_SECONDS";
    /// Per-run wall-clock cap in seconds (default 300).
    pub const MAX_RUNTIME_SECONDS: &str = "AONP_MAX_RUNTIME_SECONDS";
    /// Solver executable (default `openmc`).
    pub const SOLVER_CMD: &str = "AONP_SOLVER_CMD";
}

/// Default lease TTL in seconds.
pub const DEFAULT_LEASE_TTL_SECS: u64 = 300;
/// Default per-run wall-clock cap in seconds.
pub const DEFAULT_MAX_RUNTIME_SECS: u64 = 300;

/// Configuration rejections at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A numeric variable did not parse or was zero.
    #[error("{var} must be a positive integer, got '{value}'")]
    InvalidNumber { var: &'static str, value: String },
}

/// Resolved core configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Bundle tree root.
    pub runs_root: Utf8PathBuf,
    /// Durable store location (path or `file:` URI).
    pub store_uri: String,
    /// Database name within the store location.
    pub db_name: String,
    /// Cross-sections index handed to solver children.
    pub nuclear_data_index: Option<Utf8PathBuf>,
    /// This process's worker identity.
    pub worker_id: String,
    /// Claim lease TTL.
    pub lease_ttl: Duration,
    /// Per-run wall-clock cap.
    pub max_runtime: Duration,
    /// Solver executable.
    pub solver_cmd: String,
}

impl Config {
    /// Read configuration from the process environment.
    ///
    /// # Errors
    ///
    /// [`ConfigError::InvalidNumber`] when a duration variable is set but
    /// not a positive integer.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            runs_root: Utf8PathBuf::from(
                std::env::var(env_vars::RUNS_ROOT).unwrap_or_else(|_| "./runs".to_string()),
            ),
            store_uri: std::env::var(env_vars::STORE_URI)
                .unwrap_or_else(|_| "./aonp.db".to_string()),
            db_name: std::env::var(env_vars::DB_NAME).unwrap_or_else(|_| "aonp".to_string()),
            nuclear_data_index: std::env::var(env_vars::NUCLEAR_DATA_INDEX)
                .ok()
                .map(Utf8PathBuf::from),
            worker_id: std::env::var(env_vars::WORKER_ID)
                .unwrap_or_else(|_| format!("worker-{}", Uuid::new_v4())),
            lease_ttl: seconds_var(env_vars::LEASE_TTL_SECONDS, DEFAULT_LEASE_TTL_SECS)?,
            max_runtime: seconds_var(env_vars::MAX_RUNTIME_SECONDS, DEFAULT_MAX_RUNTIME_SECS)?,
            solver_cmd: std::env::var(env_vars::SOLVER_CMD)
                .unwrap_or_else(|_| "openmc".to_string()),
        })
    }

    /// The supervisor's view of this configuration.
    #[must_use]
    pub fn supervisor_config(&self) -> SupervisorConfig {
        SupervisorConfig {
            runs_root: self.runs_root.clone(),
            solver_cmd: self.solver_cmd.clone(),
            nuclear_data_index: self.nuclear_data_index.clone(),
            lease_ttl: self.lease_ttl,
            max_runtime: self.max_runtime,
            omp_threads: None,
        }
    }
}

fn seconds_var(var: &'static str, default: u64) -> Result<Duration, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match value.parse::<u64>() {
            Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
            _ => Err(ConfigError::InvalidNumber { var, value }),
        },
        Err(_) => Ok(Duration::from_secs(default)),
    }
}
