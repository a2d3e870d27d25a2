//! Statepoint ingestion and summary extraction
//!
//! The solver's statepoint is a flat container of named numeric datasets
//! (see [`container`]). Extraction reads the combined multiplication
//! factor estimator and the simulation configuration, validates them,
//! writes a small columnar summary file into the bundle's `outputs/`, and
//! returns the fields that get promoted into the durable store.

pub mod container;

use camino::{Utf8Path, Utf8PathBuf};

use aonp_store::SummaryFields;
pub use container::{DatasetValue, Statepoint, write_statepoint};

/// Dataset names the extractor requires.
pub const DS_KEFF_MEAN: &str = "keff/mean";
pub const DS_KEFF_STD: &str = "keff/std_dev";
pub const DS_N_BATCHES: &str = "n_batches";
pub const DS_N_INACTIVE: &str = "n_inactive";
pub const DS_N_PARTICLES: &str = "n_particles";

/// Extraction failures, each naming its specific reason.
#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    /// The statepoint file cannot be read.
    #[error("cannot read statepoint {path}: {source}")]
    Open {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not a statepoint container.
    #[error("bad statepoint magic (found {found:02x?})")]
    BadMagic { found: [u8; 4] },

    /// Container format newer than this reader.
    #[error("unsupported statepoint format version {version}")]
    UnsupportedVersion { version: u32 },

    /// The container ends mid-record.
    #[error("truncated statepoint: {reason}")]
    Truncated { reason: String },

    /// A required dataset is absent.
    #[error("statepoint missing dataset '{name}'")]
    MissingDataset { name: &'static str },

    /// A dataset holds the wrong primitive type.
    #[error("statepoint dataset '{name}' has the wrong type")]
    WrongType { name: &'static str },

    /// Extracted values violate a summary invariant.
    #[error("invalid extracted value: {reason}")]
    InvalidValue { reason: String },

    /// The summary file could not be written.
    #[error("cannot write summary: {0}")]
    Summary(#[from] csv::Error),
}

/// Read the statepoint at `statepoint_path`, validate it, and write the
/// columnar summary into `outputs_dir`.
///
/// Returns the summary fields and the path of the written summary file.
///
/// # Errors
///
/// [`ExtractError`] on unreadable or corrupt statepoints, missing
/// datasets, or out-of-range values (`std_dev < 0`,
/// `n_batches <= n_inactive`).
pub fn extract_summary(
    statepoint_path: &Utf8Path,
    outputs_dir: &Utf8Path,
) -> Result<(SummaryFields, Utf8PathBuf), ExtractError> {
    let statepoint = container::read_statepoint(statepoint_path)?;
    let fields = summary_from_statepoint(&statepoint)?;
    let summary_path = write_summary_csv(&fields, outputs_dir)?;
    Ok((fields, summary_path))
}

/// Pull and validate the summary fields out of a parsed statepoint.
///
/// # Errors
///
/// `MissingDataset`/`WrongType` for absent or mistyped datasets,
/// `InvalidValue` for range violations.
pub fn summary_from_statepoint(statepoint: &Statepoint) -> Result<SummaryFields, ExtractError> {
    let keff = statepoint.f64_dataset(DS_KEFF_MEAN)?;
    let keff_std = statepoint.f64_dataset(DS_KEFF_STD)?;
    let n_batches = statepoint.i64_dataset(DS_N_BATCHES)?;
    let n_inactive = statepoint.i64_dataset(DS_N_INACTIVE)?;
    let n_particles = statepoint.i64_dataset(DS_N_PARTICLES)?;

    if !keff.is_finite() || !keff_std.is_finite() {
        return Err(ExtractError::InvalidValue {
            reason: format!("non-finite keff estimator ({keff}, {keff_std})"),
        });
    }
    if keff_std < 0.0 {
        return Err(ExtractError::InvalidValue {
            reason: format!("negative std_dev {keff_std}"),
        });
    }
    if n_batches <= 0 || n_inactive < 0 || n_particles <= 0 {
        return Err(ExtractError::InvalidValue {
            reason: format!(
                "non-positive configuration (batches {n_batches}, inactive {n_inactive}, \
                 particles {n_particles})"
            ),
        });
    }
    if n_batches <= n_inactive {
        return Err(ExtractError::InvalidValue {
            reason: format!("n_batches {n_batches} <= n_inactive {n_inactive}"),
        });
    }

    Ok(SummaryFields {
        keff,
        keff_std,
        n_batches: n_batches as u32,
        n_inactive: n_inactive as u32,
        n_particles: n_particles as u64,
    })
}

/// Write `outputs_dir/summary.csv`: two columns, one row per metric.
///
/// Consumers key by row name, so row order is part of the contract:
/// keff, keff_std, keff_uncertainty_pcm, n_batches, n_inactive,
/// n_particles.
fn write_summary_csv(
    fields: &SummaryFields,
    outputs_dir: &Utf8Path,
) -> Result<Utf8PathBuf, ExtractError> {
    let path = outputs_dir.join("summary.csv");
    let rows = [
        ("keff", fields.keff.to_string()),
        ("keff_std", fields.keff_std.to_string()),
        ("keff_uncertainty_pcm", fields.uncertainty_pcm().to_string()),
        ("n_batches", fields.n_batches.to_string()),
        ("n_inactive", fields.n_inactive.to_string()),
        ("n_particles", fields.n_particles.to_string()),
    ];
    let mut writer = csv::Writer::from_path(path.as_std_path())?;
    writer.write_record(["metric", "value"])?;
    for (metric, value) in &rows {
        writer.write_record([*metric, value.as_str()])?;
    }
    writer.flush().map_err(csv::Error::from)?;
    Ok(path)
}
