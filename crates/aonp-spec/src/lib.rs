//! Study specification model for neutronics Monte Carlo runs
//!
//! This crate owns the validated [`StudySpec`] tree, the parser that turns
//! untrusted JSON/YAML trees into it, and the canonical serialization used
//! for content addressing. The canonical byte sequence is the identity of a
//! study: two documents that differ only in formatting, comments, or key
//! order hash to the same [`SpecHash`].

pub mod canonical;
pub mod model;
pub mod parse;

pub use canonical::{SpecHash, canonical_bytes, spec_hash};
pub use model::{
    DensityUnits, FractionType, Geometry, MaterialSpec, NuclearData, NuclideSpec, Settings,
    SourceSpec, StudySpec,
};
pub use parse::{ValidationError, parse_json, parse_yaml};
