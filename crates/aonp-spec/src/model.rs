//! Typed study specification tree
//!
//! The shapes here mirror the submission schema one-to-one. Variant fields
//! are sum types (`Geometry`, `SourceSpec`) rather than stringly-typed
//! blobs, so invalid combinations fail at parse time instead of inside a
//! worker. Materials live in a `BTreeMap` because material order is
//! set-like: the canonical form sorts by material name. Nuclide lists are
//! `Vec` because their order is declared by the author and preserved.

use std::collections::BTreeMap;

use camino::Utf8PathBuf;
use serde::{Deserialize, Serialize};

/// Tolerated band for the per-material nuclide fraction sum.
pub const FRACTION_SUM_MIN: f64 = 0.99;
/// Upper bound of the tolerated fraction sum band.
pub const FRACTION_SUM_MAX: f64 = 1.01;

/// A validated, immutable study specification.
///
/// Instances are only constructed through [`crate::parse::parse_json`] /
/// [`crate::parse::parse_yaml`] (or deserialized from canonical bytes that
/// an earlier parse produced), so holding a `StudySpec` implies the §3
/// range and consistency checks already passed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudySpec {
    /// Human-readable study name. Non-empty.
    pub name: String,
    /// Optional free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Materials keyed by material name.
    pub materials: BTreeMap<String, MaterialSpec>,
    /// Geometry reference.
    pub geometry: Geometry,
    /// Monte Carlo settings.
    pub settings: Settings,
    /// Nuclear data library reference.
    pub nuclear_data: NuclearData,
}

/// One material definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MaterialSpec {
    /// Density value, strictly positive.
    pub density: f64,
    /// Units the density is expressed in.
    pub density_units: DensityUnits,
    /// Temperature in Kelvin, strictly positive.
    pub temperature: f64,
    /// Nuclides in author-declared order.
    pub nuclides: Vec<NuclideSpec>,
}

/// Density units accepted by the solver input format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DensityUnits {
    /// Grams per cubic centimetre.
    #[serde(rename = "g/cm3", alias = "g/cc")]
    GramPerCm3,
    /// Atoms per barn-centimetre.
    #[serde(rename = "atom/b-cm")]
    AtomPerBarnCm,
}

impl DensityUnits {
    /// Solver-facing spelling of the unit.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::GramPerCm3 => "g/cm3",
            Self::AtomPerBarnCm => "atom/b-cm",
        }
    }
}

/// One nuclide entry inside a material.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NuclideSpec {
    /// Nuclide name, element symbol plus mass number (e.g. "U235").
    pub name: String,
    /// Fraction in (0, 1].
    pub fraction: f64,
    /// Whether `fraction` is an atom or weight fraction.
    #[serde(default)]
    pub fraction_type: FractionType,
}

/// Interpretation of a nuclide fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FractionType {
    /// Atom fraction (solver attribute `ao`).
    #[default]
    Atom,
    /// Weight fraction (solver attribute `wo`).
    Weight,
}

/// Geometry reference for a study.
///
/// Only the external-script form is executable today. The inline form
/// parses and canonicalizes (so its hash is stable when it lands) but the
/// bundler rejects it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Geometry {
    /// An external geometry script invoked at bundle time.
    Script {
        /// Path to the script on the submitting host.
        path: Utf8PathBuf,
        /// Entry point name the script is expected to expose.
        entry: String,
    },
    /// Inline structural description. Parsed but not executable.
    Inline {
        /// Opaque structural definition, carried as-is.
        definition: serde_json::Value,
    },
}

/// Monte Carlo run settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    /// Total batches, strictly positive.
    pub batches: u32,
    /// Inactive (discarded) batches, `< batches`.
    pub inactive: u32,
    /// Particles per batch, strictly positive.
    pub particles: u64,
    /// Random number seed.
    pub seed: i64,
    /// Optional source description; a fixed uniform box source is emitted
    /// when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceSpec>,
}

/// Explicit source description.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SourceSpec {
    /// Uniform spatial box source.
    Box {
        /// Lower-left corner, cm.
        lower_left: [f64; 3],
        /// Upper-right corner, cm.
        upper_right: [f64; 3],
    },
}

/// Nuclear data library reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NuclearData {
    /// Library identifier (e.g. "endfb-viii.0-hdf5").
    pub library: String,
    /// Path to the cross-sections index file.
    pub cross_sections: Utf8PathBuf,
}
