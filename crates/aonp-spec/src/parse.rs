//! Parsing and validation of untrusted study submissions
//!
//! Validation is a function returning a structured error, never an
//! exception path: the submitter gets one [`ValidationError`] naming the
//! first offending field, and nothing is persisted on rejection.

use std::sync::LazyLock;

use regex::Regex;

use crate::model::{
    FRACTION_SUM_MAX, FRACTION_SUM_MIN, Geometry, MaterialSpec, Settings, StudySpec,
};

/// Element symbol + mass number, with an optional metastable suffix
/// ("U235", "Am242_m1").
static NUCLIDE_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][a-z]?[0-9]{1,3}(_m[0-9])?$").expect("nuclide pattern is valid")
});

/// Rejection reasons for a submitted study document.
///
/// These are returned synchronously at submit time; a rejected document
/// never enters the run lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// The document is not valid YAML/JSON at all.
    #[error("malformed document: {reason}")]
    Malformed { reason: String },

    /// Structural mismatch: wrong type, missing field, unknown field or
    /// enum value. Carries the deserializer's message verbatim.
    #[error("schema violation: {reason}")]
    Schema { reason: String },

    /// The study name is empty or whitespace.
    #[error("study name must be non-empty")]
    EmptyName,

    /// No materials were given.
    #[error("at least one material is required")]
    NoMaterials,

    /// A numeric field is outside its allowed range.
    #[error("{field} must be {constraint} (got {value})")]
    OutOfRange {
        field: String,
        constraint: &'static str,
        value: f64,
    },

    /// A nuclide name does not match the element+mass pattern.
    #[error("material '{material}': invalid nuclide name '{name}'")]
    BadNuclideName { material: String, name: String },

    /// A material declared no nuclides.
    #[error("material '{material}' has no nuclides")]
    NoNuclides { material: String },

    /// The nuclide fractions of one material do not sum to ~1.
    #[error(
        "material '{material}': nuclide fractions sum to {sum} \
         (must be within [{FRACTION_SUM_MIN}, {FRACTION_SUM_MAX}])"
    )]
    FractionSum { material: String, sum: f64 },

    /// `inactive` is not strictly below `batches`.
    #[error("inactive batches ({inactive}) must be less than total batches ({batches})")]
    InactiveExceedsBatches { batches: u32, inactive: u32 },
}

/// Parse and validate a raw JSON tree into a [`StudySpec`].
///
/// # Errors
///
/// Returns [`ValidationError`] on any type mismatch, missing or unknown
/// field, out-of-range value, fraction-sum violation, or inconsistent
/// batch counts.
pub fn parse_json(raw: &serde_json::Value) -> Result<StudySpec, ValidationError> {
    let spec: StudySpec = serde_json::from_value(raw.clone())
        .map_err(|e| ValidationError::Schema { reason: e.to_string() })?;
    validate(&spec)?;
    Ok(spec)
}

/// Parse and validate a YAML document into a [`StudySpec`].
///
/// YAML goes through a JSON value first so that both input formats share
/// one schema and one canonical form.
///
/// # Errors
///
/// Returns [`ValidationError::Malformed`] when the text is not YAML, and
/// the same set of errors as [`parse_json`] otherwise.
pub fn parse_yaml(text: &str) -> Result<StudySpec, ValidationError> {
    let raw: serde_json::Value = serde_yaml::from_str(text)
        .map_err(|e| ValidationError::Malformed { reason: e.to_string() })?;
    parse_json(&raw)
}

/// Semantic checks over an already well-shaped spec.
fn validate(spec: &StudySpec) -> Result<(), ValidationError> {
    if spec.name.trim().is_empty() {
        return Err(ValidationError::EmptyName);
    }
    if spec.materials.is_empty() {
        return Err(ValidationError::NoMaterials);
    }
    for (name, material) in &spec.materials {
        validate_material(name, material)?;
    }
    validate_settings(&spec.settings)?;
    if let Geometry::Script { path, entry } = &spec.geometry {
        if path.as_str().is_empty() {
            return Err(ValidationError::Schema {
                reason: "geometry.path must be non-empty".to_string(),
            });
        }
        if entry.trim().is_empty() {
            return Err(ValidationError::Schema {
                reason: "geometry.entry must be non-empty".to_string(),
            });
        }
    }
    Ok(())
}

fn validate_material(name: &str, material: &MaterialSpec) -> Result<(), ValidationError> {
    if !(material.density > 0.0) {
        return Err(ValidationError::OutOfRange {
            field: format!("materials.{name}.density"),
            constraint: "positive",
            value: material.density,
        });
    }
    if !(material.temperature > 0.0) {
        return Err(ValidationError::OutOfRange {
            field: format!("materials.{name}.temperature"),
            constraint: "positive",
            value: material.temperature,
        });
    }
    if material.nuclides.is_empty() {
        return Err(ValidationError::NoNuclides { material: name.to_string() });
    }
    let mut sum = 0.0;
    for nuclide in &material.nuclides {
        if !NUCLIDE_NAME.is_match(&nuclide.name) {
            return Err(ValidationError::BadNuclideName {
                material: name.to_string(),
                name: nuclide.name.clone(),
            });
        }
        if !(nuclide.fraction > 0.0 && nuclide.fraction <= 1.0) {
            return Err(ValidationError::OutOfRange {
                field: format!("materials.{name}.nuclides.{}.fraction", nuclide.name),
                constraint: "in (0, 1]",
                value: nuclide.fraction,
            });
        }
        sum += nuclide.fraction;
    }
    if !(FRACTION_SUM_MIN..=FRACTION_SUM_MAX).contains(&sum) {
        return Err(ValidationError::FractionSum { material: name.to_string(), sum });
    }
    Ok(())
}

fn validate_settings(settings: &Settings) -> Result<(), ValidationError> {
    if settings.batches == 0 {
        return Err(ValidationError::OutOfRange {
            field: "settings.batches".to_string(),
            constraint: "positive",
            value: 0.0,
        });
    }
    if settings.particles == 0 {
        return Err(ValidationError::OutOfRange {
            field: "settings.particles".to_string(),
            constraint: "positive",
            value: 0.0,
        });
    }
    if settings.inactive >= settings.batches {
        return Err(ValidationError::InactiveExceedsBatches {
            batches: settings.batches,
            inactive: settings.inactive,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Pin-cell study used across the suite; mirrors the simplest real
    /// submission we expect to see.
    pub(crate) fn pincell_yaml() -> &'static str {
        r#"
name: pincell
materials:
  fuel:
    density: 10.4
    density_units: g/cm3
    temperature: 900.0
    nuclides:
      - { name: U235, fraction: 0.03, fraction_type: atom }
      - { name: U238, fraction: 0.27, fraction_type: atom }
      - { name: O16, fraction: 0.70, fraction_type: atom }
  moderator:
    density: 1.0
    density_units: g/cm3
    temperature: 600.0
    nuclides:
      - { name: H1, fraction: 0.6667 }
      - { name: O16, fraction: 0.3333 }
geometry:
  type: script
  path: /models/pincell.py
  entry: build
settings:
  batches: 120
  inactive: 20
  particles: 10000
  seed: 42
nuclear_data:
  library: endfb-viii.0-hdf5
  cross_sections: /data/endfb80/cross_sections.xml
"#
    }

    #[test]
    fn test_pincell_parses() {
        let spec = parse_yaml(pincell_yaml()).unwrap();
        assert_eq!(spec.name, "pincell");
        assert_eq!(spec.materials.len(), 2);
        assert_eq!(spec.settings.batches, 120);
        let fuel = &spec.materials["fuel"];
        assert_eq!(fuel.nuclides.len(), 3);
        assert_eq!(fuel.nuclides[0].name, "U235");
    }

    #[test]
    fn test_negative_density_rejected() {
        let text = pincell_yaml().replace("density: 10.4", "density: -10.4");
        let err = parse_yaml(&text).unwrap_err();
        assert!(
            matches!(err, ValidationError::OutOfRange { ref field, .. } if field.contains("density")),
            "expected density range error, got: {err}"
        );
    }

    #[test]
    fn test_fraction_sum_rejected() {
        let text = pincell_yaml()
            .replace("fraction: 0.6667", "fraction: 0.6")
            .replace("fraction: 0.3333", "fraction: 0.3");
        let err = parse_yaml(&text).unwrap_err();
        match err {
            ValidationError::FractionSum { material, sum } => {
                assert_eq!(material, "moderator");
                assert!((sum - 0.9).abs() < 1e-9, "sum should be 0.9, got {sum}");
            }
            other => panic!("expected FractionSum, got: {other}"),
        }
    }

    #[test]
    fn test_inactive_must_be_below_batches() {
        let text = pincell_yaml().replace("inactive: 20", "inactive: 120");
        let err = parse_yaml(&text).unwrap_err();
        assert!(matches!(
            err,
            ValidationError::InactiveExceedsBatches { batches: 120, inactive: 120 }
        ));
    }

    #[test]
    fn test_unknown_density_units_rejected() {
        let text = pincell_yaml().replace("density_units: g/cm3", "density_units: kg/m3");
        assert!(matches!(parse_yaml(&text), Err(ValidationError::Schema { .. })));
    }

    #[test]
    fn test_bad_nuclide_name_rejected() {
        let text = pincell_yaml().replace("name: U235", "name: uranium-235");
        let err = parse_yaml(&text).unwrap_err();
        assert!(matches!(err, ValidationError::BadNuclideName { ref name, .. } if name == "uranium-235"));
    }

    #[test]
    fn test_metastable_nuclide_accepted() {
        let text = pincell_yaml().replace("name: U238", "name: Am242_m1");
        assert!(parse_yaml(&text).is_ok());
    }

    #[test]
    fn test_empty_name_rejected() {
        let text = pincell_yaml().replace("name: pincell", "name: \"  \"");
        assert!(matches!(parse_yaml(&text), Err(ValidationError::EmptyName)));
    }

    #[test]
    fn test_fraction_above_one_rejected() {
        let text = pincell_yaml().replace("fraction: 0.6667", "fraction: 1.6667");
        assert!(matches!(parse_yaml(&text), Err(ValidationError::OutOfRange { .. })));
    }

    #[test]
    fn test_zero_particles_rejected() {
        let text = pincell_yaml().replace("particles: 10000", "particles: 0");
        assert!(matches!(parse_yaml(&text), Err(ValidationError::OutOfRange { .. })));
    }

    #[test]
    fn test_not_yaml_is_malformed() {
        assert!(matches!(
            parse_yaml("{ name: [unclosed"),
            Err(ValidationError::Malformed { .. })
        ));
    }
}
