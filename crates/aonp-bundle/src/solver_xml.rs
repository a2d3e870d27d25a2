//! Deterministic solver input emission
//!
//! The solver's XML dialect is write-only for the core: we emit it, the
//! solver interprets it. Emission is deterministic so that bundles of the
//! same study are byte-identical: materials are walked in map order
//! (sorted by name), ids are assigned in that order starting at 1, and
//! attributes always appear as id, name, density, units, temperature with
//! nuclides in declared order.

use std::fmt::Write;

use aonp_spec::{FractionType, Settings, SourceSpec, StudySpec};

/// Source emitted when the study declares none: a uniform box spanning
/// one centimetre around the origin.
const DEFAULT_SOURCE_BOX: ([f64; 3], [f64; 3]) = ([-0.5, -0.5, -0.5], [0.5, 0.5, 0.5]);

/// Render `materials.xml` for a study.
#[must_use]
pub fn materials_xml(spec: &StudySpec) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<materials>\n");
    for (id, (name, material)) in spec.materials.iter().enumerate() {
        let _ = writeln!(
            out,
            "  <material id=\"{}\" name=\"{}\" temperature=\"{}\">",
            id + 1,
            escape(name),
            material.temperature,
        );
        let _ = writeln!(
            out,
            "    <density value=\"{}\" units=\"{}\"/>",
            material.density,
            material.density_units.as_str(),
        );
        for nuclide in &material.nuclides {
            let attr = match nuclide.fraction_type {
                FractionType::Atom => "ao",
                FractionType::Weight => "wo",
            };
            let _ = writeln!(
                out,
                "    <nuclide name=\"{}\" {attr}=\"{}\"/>",
                escape(&nuclide.name),
                nuclide.fraction,
            );
        }
        out.push_str("  </material>\n");
    }
    out.push_str("</materials>\n");
    out
}

/// Render `settings.xml` for a study.
#[must_use]
pub fn settings_xml(settings: &Settings) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"utf-8\"?>\n<settings>\n");
    out.push_str("  <run_mode>eigenvalue</run_mode>\n");
    let _ = writeln!(out, "  <batches>{}</batches>", settings.batches);
    let _ = writeln!(out, "  <inactive>{}</inactive>", settings.inactive);
    let _ = writeln!(out, "  <particles>{}</particles>", settings.particles);
    let _ = writeln!(out, "  <seed>{}</seed>", settings.seed);
    let (lower, upper) = match &settings.source {
        Some(SourceSpec::Box { lower_left, upper_right }) => (*lower_left, *upper_right),
        None => DEFAULT_SOURCE_BOX,
    };
    out.push_str("  <source>\n    <space type=\"box\">\n");
    let _ = writeln!(
        out,
        "      <parameters>{} {} {} {} {} {}</parameters>",
        lower[0], lower[1], lower[2], upper[0], upper[1], upper[2],
    );
    out.push_str("    </space>\n  </source>\n</settings>\n");
    out
}

/// Minimal XML attribute/text escaping.
fn escape(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pincell() -> StudySpec {
        aonp_spec::parse_yaml(
            r#"
name: pincell
materials:
  fuel:
    density: 10.4
    density_units: g/cm3
    temperature: 900.0
    nuclides:
      - { name: U235, fraction: 0.03 }
      - { name: U238, fraction: 0.27 }
      - { name: O16, fraction: 0.70 }
  moderator:
    density: 1.0
    density_units: g/cm3
    temperature: 600.0
    nuclides:
      - { name: H1, fraction: 0.6667, fraction_type: weight }
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
"#,
        )
        .unwrap()
    }

    #[test]
    fn test_materials_xml_shape() {
        let xml = materials_xml(&pincell());
        // Sorted by material name: fuel before moderator, ids 1 and 2.
        let fuel = xml.find("name=\"fuel\"").unwrap();
        let moderator = xml.find("name=\"moderator\"").unwrap();
        assert!(fuel < moderator);
        assert!(xml.contains("<material id=\"1\" name=\"fuel\" temperature=\"900\">"));
        assert!(xml.contains("<material id=\"2\" name=\"moderator\" temperature=\"600\">"));
        assert!(xml.contains("<density value=\"10.4\" units=\"g/cm3\"/>"));
        // Declared nuclide order inside a material is preserved.
        let u235 = xml.find("U235").unwrap();
        let u238 = xml.find("U238").unwrap();
        assert!(u235 < u238);
        // Fraction type maps to the ao/wo attribute.
        assert!(xml.contains("<nuclide name=\"U235\" ao=\"0.03\"/>"));
        assert!(xml.contains("<nuclide name=\"H1\" wo=\"0.6667\"/>"));
    }

    #[test]
    fn test_settings_xml_echoes_run_parameters() {
        let xml = settings_xml(&pincell().settings);
        assert!(xml.contains("<batches>120</batches>"));
        assert!(xml.contains("<inactive>20</inactive>"));
        assert!(xml.contains("<particles>10000</particles>"));
        assert!(xml.contains("<seed>42</seed>"));
        assert!(xml.contains("<parameters>-0.5 -0.5 -0.5 0.5 0.5 0.5</parameters>"));
    }

    #[test]
    fn test_settings_xml_explicit_source() {
        let mut settings = pincell().settings;
        settings.source = Some(SourceSpec::Box {
            lower_left: [-1.0, -1.0, -2.0],
            upper_right: [1.0, 1.0, 2.0],
        });
        let xml = settings_xml(&settings);
        assert!(xml.contains("<parameters>-1 -1 -2 1 1 2</parameters>"));
    }

    #[test]
    fn test_emission_is_deterministic() {
        let spec = pincell();
        assert_eq!(materials_xml(&spec), materials_xml(&spec));
        assert_eq!(settings_xml(&spec.settings), settings_xml(&spec.settings));
    }

    #[test]
    fn test_escape_covers_xml_metacharacters() {
        assert_eq!(escape("a<b>&\"c'"), "a&lt;b&gt;&amp;&quot;c&apos;");
    }
}
