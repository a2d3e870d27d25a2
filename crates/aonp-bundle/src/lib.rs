//! Run bundle materialization
//!
//! A bundle is the self-contained on-disk home of one run:
//!
//! ```text
//! <runs_root>/<run_id>/
//!   study_spec.json          canonical bytes, the study's identity
//!   run_manifest.json        pretty-printed creation snapshot
//!   nuclear_data.ref.json    library reference
//!   inputs/                  solver-native files (materials.xml, ...)
//!   outputs/                 produced during execute/extract
//! ```
//!
//! Bundling is pure filesystem + CPU (plus the geometry-script child
//! process); it never touches the run store. Any failure after the run
//! directory is allocated removes the partial directory before returning,
//! so a failed bundle leaves no trace for a retry to trip over.

pub mod geometry;
pub mod solver_xml;

use std::fs;
use std::io::Write;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use tempfile::NamedTempFile;

use aonp_spec::{Geometry, StudySpec, canonical_bytes, spec_hash};

pub use geometry::GEOMETRY_SCRIPT_TIMEOUT;

/// Absolute paths of a freshly created bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundlePaths {
    /// Bundle root directory.
    pub root: Utf8PathBuf,
    /// Solver input directory.
    pub inputs: Utf8PathBuf,
    /// Output directory, empty at creation.
    pub outputs: Utf8PathBuf,
}

/// Bundling failures, classified for the run's structured error.
#[derive(Debug, thiserror::Error)]
pub enum BundleError {
    /// The run directory already exists.
    #[error("bundle directory already exists: {path}")]
    Conflict { path: Utf8PathBuf },

    /// The spec cannot be bundled (e.g. inline geometry).
    #[error("spec not bundleable: {reason}")]
    Validation { reason: String },

    /// The geometry script failed to produce `geometry.xml`.
    #[error("geometry script failed: {reason}")]
    GeometryScript {
        reason: String,
        /// Tail of the script's stderr, when it got far enough to emit any.
        stderr_tail: Option<String>,
    },

    /// Filesystem failure.
    #[error("bundle I/O failed at {path}: {source}")]
    Io {
        path: Utf8PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl BundleError {
    fn io(path: impl Into<Utf8PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }
}

/// Creation-time manifest snapshot. Not modified after creation; the run
/// store is the authority for live state.
#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    run_id: &'a str,
    spec_hash: String,
    created_at: String,
    status: &'static str,
    error: Option<()>,
}

/// Library reference dropped next to the inputs for provenance.
#[derive(Debug, Serialize)]
struct NuclearDataRef<'a> {
    library: &'a str,
    path: &'a str,
    nuclides: Vec<&'a str>,
}

/// Materialize the bundle for `(spec, run_id)` under `runs_root`.
///
/// # Errors
///
/// [`BundleError::Conflict`] when the run directory exists,
/// [`BundleError::Validation`] for specs that cannot be bundled,
/// [`BundleError::GeometryScript`] when the geometry child fails, and
/// [`BundleError::Io`] otherwise. On any failure after the directory is
/// allocated, the partial bundle is removed.
pub fn create_bundle(
    spec: &StudySpec,
    run_id: &str,
    runs_root: &Utf8Path,
) -> Result<BundlePaths, BundleError> {
    // Returned paths are absolute: they outlive the submitting process's
    // working directory (workers and collaborators resolve them later).
    let runs_root = absolutize(runs_root)?;
    let runs_root = runs_root.as_path();
    let root = runs_root.join(run_id);
    if root.exists() {
        return Err(BundleError::Conflict { path: root });
    }
    fs::create_dir_all(runs_root).map_err(BundleError::io(runs_root))?;
    fs::create_dir(&root).map_err(BundleError::io(&root))?;

    match populate(spec, run_id, &root) {
        Ok(paths) => Ok(paths),
        Err(err) => {
            if let Err(cleanup) = fs::remove_dir_all(&root) {
                tracing::warn!(bundle = %root, error = %cleanup, "failed to remove partial bundle");
            }
            Err(err)
        }
    }
}

fn populate(spec: &StudySpec, run_id: &str, root: &Utf8Path) -> Result<BundlePaths, BundleError> {
    let hash = spec_hash(spec);

    write_atomic(&root.join("study_spec.json"), &canonical_bytes(spec))?;

    let manifest = RunManifest {
        run_id,
        spec_hash: hash.to_string(),
        created_at: Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
        status: "created",
        error: None,
    };
    write_atomic(&root.join("run_manifest.json"), pretty_json(&manifest)?.as_bytes())?;

    let mut nuclides: Vec<&str> = spec
        .materials
        .values()
        .flat_map(|m| m.nuclides.iter().map(|n| n.name.as_str()))
        .collect();
    nuclides.sort_unstable();
    nuclides.dedup();
    let data_ref = NuclearDataRef {
        library: &spec.nuclear_data.library,
        path: spec.nuclear_data.cross_sections.as_str(),
        nuclides,
    };
    write_atomic(&root.join("nuclear_data.ref.json"), pretty_json(&data_ref)?.as_bytes())?;

    let inputs = root.join("inputs");
    let outputs = root.join("outputs");
    fs::create_dir(&inputs).map_err(BundleError::io(&inputs))?;
    fs::create_dir(&outputs).map_err(BundleError::io(&outputs))?;

    let materials = solver_xml::materials_xml(spec);
    write_atomic(&inputs.join("materials.xml"), materials.as_bytes())?;
    write_atomic(&inputs.join("settings.xml"), solver_xml::settings_xml(&spec.settings).as_bytes())?;

    match &spec.geometry {
        Geometry::Script { path, entry } => {
            geometry::run_geometry_script(path, entry, &inputs, &canonical_materials(spec)?)?;
        }
        Geometry::Inline { .. } => {
            return Err(BundleError::Validation {
                reason: "inline geometry is not executable; reference a geometry script"
                    .to_string(),
            });
        }
    }

    Ok(BundlePaths { root: root.to_path_buf(), inputs, outputs })
}

fn absolutize(path: &Utf8Path) -> Result<Utf8PathBuf, BundleError> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    let cwd = std::env::current_dir().map_err(BundleError::io(path))?;
    let cwd = Utf8PathBuf::from_path_buf(cwd).map_err(|p| BundleError::Validation {
        reason: format!("working directory is not UTF-8: {}", p.display()),
    })?;
    Ok(cwd.join(path))
}

/// Canonical JSON of the materials map, fed to the geometry script so its
/// output is a pure function of material content.
fn canonical_materials(spec: &StudySpec) -> Result<Vec<u8>, BundleError> {
    let value = serde_json::to_value(&spec.materials)
        .map_err(|e| BundleError::Validation { reason: e.to_string() })?;
    serde_json_canonicalizer::to_vec(&value)
        .map_err(|e| BundleError::Validation { reason: e.to_string() })
}

fn pretty_json<T: Serialize>(value: &T) -> Result<String, BundleError> {
    serde_json::to_string_pretty(value)
        .map(|mut text| {
            text.push('\n');
            text
        })
        .map_err(|e| BundleError::Validation { reason: e.to_string() })
}

/// Tempfile-then-rename write so a crash never leaves a half-written
/// bundle file behind.
fn write_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), BundleError> {
    let dir = path.parent().unwrap_or(Utf8Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir.as_std_path()).map_err(BundleError::io(path))?;
    tmp.write_all(content).map_err(BundleError::io(path))?;
    tmp.as_file().sync_all().map_err(BundleError::io(path))?;
    tmp.persist(path.as_std_path())
        .map_err(|e| BundleError::Io { path: path.to_path_buf(), source: e.error })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

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
      - { name: H1, fraction: 0.6667 }
      - { name: O16, fraction: 0.3333 }
geometry:
  type: script
  path: SCRIPT
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

    /// Drop an executable geometry script into `dir` that writes a fixed
    /// geometry.xml, and point the spec at it.
    fn with_stub_script(dir: &Utf8Path) -> StudySpec {
        let script = dir.join("geom.sh");
        fs::write(
            &script,
            "#!/bin/sh\n# args: entry-point output-file; materials JSON on stdin\ncat > /dev/null\nprintf '<geometry><cell id=\"1\"/></geometry>\\n' > \"$2\"\n",
        )
        .unwrap();
        fs::set_permissions(script.as_std_path(), fs::Permissions::from_mode(0o755)).unwrap();
        let mut spec = pincell();
        spec.geometry = Geometry::Script { path: script, entry: "build".to_string() };
        spec
    }

    #[test]
    fn test_bundle_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let spec = with_stub_script(runs_root);
        let paths = create_bundle(&spec, "run-1", runs_root).unwrap();

        assert!(paths.root.join("study_spec.json").is_file());
        assert!(paths.root.join("run_manifest.json").is_file());
        assert!(paths.root.join("nuclear_data.ref.json").is_file());
        assert!(paths.inputs.join("materials.xml").is_file());
        assert!(paths.inputs.join("settings.xml").is_file());
        assert!(paths.inputs.join("geometry.xml").is_file());
        assert!(paths.inputs.join("geom.sh").is_file(), "script copied for provenance");
        assert!(paths.outputs.is_dir());
        assert_eq!(fs::read_dir(paths.outputs.as_std_path()).unwrap().count(), 0);

        // study_spec.json carries the canonical bytes exactly.
        let on_disk = fs::read(paths.root.join("study_spec.json").as_std_path()).unwrap();
        assert_eq!(on_disk, canonical_bytes(&spec));

        // Manifest is pretty-printed with the created status.
        let manifest = fs::read_to_string(paths.root.join("run_manifest.json").as_std_path())
            .unwrap();
        assert!(manifest.contains("\n  \"run_id\""), "2-space indent");
        assert!(manifest.contains("\"status\": \"created\""));
        assert!(manifest.contains(&spec_hash(&spec).to_string()));
    }

    #[test]
    fn test_bundle_determinism_across_run_ids() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let spec = with_stub_script(runs_root);
        let a = create_bundle(&spec, "run-a", runs_root).unwrap();
        let b = create_bundle(&spec, "run-b", runs_root).unwrap();
        for file in ["study_spec.json", "nuclear_data.ref.json"] {
            let left = fs::read(a.root.join(file).as_std_path()).unwrap();
            let right = fs::read(b.root.join(file).as_std_path()).unwrap();
            assert_eq!(left, right, "{file} must be byte-identical across runs");
        }
        let left = fs::read(a.inputs.join("materials.xml").as_std_path()).unwrap();
        let right = fs::read(b.inputs.join("materials.xml").as_std_path()).unwrap();
        assert_eq!(left, right, "materials.xml must be byte-identical across runs");
    }

    #[test]
    fn test_existing_directory_conflicts() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let spec = with_stub_script(runs_root);
        fs::create_dir_all(runs_root.join("run-1").as_std_path()).unwrap();
        assert!(matches!(
            create_bundle(&spec, "run-1", runs_root),
            Err(BundleError::Conflict { .. })
        ));
    }

    #[test]
    fn test_failed_bundle_removes_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let mut spec = pincell();
        // Script path that does not exist.
        spec.geometry = Geometry::Script {
            path: runs_root.join("missing.sh"),
            entry: "build".to_string(),
        };
        let err = create_bundle(&spec, "run-1", runs_root).unwrap_err();
        assert!(matches!(err, BundleError::GeometryScript { .. }), "got: {err}");
        assert!(!runs_root.join("run-1").exists(), "partial bundle must be cleaned up");
    }

    #[test]
    fn test_inline_geometry_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let mut spec = pincell();
        spec.geometry = Geometry::Inline { definition: serde_json::json!({"cells": []}) };
        assert!(matches!(
            create_bundle(&spec, "run-1", runs_root),
            Err(BundleError::Validation { .. })
        ));
        assert!(!runs_root.join("run-1").exists());
    }

    #[test]
    fn test_script_failure_reports_stderr_tail() {
        let tmp = tempfile::tempdir().unwrap();
        let runs_root = Utf8Path::from_path(tmp.path()).unwrap();
        let script = runs_root.join("bad.sh");
        fs::write(&script, "#!/bin/sh\necho 'no such surface: fuel_or' >&2\nexit 3\n").unwrap();
        fs::set_permissions(script.as_std_path(), fs::Permissions::from_mode(0o755)).unwrap();
        let mut spec = pincell();
        spec.geometry = Geometry::Script { path: script, entry: "build".to_string() };
        match create_bundle(&spec, "run-1", runs_root) {
            Err(BundleError::GeometryScript { stderr_tail: Some(tail), .. }) => {
                assert!(tail.contains("no such surface"), "tail: {tail}");
            }
            other => panic!("expected GeometryScript with stderr tail, got: {other:?}"),
        }
    }
}
