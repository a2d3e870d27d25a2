//! Statepoint container codec
//!
//! The solver contract is a flat little-endian container of named scalar
//! datasets:
//!
//! ```text
//! magic    4 bytes  "MCSP"
//! version  u32
//! count    u32
//! entry*   name_len u16, name (UTF-8), dtype u8 (0 = f64, 1 = i64), value 8 bytes
//! ```
//!
//! The reader tolerates unknown dataset names (forward compatibility for
//! tallies) but not unknown dtypes or a version bump. The writer exists
//! for the solver stub and for tests; production statepoints come from
//! the solver itself.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use camino::Utf8Path;

use crate::ExtractError;

/// Container magic.
const MAGIC: [u8; 4] = *b"MCSP";
/// Highest format version this reader understands.
const FORMAT_VERSION: u32 = 1;
/// Cap on a single dataset name, to bound reads on corrupt files.
const MAX_NAME_LEN: usize = 1_024;
/// Cap on the dataset count, same reason.
const MAX_DATASETS: u32 = 65_536;

/// One scalar dataset value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DatasetValue {
    /// 64-bit float dataset.
    F64(f64),
    /// 64-bit signed integer dataset.
    I64(i64),
}

/// Parsed statepoint container.
#[derive(Debug, Clone, Default)]
pub struct Statepoint {
    /// Datasets by name.
    pub datasets: BTreeMap<String, DatasetValue>,
}

impl Statepoint {
    /// Fetch a required f64 dataset.
    ///
    /// # Errors
    ///
    /// `MissingDataset` when absent, `WrongType` when it is an integer.
    pub fn f64_dataset(&self, name: &'static str) -> Result<f64, ExtractError> {
        match self.datasets.get(name) {
            Some(DatasetValue::F64(value)) => Ok(*value),
            Some(DatasetValue::I64(_)) => Err(ExtractError::WrongType { name }),
            None => Err(ExtractError::MissingDataset { name }),
        }
    }

    /// Fetch a required i64 dataset.
    ///
    /// # Errors
    ///
    /// `MissingDataset` when absent, `WrongType` when it is a float.
    pub fn i64_dataset(&self, name: &'static str) -> Result<i64, ExtractError> {
        match self.datasets.get(name) {
            Some(DatasetValue::I64(value)) => Ok(*value),
            Some(DatasetValue::F64(_)) => Err(ExtractError::WrongType { name }),
            None => Err(ExtractError::MissingDataset { name }),
        }
    }
}

/// Read and parse a statepoint container.
///
/// # Errors
///
/// `Open` when the file cannot be read, `BadMagic`/`UnsupportedVersion`/
/// `Truncated` for corrupt or foreign files.
pub fn read_statepoint(path: &Utf8Path) -> Result<Statepoint, ExtractError> {
    let file = File::open(path.as_std_path())
        .map_err(|source| ExtractError::Open { path: path.to_path_buf(), source })?;
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader
        .read_exact(&mut magic)
        .map_err(|_| ExtractError::Truncated { reason: "missing header".to_string() })?;
    if magic != MAGIC {
        return Err(ExtractError::BadMagic { found: magic });
    }
    let version = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| ExtractError::Truncated { reason: "missing version".to_string() })?;
    if version != FORMAT_VERSION {
        return Err(ExtractError::UnsupportedVersion { version });
    }
    let count = reader
        .read_u32::<LittleEndian>()
        .map_err(|_| ExtractError::Truncated { reason: "missing dataset count".to_string() })?;
    if count > MAX_DATASETS {
        return Err(ExtractError::Truncated {
            reason: format!("implausible dataset count {count}"),
        });
    }

    let mut datasets = BTreeMap::new();
    for index in 0..count {
        let name_len = reader.read_u16::<LittleEndian>().map_err(|_| {
            ExtractError::Truncated { reason: format!("dataset {index}: missing name length") }
        })? as usize;
        if name_len == 0 || name_len > MAX_NAME_LEN {
            return Err(ExtractError::Truncated {
                reason: format!("dataset {index}: bad name length {name_len}"),
            });
        }
        let mut name_bytes = vec![0u8; name_len];
        reader.read_exact(&mut name_bytes).map_err(|_| ExtractError::Truncated {
            reason: format!("dataset {index}: missing name"),
        })?;
        let name = String::from_utf8(name_bytes).map_err(|_| ExtractError::Truncated {
            reason: format!("dataset {index}: name is not UTF-8"),
        })?;
        let dtype = reader.read_u8().map_err(|_| ExtractError::Truncated {
            reason: format!("dataset '{name}': missing dtype"),
        })?;
        let value = match dtype {
            0 => DatasetValue::F64(reader.read_f64::<LittleEndian>().map_err(|_| {
                ExtractError::Truncated { reason: format!("dataset '{name}': missing value") }
            })?),
            1 => DatasetValue::I64(reader.read_i64::<LittleEndian>().map_err(|_| {
                ExtractError::Truncated { reason: format!("dataset '{name}': missing value") }
            })?),
            other => {
                return Err(ExtractError::Truncated {
                    reason: format!("dataset '{name}': unknown dtype {other}"),
                });
            }
        };
        datasets.insert(name, value);
    }

    Ok(Statepoint { datasets })
}

/// Write a statepoint container. Used by the solver stub and by tests.
///
/// # Errors
///
/// `Open` on any I/O failure.
pub fn write_statepoint(path: &Utf8Path, statepoint: &Statepoint) -> Result<(), ExtractError> {
    let open_err =
        |source: std::io::Error| ExtractError::Open { path: path.to_path_buf(), source };
    let file = File::create(path.as_std_path()).map_err(open_err)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(&MAGIC).map_err(open_err)?;
    writer.write_u32::<LittleEndian>(FORMAT_VERSION).map_err(open_err)?;
    writer.write_u32::<LittleEndian>(statepoint.datasets.len() as u32).map_err(open_err)?;
    for (name, value) in &statepoint.datasets {
        writer.write_u16::<LittleEndian>(name.len() as u16).map_err(open_err)?;
        writer.write_all(name.as_bytes()).map_err(open_err)?;
        match value {
            DatasetValue::F64(v) => {
                writer.write_u8(0).map_err(open_err)?;
                writer.write_f64::<LittleEndian>(*v).map_err(open_err)?;
            }
            DatasetValue::I64(v) => {
                writer.write_u8(1).map_err(open_err)?;
                writer.write_i64::<LittleEndian>(*v).map_err(open_err)?;
            }
        }
    }
    writer.flush().map_err(open_err)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Statepoint {
        let mut datasets = BTreeMap::new();
        datasets.insert("keff/mean".to_string(), DatasetValue::F64(1.62));
        datasets.insert("keff/std_dev".to_string(), DatasetValue::F64(0.004));
        datasets.insert("n_batches".to_string(), DatasetValue::I64(120));
        Statepoint { datasets }
    }

    #[test]
    fn test_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("statepoint.120.h5");
        write_statepoint(&path, &sample()).unwrap();
        let back = read_statepoint(&path).unwrap();
        assert_eq!(back.datasets, sample().datasets);
    }

    #[test]
    fn test_foreign_file_has_bad_magic() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("summary.h5");
        std::fs::write(path.as_std_path(), b"\x89HDF\r\n\x1a\nrest").unwrap();
        assert!(matches!(read_statepoint(&path), Err(ExtractError::BadMagic { .. })));
    }

    #[test]
    fn test_truncated_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("statepoint.1.h5");
        write_statepoint(&path, &sample()).unwrap();
        let bytes = std::fs::read(path.as_std_path()).unwrap();
        std::fs::write(path.as_std_path(), &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(read_statepoint(&path), Err(ExtractError::Truncated { .. })));
    }

    #[test]
    fn test_version_bump_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("statepoint.1.h5");
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"MCSP");
        bytes.extend_from_slice(&2u32.to_le_bytes());
        bytes.extend_from_slice(&0u32.to_le_bytes());
        std::fs::write(path.as_std_path(), &bytes).unwrap();
        assert!(matches!(
            read_statepoint(&path),
            Err(ExtractError::UnsupportedVersion { version: 2 })
        ));
    }

    #[test]
    fn test_missing_file_is_open_error() {
        let path = Utf8Path::new("/nonexistent/statepoint.1.h5");
        assert!(matches!(read_statepoint(path), Err(ExtractError::Open { .. })));
    }

    #[test]
    fn test_unknown_datasets_are_tolerated() {
        let tmp = tempfile::tempdir().unwrap();
        let path = Utf8Path::from_path(tmp.path()).unwrap().join("statepoint.1.h5");
        let mut statepoint = sample();
        statepoint
            .datasets
            .insert("tallies/flux/mean".to_string(), DatasetValue::F64(3.1));
        write_statepoint(&path, &statepoint).unwrap();
        let back = read_statepoint(&path).unwrap();
        assert_eq!(back.f64_dataset("keff/mean").unwrap(), 1.62);
        assert_eq!(back.datasets.len(), 4);
    }
}
