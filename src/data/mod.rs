/// Format parsers and writers producing the canonical dataset
///
/// Every parser takes the resolved path plus a warning sink and returns a
/// `SpectrumData` or a `LoadError`. A missing optional companion file is a
/// warning with a documented default, never an error.

pub mod bruker;
pub mod chemagnetics;
pub mod interchange;
pub mod magritek;
pub mod matlab;
pub mod nmrpipe_format;
pub mod reference;
pub mod simpson;
pub mod spectrum;
pub mod varian;

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

use spectrum::ShapeError;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("no loader found for {}", .0.display())]
    UnrecognizedFormat(PathBuf),
    #[error("required file missing: {}", .0.display())]
    MissingFile(PathBuf),
    #[error("malformed container: {0}")]
    MalformedContainer(String),
    #[error("{0}")]
    InvalidReference(String),
    #[error("corrupt header: {0}")]
    CorruptHeader(String),
    #[error("unsupported: {0}")]
    Unsupported(String),
    #[error("data truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("inconsistent dataset: {0}")]
    Shape(#[from] ShapeError),
}

impl LoadError {
    /// Header arithmetic went wrong while decoding; the rest are ordinary
    /// per-load failures.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::CorruptHeader(_))
    }
}

/// Failure to write a dataset in one of the supported containers.
#[derive(Error, Debug)]
pub enum SaveError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("formatting error: {0}")]
    Fmt(#[from] std::fmt::Error),
    #[error("cannot save: {0}")]
    Unsupported(String),
}

/// Read a file the load cannot proceed without.
pub(crate) fn read_required(path: &Path) -> Result<Vec<u8>, LoadError> {
    fs::read(path).map_err(|e| missing_or_io(path, e))
}

/// Read a required text file.
pub(crate) fn read_required_text(path: &Path) -> Result<String, LoadError> {
    let bytes = read_required(path)?;
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

/// Read an optional text file, recording a warning when it is absent.
pub(crate) fn read_optional_text(
    path: &Path,
    warnings: &mut Vec<String>,
    fallback: &str,
) -> Option<String> {
    match fs::read(path) {
        Ok(bytes) => Some(String::from_utf8_lossy(&bytes).into_owned()),
        Err(e) => {
            let msg = format!("{} could not be read ({}), {}", path.display(), e, fallback);
            log::warn!("{}", msg);
            warnings.push(msg);
            None
        }
    }
}

/// Zero padding a reader may add after a short payload before the file is
/// treated as truncated.
pub(crate) const PAD_TOLERANCE_BYTES: usize = 1 << 20;

/// Number of values a header declares (product of `dims`), checked against
/// the `available` payload bytes at `width` bytes per value.
///
/// Overflow is a corrupt header; a payload short by more than
/// [`PAD_TOLERANCE_BYTES`] is truncated.
pub(crate) fn declared_values(dims: &[usize], width: usize, available: usize) -> Result<usize, LoadError> {
    let overflow = || LoadError::CorruptHeader(format!("declared size {:?} overflows", dims));
    let count = dims
        .iter()
        .try_fold(1usize, |acc, &d| acc.checked_mul(d))
        .ok_or_else(overflow)?;
    let bytes = count.checked_mul(width).ok_or_else(overflow)?;
    if bytes > available.saturating_add(PAD_TOLERANCE_BYTES) {
        return Err(LoadError::Truncated {
            expected: bytes,
            got: available,
        });
    }
    Ok(count)
}

fn missing_or_io(path: &Path, e: io::Error) -> LoadError {
    if e.kind() == io::ErrorKind::NotFound {
        LoadError::MissingFile(path.to_path_buf())
    } else {
        LoadError::Io(e)
    }
}

/// Split complex samples into a vector from interleaved or blocked values.
pub(crate) mod complex {
    use num_complex::Complex64;

    /// `re[even] - i*im[odd]`: receiver convention shared by Varian,
    /// Magritek and processed Bruker data.
    pub fn interleaved_conj(values: &[f64]) -> Vec<Complex64> {
        values
            .chunks_exact(2)
            .map(|p| Complex64::new(p[0], -p[1]))
            .collect()
    }

    /// `re[even] + i*im[odd]`.
    pub fn interleaved(values: &[f64]) -> Vec<Complex64> {
        values
            .chunks_exact(2)
            .map(|p| Complex64::new(p[0], p[1]))
            .collect()
    }

    /// First half real, second half imaginary.
    pub fn blocked(values: &[f64]) -> Vec<Complex64> {
        let half = values.len() / 2;
        values[..half]
            .iter()
            .zip(&values[half..2 * half])
            .map(|(&re, &im)| Complex64::new(re, im))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_declared_values_within_payload() {
        assert_eq!(declared_values(&[2, 3, 4], 4, 96).unwrap(), 24);
        // a short payload is padded up to the tolerance
        assert_eq!(declared_values(&[1024], 8, 16).unwrap(), 1024);
    }

    #[test]
    fn test_declared_values_rejects_oversized_header() {
        assert!(matches!(
            declared_values(&[1 << 30, 1 << 30, 1 << 30], 4, 32),
            Err(LoadError::CorruptHeader(_))
        ));
        match declared_values(&[1 << 40], 8, 16) {
            Err(LoadError::Truncated { expected, got }) => {
                assert_eq!(expected, 8 << 40);
                assert_eq!(got, 16);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
