//! MATLAB `.mat` container.
//!
//! Two on-disk layouts share one intermediate tree: MAT v5 tagged elements
//! (`mat5`) and the HDF5-based v7.3 layout (`hdf5`). Both decoders produce
//! [`MatValue`] with MATLAB dimension order and column-major element order,
//! so a single mapping function turns either into a `SpectrumData`.

pub mod hdf5;
pub mod mat5;

use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn, ShapeBuilder};
use num_complex::Complex64;

use super::spectrum::{AxisParams, SpectrumData};
use super::{read_required, LoadError, SaveError};

/// Numeric (or logical) array in MATLAB order.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericArray {
    pub dims: Vec<usize>,
    pub re: Vec<f64>,
    pub im: Option<Vec<f64>>,
}

/// Decoded MATLAB value.
#[derive(Debug, Clone, PartialEq)]
pub enum MatValue {
    Numeric(NumericArray),
    /// UTF-16 code units, column-major.
    Char { dims: Vec<usize>, units: Vec<u16> },
    Cell { dims: Vec<usize>, items: Vec<MatValue> },
    /// First element of a struct array, fields in file order.
    Struct(Vec<(String, MatValue)>),
}

impl MatValue {
    pub fn real(dims: Vec<usize>, re: Vec<f64>) -> Self {
        MatValue::Numeric(NumericArray { dims, re, im: None })
    }

    pub fn text(s: &str) -> Self {
        let units: Vec<u16> = s.encode_utf16().collect();
        MatValue::Char {
            dims: vec![1, units.len()],
            units,
        }
    }

    pub fn field(&self, name: &str) -> Option<&MatValue> {
        match self {
            MatValue::Struct(fields) => fields.iter().find(|(n, _)| n == name).map(|(_, v)| v),
            _ => None,
        }
    }

    /// All elements of a numeric value, column-major.
    pub fn numbers(&self) -> Option<&[f64]> {
        match self {
            MatValue::Numeric(a) => Some(&a.re),
            _ => None,
        }
    }

    /// Rows of a char matrix, or the strings of a cell array.
    pub fn strings(&self) -> Option<Vec<String>> {
        match self {
            MatValue::Char { dims, units } => {
                let rows = dims.first().copied().unwrap_or(0);
                if rows == 0 || units.is_empty() {
                    return Some(Vec::new());
                }
                let cols = units.len() / rows;
                Some(
                    (0..rows)
                        .map(|r| {
                            let row: Vec<u16> = (0..cols).map(|c| units[r + rows * c]).collect();
                            String::from_utf16_lossy(&row)
                                .trim_end_matches(|c| c == ' ' || c == '\0')
                                .to_string()
                        })
                        .collect(),
                )
            }
            MatValue::Cell { items, .. } => items
                .iter()
                .map(|item| item.strings().map(|rows| rows.join("")))
                .collect(),
            _ => None,
        }
    }

    /// Per-axis vectors: the items of a cell array, or the rows (or columns)
    /// of a matrix with `count` rows (columns).
    pub fn vectors(&self, count: usize) -> Option<Vec<Vec<f64>>> {
        match self {
            MatValue::Cell { items, .. } => items
                .iter()
                .map(|item| item.numbers().map(<[f64]>::to_vec))
                .collect(),
            MatValue::Numeric(a) => {
                let rows = a.dims.first().copied().unwrap_or(0);
                if rows == 0 {
                    return Some(Vec::new());
                }
                let cols = a.re.len() / rows;
                if rows == count {
                    Some(
                        (0..rows)
                            .map(|r| (0..cols).map(|c| a.re[r + rows * c]).collect())
                            .collect(),
                    )
                } else if cols == count {
                    Some(a.re.chunks(rows).map(<[f64]>::to_vec).collect())
                } else {
                    None
                }
            }
            _ => None,
        }
    }
}

// ────────────────────────────────────────────────────────────────
//  Version dispatch
// ────────────────────────────────────────────────────────────────

/// Version number written at characters 7..10 of the text header
/// (`MATLAB 5.0 MAT-file ...`, `MATLAB 7.3 MAT-file ...`).
pub fn mat_version(head: &[u8]) -> Option<f64> {
    let field = head.get(7..10)?;
    std::str::from_utf8(field).ok()?.trim().parse::<f64>().ok()
}

/// Decode the first variable of a MAT file of either layout.
pub fn read_variable(bytes: &[u8]) -> Result<(String, MatValue), LoadError> {
    let version = bytes
        .get(..13)
        .and_then(mat_version)
        .ok_or_else(|| LoadError::MalformedContainer("MAT header carries no version".into()))?;
    log::debug!("MAT version {}", version);
    let variables = if version < 7.3 {
        mat5::parse(bytes)?
    } else {
        hdf5::parse_mat73(bytes)?
    };
    variables
        .into_iter()
        .next()
        .ok_or_else(|| LoadError::MalformedContainer("MAT file holds no variables".into()))
}

pub fn read_matlab(path: &Path, _warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let bytes = read_required(path)?;
    let (name, value) = read_variable(&bytes)?;
    log::info!("MAT variable '{}' read from {}", name, path.display());
    spectrum_from_mat(&value)
}

// ────────────────────────────────────────────────────────────────
//  Mapping
// ────────────────────────────────────────────────────────────────

fn missing(name: &str) -> LoadError {
    LoadError::MalformedContainer(format!("MAT struct has no usable '{}' field", name))
}

fn per_axis(value: &MatValue, name: &str, ndim: usize) -> Result<Vec<f64>, LoadError> {
    let v = value.field(name).and_then(MatValue::numbers).ok_or_else(|| missing(name))?;
    if v.len() != ndim {
        return Err(LoadError::MalformedContainer(format!(
            "'{}' has {} entries for {} dimensions",
            name,
            v.len(),
            ndim
        )));
    }
    Ok(v.to_vec())
}

/// Build a dataset from the struct stored in a MAT file.
pub fn spectrum_from_mat(value: &MatValue) -> Result<SpectrumData, LoadError> {
    let ndim = value
        .field("dim")
        .and_then(MatValue::numbers)
        .and_then(|v| v.first().copied())
        .filter(|&d| d >= 1.0)
        .ok_or_else(|| missing("dim"))? as usize;
    let data = match value.field("data") {
        Some(MatValue::Numeric(a)) => a,
        _ => return Err(missing("data")),
    };

    let shape: Vec<usize> = if ndim == 1 {
        vec![data.re.len()]
    } else {
        let mut dims = data.dims.clone();
        while dims.len() > ndim && dims.last() == Some(&1) {
            dims.pop();
        }
        dims.resize(ndim, 1);
        dims
    };
    if shape.iter().product::<usize>() != data.re.len() {
        return Err(LoadError::MalformedContainer(format!(
            "data dimensions {:?} do not match dim = {}",
            data.dims, ndim
        )));
    }
    let samples: Vec<Complex64> = match &data.im {
        Some(im) => data.re.iter().zip(im).map(|(&r, &i)| Complex64::new(r, i)).collect(),
        None => data.re.iter().map(|&r| Complex64::new(r, 0.0)).collect(),
    };
    let array = ArrayD::from_shape_vec(IxDyn(&shape).f(), samples)
        .map_err(|e| LoadError::MalformedContainer(e.to_string()))?
        .as_standard_layout()
        .into_owned();

    let freq = per_axis(value, "freq", ndim)?;
    let sw = per_axis(value, "sw", ndim)?;
    let spec = per_axis(value, "spec", ndim)?;
    let whole_echo = per_axis(value, "wholeEcho", ndim)?;
    let reference = per_axis(value, "ref", ndim)?;
    let xax = value
        .field("xaxArray")
        .and_then(|v| v.vectors(ndim))
        .filter(|v| v.len() == ndim)
        .ok_or_else(|| missing("xaxArray"))?;
    let history = match value.field("history") {
        Some(h) => h.strings().ok_or_else(|| missing("history"))?,
        None => Vec::new(),
    };

    let axes = (0..ndim)
        .map(|i| AxisParams {
            freq: freq[i],
            sw: sw[i],
            spec: spec[i] != 0.0,
            whole_echo: whole_echo[i] != 0.0,
            reference: if reference[i].is_nan() { None } else { Some(reference[i]) },
            xax: xax[i].clone(),
        })
        .collect();
    let mut spectrum = SpectrumData::new(array, axes)?;
    spectrum.set_history(history);
    Ok(spectrum)
}

/// MATLAB identifier derived from a workspace name.
pub fn variable_name(workspace: &str) -> String {
    let mut name: String = workspace
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    if !name.starts_with(|c: char| c.is_ascii_alphabetic()) {
        name.insert_str(0, "x_");
    }
    name.truncate(63);
    name
}

/// Struct layout written for a dataset.
pub fn spectrum_to_mat(spectrum: &SpectrumData) -> MatValue {
    let ndim = spectrum.ndim();
    let row = |v: Vec<f64>| MatValue::real(vec![1, v.len()], v);
    let flags = |v: Vec<bool>| row(v.into_iter().map(|b| if b { 1.0 } else { 0.0 }).collect());

    let dims = if ndim == 1 {
        vec![1, spectrum.shape()[0]]
    } else {
        spectrum.shape().to_vec()
    };
    // column-major element order
    let transposed = spectrum.data().t();
    let data = NumericArray {
        dims,
        re: transposed.iter().map(|c| c.re).collect(),
        im: Some(transposed.iter().map(|c| c.im).collect()),
    };
    let history: Vec<MatValue> = spectrum.history().iter().map(|h| MatValue::text(h)).collect();
    let xax: Vec<MatValue> = spectrum.axes().iter().map(|a| row(a.xax.clone())).collect();

    MatValue::Struct(vec![
        ("dim".into(), MatValue::real(vec![1, 1], vec![ndim as f64])),
        ("data".into(), MatValue::Numeric(data)),
        ("freq".into(), row(spectrum.freq())),
        ("sw".into(), row(spectrum.sw())),
        ("spec".into(), flags(spectrum.spec())),
        ("wholeEcho".into(), flags(spectrum.whole_echo())),
        (
            "ref".into(),
            row(spectrum.reference().into_iter().map(|r| r.unwrap_or(f64::NAN)).collect()),
        ),
        (
            "history".into(),
            MatValue::Cell {
                dims: vec![1, history.len()],
                items: history,
            },
        ),
        (
            "xaxArray".into(),
            MatValue::Cell {
                dims: vec![1, xax.len()],
                items: xax,
            },
        ),
    ])
}

/// Save a dataset as a MAT v5 file holding one struct variable.
pub fn write_matlab(spectrum: &SpectrumData, workspace: &str, path: &Path) -> Result<(), SaveError> {
    let bytes = mat5::encode_file(&variable_name(workspace), &spectrum_to_mat(spectrum));
    fs::write(path, bytes)?;
    log::info!("MAT file written to {}", path.display());
    Ok(())
}
