/// Magritek Spinsolve reader (`acqu.par` + `*.1d` / `*.2d`)

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use ndarray::{ArrayD, IxDyn};
use nmrpipe_io::{float4_words, Endian};

use super::complex::interleaved_conj;
use super::spectrum::{AxisParams, SpectrumData};
use super::{declared_values, read_required, read_required_text, LoadError};

/// Indirect sweep width when `bandwidth2` is absent (Hz)
pub const DEFAULT_SW1: f64 = 50e3;

/// Parse `key = value` lines. Keys are padded with spaces in the file;
/// string values keep their quotes stripped.
pub fn parse_acqu_par(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.split_once('=')?;
            Some((
                key.trim().to_string(),
                value.trim().trim_matches('"').to_string(),
            ))
        })
        .collect()
}

fn number(params: &HashMap<String, String>, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.parse::<f64>().ok())
}

fn required(params: &HashMap<String, String>, key: &str) -> Result<f64, LoadError> {
    number(params, key)
        .ok_or_else(|| LoadError::MalformedContainer(format!("acqu.par has no numeric '{}'", key)))
}

/// Data files of the directory carrying `tag` (".1d" or ".2d"), sorted by name.
pub fn data_files(dir: &Path, tag: &str) -> Result<Vec<PathBuf>, LoadError> {
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|p| {
            p.is_file()
                && p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.contains(tag))
        })
        .collect();
    files.sort();
    Ok(files)
}

/// Trailing `2 * points` floats of the payload, `points` being the product
/// of `dims`.
fn tail_samples(path: &Path, dims: &[usize]) -> Result<Vec<f64>, LoadError> {
    let raw = read_required(path)?;
    let points = declared_values(dims, 8, raw.len())?;
    let floats = float4_words(&raw, Endian::Little);
    if floats.len() < 2 * points {
        return Err(LoadError::Truncated {
            expected: 8 * points,
            got: raw.len(),
        });
    }
    Ok(floats[floats.len() - 2 * points..]
        .iter()
        .map(|&v| f64::from(v))
        .collect())
}

/// Read a Magritek experiment directory.
pub fn read_magritek(dir: &Path, warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let params = parse_acqu_par(&read_required_text(&dir.join("acqu.par"))?);
    let sw = required(&params, "bandwidth")? * 1000.0;
    let td2 = required(&params, "nrPnts")? as usize;
    let freq = required(&params, "b1Freq")? * 1e6;

    let files_2d = data_files(dir, ".2d")?;
    if files_2d.len() == 1 {
        let td1 = required(&params, "nrSteps")? as usize;
        let sw1 = match number(&params, "bandwidth2") {
            Some(bw) => bw * 1000.0,
            None => {
                let msg = format!("acqu.par has no bandwidth2, indirect sweep width set to {} Hz", DEFAULT_SW1);
                log::warn!("{}", msg);
                warnings.push(msg);
                DEFAULT_SW1
            }
        };
        let values = tail_samples(&files_2d[0], &[td1, td2])?;
        let data = ArrayD::from_shape_vec(IxDyn(&[td1, td2]), interleaved_conj(&values))
            .map_err(|e| LoadError::CorruptHeader(e.to_string()))?;
        return Ok(SpectrumData::new(
            data,
            vec![AxisParams::new(freq, sw1, false), AxisParams::new(freq, sw, false)],
        )?);
    }

    let preferred = dir.join("data.1d");
    let file = if preferred.is_file() {
        preferred
    } else {
        data_files(dir, ".1d")?
            .into_iter()
            .next()
            .ok_or(LoadError::MissingFile(preferred))?
    };
    log::debug!("Magritek payload {}", file.display());
    let values = tail_samples(&file, &[td2])?;
    Ok(SpectrumData::from_vec(
        interleaved_conj(&values),
        AxisParams::new(freq, sw, false),
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;

    fn write_floats(path: &Path, values: &[f32]) {
        let raw: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        fs::write(path, raw).unwrap();
    }

    const PAR: &str = "bandwidth                 = 5\nnrPnts                    = 2\nb1Freq                    = 43.5\nnrSteps                   = 2\nSample                    = \"water\"\n";

    #[test]
    fn test_parse_padded_keys() {
        let params = parse_acqu_par(PAR);
        assert_eq!(number(&params, "nrPnts"), Some(2.0));
        assert_eq!(params.get("Sample").map(String::as_str), Some("water"));
    }

    #[test]
    fn test_read_1d_uses_trailing_samples() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acqu.par"), PAR).unwrap();
        write_floats(&dir.path().join("data.1d"), &[9.0, 9.0, 9.0, 1.0, 2.0, 3.0, 4.0]);

        let s = read_magritek(dir.path(), &mut Vec::new()).unwrap();
        assert_eq!(
            s.data().iter().copied().collect::<Vec<_>>(),
            vec![Complex64::new(1.0, -2.0), Complex64::new(3.0, -4.0)]
        );
        assert_eq!(s.sw(), vec![5000.0]);
        assert_eq!(s.freq(), vec![43.5e6]);
    }

    #[test]
    fn test_read_2d_with_default_bandwidth2() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acqu.par"), PAR).unwrap();
        let values: Vec<f32> = (0..8).map(|v| v as f32).collect();
        write_floats(&dir.path().join("exp.2d"), &values);

        let mut warnings = Vec::new();
        let s = read_magritek(dir.path(), &mut warnings).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.data()[[1, 0]], Complex64::new(4.0, -5.0));
        assert_eq!(s.sw(), vec![DEFAULT_SW1, 5000.0]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_missing_payload() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acqu.par"), PAR).unwrap();
        assert!(matches!(
            read_magritek(dir.path(), &mut Vec::new()),
            Err(LoadError::MissingFile(_))
        ));
    }

    #[test]
    fn test_oversized_step_count_with_tiny_payload() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("acqu.par"),
            "bandwidth = 5\nnrPnts = 4294967296\nb1Freq = 43.5\nnrSteps = 4294967296\n",
        )
        .unwrap();
        write_floats(&dir.path().join("exp.2d"), &[1.0, 2.0]);
        assert!(matches!(
            read_magritek(dir.path(), &mut Vec::new()),
            Err(LoadError::CorruptHeader(_))
        ));
    }
}
