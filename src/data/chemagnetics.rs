/// Chemagnetics / Varian Spinsight reader (`acq` + `data`)

use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use nmrpipe_io::{int4_words, Endian};

use super::complex::blocked;
use super::spectrum::{AxisParams, SpectrumData};
use super::{declared_values, read_optional_text, read_required, read_required_text, LoadError};

/// Indirect sweep width when `dw2` is absent (Hz)
pub const DEFAULT_SW1: f64 = 50e3;

/// Parse `key=value` lines; keys and values are trimmed.
pub fn parse_acq(content: &str) -> HashMap<String, String> {
    content
        .lines()
        .filter_map(|line| {
            let (key, value) = line.trim().split_once('=')?;
            Some((key.trim().to_string(), value.trim().to_string()))
        })
        .collect()
}

/// Dwell time in seconds from a value like `10u` or `2.5m`.
fn dwell_seconds(raw: &str) -> Option<f64> {
    let (number, scale) = match raw.chars().last()? {
        'n' => (&raw[..raw.len() - 1], 1e-9),
        'u' => (&raw[..raw.len() - 1], 1e-6),
        'm' => (&raw[..raw.len() - 1], 1e-3),
        's' => (&raw[..raw.len() - 1], 1.0),
        _ => (raw, 1.0),
    };
    number.trim().parse::<f64>().ok().map(|v| v * scale)
}

fn required<'a>(acq: &'a HashMap<String, String>, key: &str) -> Result<&'a str, LoadError> {
    acq.get(key)
        .map(String::as_str)
        .ok_or_else(|| LoadError::MalformedContainer(format!("acq has no '{}' entry", key)))
}

fn parse_number(acq: &HashMap<String, String>, key: &str) -> Result<f64, LoadError> {
    required(acq, key)?
        .parse::<f64>()
        .map_err(|_| LoadError::MalformedContainer(format!("acq '{}' is not a number", key)))
}

/// Number of rows in the indirect dimension plus its sweep width.
fn indirect_axis(
    dir: &Path,
    acq: &HashMap<String, String>,
    warnings: &mut Vec<String>,
) -> Result<(usize, f64), LoadError> {
    let arrayed: Vec<usize> = acq
        .iter()
        .filter(|(k, _)| k.contains("array_num_values_"))
        .filter_map(|(_, v)| v.parse::<f64>().ok().map(|n| n as usize))
        .collect();
    if !arrayed.is_empty() {
        let acq_2 = read_optional_text(&dir.join("acq_2"), warnings, "arrays treated as unused");
        if acq_2.is_some_and(|text| text.contains("use_array=1")) {
            let rows = arrayed
                .iter()
                .try_fold(1usize, |acc, &n| acc.checked_mul(n))
                .ok_or_else(|| LoadError::CorruptHeader(format!("array sizes {:?} overflow", arrayed)))?;
            return Ok((rows, DEFAULT_SW1));
        }
    }

    let Some(td1) = acq.get("al2").and_then(|v| v.parse::<f64>().ok()) else {
        return Ok((1, DEFAULT_SW1));
    };
    let td1 = td1 as usize;
    match acq.get("dw2").and_then(|v| dwell_seconds(v)) {
        Some(dw2) if dw2 > 0.0 => Ok((td1, 1.0 / dw2)),
        _ => {
            if td1 > 1 {
                let msg = format!("no usable dw2 in acq, indirect sweep width set to {} Hz", DEFAULT_SW1);
                log::warn!("{}", msg);
                warnings.push(msg);
            }
            Ok((td1, DEFAULT_SW1))
        }
    }
}

/// Read a Chemagnetics directory.
pub fn read_chemagnetics(dir: &Path, warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let acq = parse_acq(&read_required_text(&dir.join("acq"))?);

    let td2 = parse_number(&acq, "al")? as usize;
    let channel = required(&acq, "ch1")?;
    let freq = parse_number(&acq, &format!("sf{}", channel))? * 1e6;
    let dw = dwell_seconds(required(&acq, "dw")?)
        .filter(|&d| d > 0.0)
        .ok_or_else(|| LoadError::MalformedContainer("acq 'dw' is not a dwell time".into()))?;
    let sw = 1.0 / dw;
    let (td1, sw1) = indirect_axis(dir, &acq, warnings)?;

    let data_path = dir.join("data");
    let raw = read_required(&data_path)?;
    let words: Vec<f64> = int4_words(&raw, Endian::Big)
        .into_iter()
        .map(f64::from)
        .collect();
    // one real and one imaginary int32 per point
    let points = declared_values(&[td1, td2], 8, raw.len())?;
    if words.len() < 2 * points {
        return Err(LoadError::Truncated {
            expected: 8 * points,
            got: raw.len(),
        });
    }
    if words.len() > 2 * points {
        let msg = format!(
            "{} holds {} words, {} expected; halves split at the midpoint",
            data_path.display(),
            words.len(),
            2 * points
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    }
    let mut samples = blocked(&words);
    samples.truncate(points);

    if td1 == 1 {
        return Ok(SpectrumData::from_vec(samples, AxisParams::new(freq, sw, false))?);
    }
    let data = ArrayD::from_shape_vec(IxDyn(&[td1, td2]), samples)
        .map_err(|e| LoadError::CorruptHeader(e.to_string()))?;
    Ok(SpectrumData::new(
        data,
        vec![AxisParams::new(freq, sw1, false), AxisParams::new(freq, sw, false)],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use num_complex::Complex64;
    use std::fs;

    fn write_data(dir: &Path, words: &[i32]) {
        let raw: Vec<u8> = words.iter().flat_map(|w| w.to_be_bytes()).collect();
        fs::write(dir.join("data"), raw).unwrap();
    }

    #[test]
    fn test_dwell_units() {
        assert_eq!(dwell_seconds("10u"), Some(10e-6));
        assert_eq!(dwell_seconds("2m"), Some(2e-3));
        assert_eq!(dwell_seconds("0.5"), Some(0.5));
        assert_eq!(dwell_seconds("xu"), None);
    }

    #[test]
    fn test_read_1d() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acq"), "al=2\nch1=H\nsfH=400.0\ndw=100u\n").unwrap();
        write_data(dir.path(), &[1, 2, -3, -4]);

        let s = read_chemagnetics(dir.path(), &mut Vec::new()).unwrap();
        assert_eq!(s.ndim(), 1);
        assert_eq!(
            s.data().iter().copied().collect::<Vec<_>>(),
            vec![Complex64::new(1.0, -3.0), Complex64::new(2.0, -4.0)]
        );
        assert_eq!(s.axes()[0].freq, 400.0e6);
        assert!((s.axes()[0].sw - 10_000.0).abs() < 1e-6);
    }

    #[test]
    fn test_read_2d_from_arrays() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("acq"),
            "al=2\nch1=X\nsfX=100.0\ndw=10u\narray_num_values_p1=3\n",
        )
        .unwrap();
        fs::write(dir.path().join("acq_2"), "use_array=1\n").unwrap();
        write_data(dir.path(), &(0..12).collect::<Vec<_>>());

        let mut warnings = Vec::new();
        let s = read_chemagnetics(dir.path(), &mut warnings).unwrap();
        assert_eq!(s.shape(), &[3, 2]);
        assert_eq!(s.data()[[2, 1]], Complex64::new(5.0, 11.0));
        assert_eq!(s.sw()[0], DEFAULT_SW1);
        assert!(warnings.is_empty());
    }

    #[test]
    fn test_missing_dw2_warns() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acq"), "al=1\nch1=H\nsfH=1.0\ndw=1u\nal2=2\n").unwrap();
        write_data(dir.path(), &[1, 2, 3, 4]);

        let mut warnings = Vec::new();
        let s = read_chemagnetics(dir.path(), &mut warnings).unwrap();
        assert_eq!(s.shape(), &[2, 1]);
        assert_eq!(warnings.len(), 1);
    }

    #[test]
    fn test_short_data_is_truncated_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("acq"), "al=4\nch1=H\nsfH=1.0\ndw=1u\n").unwrap();
        write_data(dir.path(), &[1, 2]);
        assert!(matches!(
            read_chemagnetics(dir.path(), &mut Vec::new()),
            Err(LoadError::Truncated { expected: 32, got: 8 })
        ));
    }

    #[test]
    fn test_oversized_sizes_with_tiny_data() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("acq"),
            "al=4294967296\nch1=H\nsfH=1.0\ndw=1u\nal2=4294967296\n",
        )
        .unwrap();
        write_data(dir.path(), &[1, 2]);
        match read_chemagnetics(dir.path(), &mut Vec::new()) {
            Err(LoadError::CorruptHeader(_)) | Err(LoadError::Truncated { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|s| s.shape().to_vec())),
        }

        fs::write(
            dir.path().join("acq"),
            "al=2\nch1=H\nsfH=1.0\ndw=1u\narray_num_values_a=4294967296\narray_num_values_b=4294967296\n",
        )
        .unwrap();
        fs::write(dir.path().join("acq_2"), "use_array=1\n").unwrap();
        assert!(matches!(
            read_chemagnetics(dir.path(), &mut Vec::new()),
            Err(LoadError::CorruptHeader(_))
        ));
    }
}
