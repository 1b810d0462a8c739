/// SIMPSON text container: reader and writer
///
/// A SIMPSON file is a small `KEY=value` header followed by the samples
/// between a `DATA` and an `END` line. Samples are either `re im` text pairs
/// or, with `FORMAT=BINARY`, a printable-character payload where every four
/// characters carry three bytes and every four bytes one packed float.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;

use super::spectrum::{AxisParams, SpectrumData};
use super::{read_required_text, LoadError, SaveError};

/// Offset added to every 6-bit field of the binary payload
const BASE: u8 = 33;
/// Characters per line in written binary payloads
const BINARY_LINE: usize = 80;

// ────────────────────────────────────────────────────────────────
//  Binary payload bit packing
// ────────────────────────────────────────────────────────────────

/// Unpack four payload characters into three bytes.
pub fn decode_quad(chars: [u8; 4]) -> [u8; 3] {
    let [c0, c1, c2, c3] = chars.map(|c| c.wrapping_sub(BASE));
    [
        (c0 & 0x3f) | ((c1 << 2) & 0xc0),
        (c1 & 0x0f) | ((c2 << 2) & 0xf0),
        (c2 & 0x03) | ((c3 << 2) & 0xfc),
    ]
}

/// Pack three bytes into four payload characters.
pub fn encode_triplet(bytes: [u8; 3]) -> [u8; 4] {
    let [b0, b1, b2] = bytes;
    [
        b0 & 0x3f,
        ((b0 >> 6) << 4) | (b1 & 0x0f),
        ((b1 >> 4) << 2) | (b2 & 0x03),
        b2 >> 2,
    ]
    .map(|c| c + BASE)
}

/// Decode one packed float: 23-bit mantissa without an implicit leading one,
/// 8-bit exponent biased by 127, sign in the top bit of the last byte.
pub fn decode_float(bytes: [u8; 4]) -> f32 {
    let [b0, b1, b2, b3] = bytes;
    let mantissa = (u32::from(b2 & 0x7f) << 16) | (u32::from(b1) << 8) | u32::from(b0);
    let exponent = i32::from(b3 & 0x7f) * 2 + i32::from(b2 >> 7);
    let magnitude = f64::from(mantissa) / f64::from(1u32 << 23) * 2f64.powi(exponent - 127);
    if b3 >= 0x80 {
        -magnitude as f32
    } else {
        magnitude as f32
    }
}

/// Inverse of [`decode_float`]. Values beyond the exponent range saturate;
/// NaN is written as zero.
pub fn encode_float(value: f32) -> [u8; 4] {
    let v = f64::from(value);
    if v == 0.0 || v.is_nan() {
        return [0; 4];
    }
    let negative = v < 0.0;
    let magnitude = if v.is_infinite() { f64::from(f32::MAX) } else { v.abs() };

    // magnitude = m * 2^e with m in [0.5, 1)
    let mut e = magnitude.log2().floor() as i32 + 1;
    let mut m = magnitude / 2f64.powi(e);
    while m >= 1.0 {
        m /= 2.0;
        e += 1;
    }
    while m < 0.5 {
        m *= 2.0;
        e -= 1;
    }

    let mut mantissa = (m * f64::from(1u32 << 23)).round() as u32;
    let mut exponent = e + 127;
    if mantissa >= 1 << 23 {
        mantissa >>= 1;
        exponent += 1;
    }
    if exponent < 0 {
        mantissa >>= (-exponent).min(31);
        exponent = 0;
    }
    if exponent > 255 {
        mantissa = (1 << 23) - 1;
        exponent = 255;
    }
    let exponent = exponent as u32;

    let b0 = (mantissa & 0xff) as u8;
    let b1 = ((mantissa >> 8) & 0xff) as u8;
    let b2 = (((mantissa >> 16) & 0x7f) | ((exponent & 1) << 7)) as u8;
    let b3 = ((exponent >> 1) as u8) | if negative { 0x80 } else { 0 };
    [b0, b1, b2, b3]
}

/// Decode a whole binary payload (line breaks already removed) into floats.
pub fn decode_binary(chars: &[u8]) -> Result<Vec<f32>, LoadError> {
    if chars.len() % 4 != 0 {
        return Err(LoadError::MalformedContainer(format!(
            "binary SIMPSON payload of {} characters is not a multiple of 4",
            chars.len()
        )));
    }
    let bytes: Vec<u8> = chars
        .chunks_exact(4)
        .flat_map(|q| decode_quad([q[0], q[1], q[2], q[3]]))
        .collect();
    Ok(bytes
        .chunks_exact(4)
        .map(|b| decode_float([b[0], b[1], b[2], b[3]]))
        .collect())
}

/// Encode floats into payload characters, zero-padding the last triplet.
pub fn encode_binary(values: &[f32]) -> Vec<u8> {
    let mut bytes: Vec<u8> = values.iter().flat_map(|&v| encode_float(v)).collect();
    while bytes.len() % 3 != 0 {
        bytes.push(0);
    }
    bytes
        .chunks_exact(3)
        .flat_map(|t| encode_triplet([t[0], t[1], t[2]]))
        .collect()
}

// ────────────────────────────────────────────────────────────────
//  Reader
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
struct Header {
    np: usize,
    ni: usize,
    sw: f64,
    sw1: f64,
    spectrum: bool,
    binary: bool,
}

fn header_value<T: std::str::FromStr>(line: &str, key: &str) -> Result<T, LoadError> {
    line.trim_start_matches(key)
        .trim()
        .parse::<T>()
        .map_err(|_| LoadError::MalformedContainer(format!("bad SIMPSON header line '{}'", line)))
}

fn parse_header(lines: &[&str]) -> Result<Header, LoadError> {
    let mut header = Header {
        np: 0,
        ni: 1,
        sw: 0.0,
        sw1: 0.0,
        spectrum: false,
        binary: false,
    };
    for line in lines {
        if line.starts_with("NP=") {
            header.np = header_value(line, "NP=")?;
        } else if line.starts_with("NI=") {
            header.ni = header_value(line, "NI=")?;
        } else if line.starts_with("SW1=") {
            header.sw1 = header_value(line, "SW1=")?;
        } else if line.starts_with("SW=") {
            header.sw = header_value(line, "SW=")?;
        } else if let Some(kind) = line.strip_prefix("TYPE=") {
            header.spectrum = kind.contains("SPE");
        } else if let Some(format) = line.strip_prefix("FORMAT=") {
            header.binary = format.contains("BINARY");
        }
    }
    Ok(header)
}

/// Read a SIMPSON `.fid` / `.spe` file.
pub fn read_simpson(path: &Path, _warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let text = read_required_text(path)?;
    let lines: Vec<&str> = text.lines().map(str::trim).collect();
    let start = lines
        .iter()
        .position(|l| *l == "DATA")
        .ok_or_else(|| LoadError::MalformedContainer("SIMPSON file has no DATA line".into()))?;
    let end = lines[start..]
        .iter()
        .position(|l| *l == "END")
        .map(|p| p + start)
        .ok_or_else(|| LoadError::MalformedContainer("SIMPSON file has no END line".into()))?;
    let header = parse_header(&lines[..start])?;
    let body = &lines[start + 1..end];

    let samples: Vec<Complex64> = if header.binary {
        let chars: Vec<u8> = body.iter().flat_map(|l| l.bytes()).collect();
        decode_binary(&chars)?
            .chunks_exact(2)
            .map(|p| Complex64::new(f64::from(p[0]), f64::from(p[1])))
            .collect()
    } else {
        body.iter()
            .filter(|l| !l.is_empty())
            .map(|l| {
                let mut it = l.split_whitespace().map(str::parse::<f64>);
                match (it.next(), it.next()) {
                    (Some(Ok(re)), Some(Ok(im))) => Ok(Complex64::new(re, im)),
                    _ => Err(LoadError::MalformedContainer(format!("bad SIMPSON data line '{}'", l))),
                }
            })
            .collect::<Result<_, _>>()?
    };
    log::debug!(
        "SIMPSON {}: NP={} NI={} binary={} samples={}",
        path.display(),
        header.np,
        header.ni,
        header.binary,
        samples.len()
    );

    if header.ni == 1 {
        return Ok(SpectrumData::from_vec(
            samples,
            AxisParams::new(0.0, header.sw, header.spectrum),
        )?);
    }
    let rows = header.ni.max(1);
    if samples.len() % rows != 0 {
        return Err(LoadError::MalformedContainer(format!(
            "{} samples do not fill NI={} rows",
            samples.len(),
            rows
        )));
    }
    let data = ArrayD::from_shape_vec(IxDyn(&[rows, samples.len() / rows]), samples)
        .map_err(|e| LoadError::MalformedContainer(e.to_string()))?;
    Ok(SpectrumData::new(
        data,
        vec![
            AxisParams::new(0.0, header.sw1, header.spectrum),
            AxisParams::new(0.0, header.sw, header.spectrum),
        ],
    )?)
}

// ────────────────────────────────────────────────────────────────
//  Writer
// ────────────────────────────────────────────────────────────────

/// Render a 1-D or 2-D dataset with a single domain as SIMPSON text.
pub fn to_simpson(spectrum: &SpectrumData, binary: bool) -> Result<String, SaveError> {
    if spectrum.ndim() > 2 {
        return Err(SaveError::Unsupported(
            "SIMPSON files hold only 1D and 2D data".into(),
        ));
    }
    let spec = spectrum.spec();
    if spec.iter().any(|&s| s != spec[0]) {
        return Err(SaveError::Unsupported(
            "SIMPSON files cannot mix time and frequency domain".into(),
        ));
    }

    let shape = spectrum.shape();
    let sw = spectrum.sw();
    let mut out = String::from("SIMP\n");
    if spectrum.ndim() == 2 {
        writeln!(out, "NP={}", shape[1])?;
        writeln!(out, "NI={}", shape[0])?;
        writeln!(out, "SW={}", sw[1])?;
        writeln!(out, "SW1={}", sw[0])?;
    } else {
        writeln!(out, "NP={}", shape[0])?;
        writeln!(out, "SW={}", sw[0])?;
    }
    out.push_str(if spec[0] { "TYPE=SPE\n" } else { "TYPE=FID\n" });
    if binary {
        out.push_str("FORMAT=BINARY\n");
    }
    out.push_str("DATA\n");

    if binary {
        let floats: Vec<f32> = spectrum
            .data()
            .iter()
            .flat_map(|c| [c.re as f32, c.im as f32])
            .collect();
        for line in encode_binary(&floats).chunks(BINARY_LINE) {
            out.push_str(&String::from_utf8_lossy(line));
            out.push('\n');
        }
    } else {
        for c in spectrum.data().iter() {
            writeln!(out, "{} {}", c.re, c.im)?;
        }
    }
    out.push_str("END\n");
    Ok(out)
}

/// Save a dataset as a SIMPSON file.
pub fn write_simpson(spectrum: &SpectrumData, path: &Path, binary: bool) -> Result<(), SaveError> {
    fs::write(path, to_simpson(spectrum, binary)?)?;
    log::info!("SIMPSON file written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_minimum_quad_decodes_to_zero() {
        assert_eq!(decode_quad(*b"!!!!"), [0, 0, 0]);
        assert_eq!(decode_float([0, 0, 0, 0]), 0.0);
        assert_eq!(decode_binary(b"!!!!!!!!").unwrap(), vec![0.0]);
    }

    #[test]
    fn test_float_literals() {
        assert_eq!(decode_float([0, 0, 0x40, 0x40]), 1.0);
        assert_eq!(decode_float([0, 0, 0x40, 0xc0]), -1.0);
        assert_eq!(decode_float([0, 0, 0x40, 0x3f]), 0.25);
        assert_eq!(decode_float([0, 0, 0xc0, 0x40]), 2.0);
    }

    #[test]
    fn test_payload_fixture() {
        assert_eq!(decode_binary(b"!!!1!1!!").unwrap(), vec![1.0]);
        assert!(decode_binary(b"!!!").is_err());
    }

    #[test]
    fn test_encoder_inverts_bit_packing() {
        for bytes in [[0u8, 0, 0], [0xff, 0xff, 0xff], [0x12, 0x9a, 0xc3]] {
            let chars = encode_triplet(bytes);
            assert!(chars.iter().all(|c| c.is_ascii_graphic()));
            assert_eq!(decode_quad(chars), bytes);
        }
        for v in [1.0f32, -2.5, 0.15625, 1024.0, -3.0e-3] {
            let decoded = decode_float(encode_float(v));
            assert!((decoded - v).abs() <= v.abs() * 1e-6, "{} -> {}", v, decoded);
        }
        assert_eq!(encode_float(1.0), [0, 0, 0x40, 0x40]);
    }

    #[test]
    fn test_read_text_2d() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.spe");
        fs::write(
            &path,
            "SIMP\nNP=2\nNI=2\nSW=1000\nSW1=500\nTYPE=SPE\nDATA\n1 2\n3 4\n5 6\n7 8\nEND\n",
        )
        .unwrap();
        let s = read_simpson(&path, &mut Vec::new()).unwrap();
        assert_eq!(s.shape(), &[2, 2]);
        assert_eq!(s.data()[[1, 0]], Complex64::new(5.0, 6.0));
        assert_eq!(s.sw(), vec![500.0, 1000.0]);
        assert_eq!(s.spec(), vec![true, true]);
        assert_eq!(s.freq(), vec![0.0, 0.0]);
    }

    #[test]
    fn test_binary_write_then_read() {
        let source = SpectrumData::from_vec(
            vec![Complex64::new(1.0, -0.5), Complex64::new(0.25, 8.0), Complex64::new(0.0, 3.0)],
            AxisParams::new(0.0, 2000.0, false),
        )
        .unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("x.fid");
        write_simpson(&source, &path, true).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("FORMAT=BINARY"));
        let back = read_simpson(&path, &mut Vec::new()).unwrap();
        assert_eq!(back.data(), source.data());
        assert_eq!(back.sw(), vec![2000.0]);
    }

    #[test]
    fn test_text_writer_layout() {
        let data = ArrayD::from_shape_vec(
            IxDyn(&[2, 2]),
            vec![
                Complex64::new(1.0, 2.0),
                Complex64::new(3.0, 4.0),
                Complex64::new(5.0, 6.0),
                Complex64::new(7.0, -8.5),
            ],
        )
        .unwrap();
        let s = SpectrumData::new(
            data,
            vec![AxisParams::new(0.0, 500.0, true), AxisParams::new(0.0, 1000.0, true)],
        )
        .unwrap();
        let text = to_simpson(&s, false).unwrap();
        assert_eq!(
            text,
            "SIMP\nNP=2\nNI=2\nSW=1000\nSW1=500\nTYPE=SPE\nDATA\n1 2\n3 4\n5 6\n7 -8.5\nEND\n"
        );
    }

    #[test]
    fn test_writer_rejects_mixed_domains() {
        let data = ArrayD::from_elem(IxDyn(&[2, 2]), Complex64::new(0.0, 0.0));
        let s = SpectrumData::new(
            data,
            vec![AxisParams::new(0.0, 1.0, false), AxisParams::new(0.0, 1.0, true)],
        )
        .unwrap();
        assert!(matches!(to_simpson(&s, false), Err(SaveError::Unsupported(_))));
    }
}
