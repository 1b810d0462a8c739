/// Varian / Agilent VnmrJ reader (`fid` or `data` plus `procpar`)
///
/// The binary file is always big-endian: a 32-byte file header, then
/// `nblocks` blocks, each made of `nbheaders` 28-byte block headers followed
/// by `ntraces × npoints` samples. Sample width and packing come from the
/// status word in the file header.

use std::io::Cursor;
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use ndarray::{ArrayD, IxDyn};
use nmrpipe_io::{float4_words, int2_words, int4_words, Endian};
use num_complex::Complex64;

use super::complex::interleaved_conj;
use super::spectrum::{AxisParams, SpectrumData};
use super::{declared_values, read_optional_text, read_required, LoadError};

/// Fallbacks when procpar is absent
pub const DEFAULT_FREQ: f64 = 300e6;
pub const DEFAULT_SW: f64 = 50e3;
pub const DEFAULT_SW1: f64 = 50e3;
pub const DEFAULT_FREQ1: f64 = 0.0;

const FILE_HEADER_BYTES: usize = 32;
const BLOCK_HEADER_BYTES: i64 = 28;

/// Status word bits
mod status {
    pub const S_SPEC: i16 = 0x2;
    pub const S_32: i16 = 0x4;
    pub const S_FLOAT: i16 = 0x8;
    pub const S_COMPLEX: i16 = 0x10;
    pub const S_HYPERCOMPLEX: i16 = 0x20;
}

// ────────────────────────────────────────────────────────────────
//  procpar
// ────────────────────────────────────────────────────────────────

/// Acquisition values picked out of a procpar file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcparValues {
    /// Observe frequency (Hz)
    pub sfrq: Option<f64>,
    pub sw: Option<f64>,
    pub sw1: Option<f64>,
    /// Decoupler frequency (Hz), used for the indirect axis
    pub dfrq: Option<f64>,
}

/// Parse the handful of parameters the reader needs.
///
/// A parameter line (`sfrq 1 1 ...`) is followed by a value line whose
/// second token is the value.
pub fn parse_procpar(content: &str) -> ProcparValues {
    let mut values = ProcparValues::default();
    let lines: Vec<&str> = content.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        let slot = if line.starts_with("sfrq ") {
            &mut values.sfrq
        } else if line.starts_with("sw ") {
            &mut values.sw
        } else if line.starts_with("sw1 ") {
            &mut values.sw1
        } else if line.starts_with("dfrq ") {
            &mut values.dfrq
        } else {
            continue;
        };
        let scale = if line.starts_with("sfrq ") || line.starts_with("dfrq ") {
            1e6
        } else {
            1.0
        };
        *slot = lines
            .get(i + 1)
            .and_then(|next| next.split_whitespace().nth(1))
            .and_then(|v| v.parse::<f64>().ok())
            .map(|v| v * scale);
    }
    values
}

// ────────────────────────────────────────────────────────────────
//  Binary header
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    Int16,
    Int32,
    Float32,
}

impl ElementType {
    pub fn width(self) -> usize {
        match self {
            ElementType::Int16 => 2,
            ElementType::Int32 | ElementType::Float32 => 4,
        }
    }
}

/// The 32-byte file header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub nblocks: i32,
    pub ntraces: i32,
    pub npoints: i32,
    pub ebytes: i32,
    pub tbytes: i32,
    pub bbytes: i32,
    pub vers_id: i16,
    pub status: i16,
    pub nbheaders: i32,
}

impl FileHeader {
    pub fn parse(raw: &[u8]) -> Result<Self, LoadError> {
        if raw.len() < FILE_HEADER_BYTES {
            return Err(LoadError::Truncated {
                expected: FILE_HEADER_BYTES,
                got: raw.len(),
            });
        }
        let mut cursor = Cursor::new(&raw[..FILE_HEADER_BYTES]);
        Ok(Self {
            nblocks: cursor.read_i32::<BigEndian>()?,
            ntraces: cursor.read_i32::<BigEndian>()?,
            npoints: cursor.read_i32::<BigEndian>()?,
            ebytes: cursor.read_i32::<BigEndian>()?,
            tbytes: cursor.read_i32::<BigEndian>()?,
            bbytes: cursor.read_i32::<BigEndian>()?,
            vers_id: cursor.read_i16::<BigEndian>()?,
            status: cursor.read_i16::<BigEndian>()?,
            nbheaders: cursor.read_i32::<BigEndian>()?,
        })
    }

    pub fn is_spectrum(&self) -> bool {
        self.status & status::S_SPEC != 0
    }

    pub fn element(&self) -> ElementType {
        if self.status & status::S_FLOAT != 0 {
            ElementType::Float32
        } else if self.status & status::S_32 != 0 {
            ElementType::Int32
        } else {
            ElementType::Int16
        }
    }

    /// FIDs are always interleaved complex; spectra only when flagged.
    pub fn is_complex(&self) -> bool {
        !self.is_spectrum() || self.status & (status::S_COMPLEX | status::S_HYPERCOMPLEX) != 0
    }

    /// Bytes of block headers preceding each block's samples.
    fn block_header_bytes(&self) -> Result<usize, LoadError> {
        for (name, v) in [
            ("nblocks", self.nblocks),
            ("ntraces", self.ntraces),
            ("npoints", self.npoints),
            ("nbheaders", self.nbheaders),
        ] {
            if v < 0 {
                return Err(LoadError::CorruptHeader(format!("negative {}: {}", name, v)));
            }
        }
        if self.bbytes != 0 {
            let payload = self.ntraces as i64 * self.tbytes as i64;
            let headers = self.bbytes as i64 - payload;
            if headers < 0 {
                return Err(LoadError::CorruptHeader(format!(
                    "negative block header size: bbytes {} < ntraces {} × tbytes {}",
                    self.bbytes, self.ntraces, self.tbytes
                )));
            }
        }
        Ok((self.nbheaders as i64 * BLOCK_HEADER_BYTES) as usize)
    }
}

// ────────────────────────────────────────────────────────────────
//  Reader
// ────────────────────────────────────────────────────────────────

fn locate_procpar(dir: &Path) -> PathBuf {
    let local = dir.join("procpar");
    if local.exists() {
        return local;
    }
    match dir.parent() {
        Some(parent) if parent.join("procpar").exists() => parent.join("procpar"),
        _ => local,
    }
}

fn locate_data(dir: &Path) -> PathBuf {
    let fid = dir.join("fid");
    if fid.exists() {
        fid
    } else {
        dir.join("data")
    }
}

/// Decode every block into one flat list of sample values (before complex
/// pairing). Short blocks are zero padded.
fn decode_blocks(raw: &[u8], header: &FileHeader, warnings: &mut Vec<String>) -> Result<Vec<f64>, LoadError> {
    let skip = header.block_header_bytes()?;
    let element = header.element();
    if header.ebytes != 0 && header.ebytes as usize != element.width() {
        let msg = format!(
            "Varian header states {} bytes per element, status word selects {:?}",
            header.ebytes, element
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    }

    let available = raw.len().saturating_sub(FILE_HEADER_BYTES);
    let per_block = declared_values(
        &[header.ntraces as usize, header.npoints as usize],
        element.width(),
        available,
    )?;
    let total = declared_values(&[header.nblocks as usize, per_block], element.width(), available)?;
    if per_block == 0 && header.nblocks > 0 {
        return Err(LoadError::CorruptHeader(format!(
            "{} blocks declared with no samples per block",
            header.nblocks
        )));
    }
    let block_bytes = per_block * element.width();
    let mut values = Vec::with_capacity(total);
    let mut offset = FILE_HEADER_BYTES;

    for block in 0..header.nblocks as usize {
        offset = offset.saturating_add(skip);
        let start = offset.min(raw.len());
        let end = offset.saturating_add(block_bytes).min(raw.len());
        let chunk = &raw[start..end];

        let decoded: Vec<f64> = match element {
            ElementType::Int16 => int2_words(chunk, Endian::Big).into_iter().map(f64::from).collect(),
            ElementType::Int32 => int4_words(chunk, Endian::Big).into_iter().map(f64::from).collect(),
            ElementType::Float32 => float4_words(chunk, Endian::Big).into_iter().map(f64::from).collect(),
        };
        if decoded.len() < per_block {
            let msg = format!(
                "Varian block {} holds {} of {} samples, padded with zeros",
                block,
                decoded.len(),
                per_block
            );
            log::warn!("{}", msg);
            warnings.push(msg);
        }
        log::debug!("Varian block {}: {} samples at offset {}", block, decoded.len(), start);
        values.extend_from_slice(&decoded);
        values.resize(values.len() + per_block - decoded.len().min(per_block), 0.0);
        offset = offset.saturating_add(block_bytes);
    }

    Ok(values)
}

/// Read a Varian experiment directory.
pub fn read_varian(dir: &Path, warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let procpar_path = locate_procpar(dir);
    let params = match read_optional_text(
        &procpar_path,
        warnings,
        "procpar does not exist, used standard sw and freq",
    ) {
        Some(text) => parse_procpar(&text),
        None => ProcparValues::default(),
    };
    let freq = params.sfrq.unwrap_or(DEFAULT_FREQ);
    let sw = params.sw.unwrap_or(DEFAULT_SW);
    let sw1 = params.sw1.unwrap_or(DEFAULT_SW1);
    let freq1 = params.dfrq.unwrap_or(DEFAULT_FREQ1);

    let raw = read_required(&locate_data(dir))?;
    let header = FileHeader::parse(&raw)?;
    log::info!(
        "Varian header: {} blocks × {} traces × {} points, status {:#06x}",
        header.nblocks,
        header.ntraces,
        header.npoints,
        header.status
    );

    let values = decode_blocks(&raw, &header, warnings)?;
    let spec = header.is_spectrum();
    let samples: Vec<Complex64> = if header.is_complex() {
        interleaved_conj(&values)
    } else {
        values.iter().map(|&v| Complex64::new(v, 0.0)).collect()
    };

    let traces = header.nblocks as usize * header.ntraces as usize;
    if traces == 1 {
        let mut samples = samples;
        if spec {
            samples.reverse();
        }
        return Ok(SpectrumData::from_vec(samples, AxisParams::new(freq, sw, spec))?);
    }

    let cols = if traces == 0 { 0 } else { samples.len() / traces };
    let data = ArrayD::from_shape_vec(IxDyn(&[traces, cols]), samples).map_err(|e| {
        LoadError::CorruptHeader(format!("sample count does not fill {} traces: {}", traces, e))
    })?;
    Ok(SpectrumData::new(
        data,
        vec![AxisParams::new(freq1, sw1, spec), AxisParams::new(freq, sw, spec)],
    )?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn file_header(nblocks: i32, ntraces: i32, npoints: i32, ebytes: i32, status: i16, nbheaders: i32) -> Vec<u8> {
        let tbytes = npoints * ebytes;
        let bbytes = ntraces * tbytes + nbheaders * 28;
        let mut out = Vec::new();
        for v in [nblocks, ntraces, npoints, ebytes, tbytes, bbytes] {
            out.extend_from_slice(&v.to_be_bytes());
        }
        out.extend_from_slice(&0i16.to_be_bytes());
        out.extend_from_slice(&status.to_be_bytes());
        out.extend_from_slice(&nbheaders.to_be_bytes());
        out
    }

    const PROCPAR: &str = "sfrq 1 1 1000000000 0 0 2 1 11 1 64\n1 399.5\n0\n\
                           sw 1 1 1000000000 0 0 2 1 11 1 64\n1 8000\n0\n\
                           sw1 1 1 1000000000 0 0 2 1 11 1 64\n1 2000\n0\n\
                           dfrq 1 1 1000000000 0 0 2 1 11 1 64\n1 100.5\n0\n";

    #[test]
    fn test_parse_procpar() {
        let p = parse_procpar(PROCPAR);
        assert_eq!(p.sfrq, Some(399.5e6));
        assert_eq!(p.sw, Some(8000.0));
        assert_eq!(p.sw1, Some(2000.0));
        assert_eq!(p.dfrq, Some(100.5e6));
    }

    #[test]
    fn test_1d_int16_fid_with_block_header() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = file_header(1, 1, 4, 2, 0x1, 1);
        raw.extend_from_slice(&[0xAA; 28]);
        for v in [3i16, 4, -5, 6] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        fs::write(dir.path().join("fid"), raw).unwrap();
        fs::write(dir.path().join("procpar"), PROCPAR).unwrap();

        let mut warnings = Vec::new();
        let s = read_varian(dir.path(), &mut warnings).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(s.shape(), &[2]);
        let v: Vec<Complex64> = s.data().iter().copied().collect();
        assert_eq!(v, vec![Complex64::new(3.0, -4.0), Complex64::new(-5.0, -6.0)]);
        assert_eq!(s.axes()[0].freq, 399.5e6);
        assert_eq!(s.axes()[0].sw, 8000.0);
        assert!(!s.axes()[0].spec);
    }

    #[test]
    fn test_2d_int32_skips_headers_per_block() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = file_header(2, 1, 2, 4, 0x1 | status::S_32, 1);
        for block in 0..2i32 {
            raw.extend_from_slice(&[0x55; 28]);
            raw.extend_from_slice(&(10 * (block + 1)).to_be_bytes());
            raw.extend_from_slice(&(block + 1).to_be_bytes());
        }
        fs::write(dir.path().join("fid"), raw).unwrap();

        let mut warnings = Vec::new();
        let s = read_varian(dir.path(), &mut warnings).unwrap();
        assert_eq!(warnings.len(), 1, "missing procpar warns once");
        assert_eq!(s.shape(), &[2, 1]);
        assert_eq!(s.data()[[0, 0]], Complex64::new(10.0, -1.0));
        assert_eq!(s.data()[[1, 0]], Complex64::new(20.0, -2.0));
        assert_eq!(s.freq(), vec![DEFAULT_FREQ1, DEFAULT_FREQ]);
        assert_eq!(s.sw(), vec![DEFAULT_SW1, DEFAULT_SW]);
    }

    #[test]
    fn test_real_spectrum_is_reversed() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = file_header(1, 1, 3, 4, 0x1 | status::S_SPEC | status::S_FLOAT, 0);
        for v in [1.0f32, 2.0, 3.0] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        fs::write(dir.path().join("data"), raw).unwrap();

        let mut warnings = Vec::new();
        let s = read_varian(dir.path(), &mut warnings).unwrap();
        let re: Vec<f64> = s.data().iter().map(|c| c.re).collect();
        assert_eq!(re, vec![3.0, 2.0, 1.0]);
        assert!(s.axes()[0].spec);
    }

    #[test]
    fn test_short_block_padded() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = file_header(1, 1, 4, 2, 0x1, 0);
        raw.extend_from_slice(&7i16.to_be_bytes());
        raw.extend_from_slice(&8i16.to_be_bytes());
        fs::write(dir.path().join("fid"), raw).unwrap();

        let mut warnings = Vec::new();
        let s = read_varian(dir.path(), &mut warnings).unwrap();
        assert_eq!(s.shape(), &[2]);
        assert_eq!(s.data()[[1]], Complex64::new(0.0, 0.0));
        assert!(warnings.iter().any(|w| w.contains("padded")));
    }

    #[test]
    fn test_negative_block_size_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = file_header(1, 1, 4, 2, 0x1, 0);
        // bbytes smaller than one trace
        raw[20..24].copy_from_slice(&2i32.to_be_bytes());
        fs::write(dir.path().join("fid"), raw).unwrap();

        let err = read_varian(dir.path(), &mut Vec::new()).unwrap_err();
        assert!(err.is_fatal(), "{}", err);
    }

    #[test]
    fn test_oversized_header_with_tiny_payload() {
        let dir = tempfile::tempdir().unwrap();
        let mut raw = Vec::new();
        for v in [0x4000_0000i32, 0x4000_0000, 0x4000_0000, 2, 0, 0] {
            raw.extend_from_slice(&v.to_be_bytes());
        }
        raw.extend_from_slice(&0i16.to_be_bytes());
        raw.extend_from_slice(&0x1i16.to_be_bytes());
        raw.extend_from_slice(&0i32.to_be_bytes());
        fs::write(dir.path().join("fid"), raw).unwrap();

        match read_varian(dir.path(), &mut Vec::new()) {
            Err(LoadError::CorruptHeader(_)) | Err(LoadError::Truncated { .. }) => {}
            other => panic!("unexpected {:?}", other.map(|s| s.shape().to_vec())),
        }
    }

    #[test]
    fn test_blocks_without_samples_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let raw = file_header(1 << 20, 1, 0, 2, 0x1, 0);
        fs::write(dir.path().join("fid"), raw).unwrap();

        let err = read_varian(dir.path(), &mut Vec::new()).unwrap_err();
        assert!(matches!(err, LoadError::CorruptHeader(_)), "{}", err);
    }
}
