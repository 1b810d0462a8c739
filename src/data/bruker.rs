/// Bruker TopSpin / XWIN-NMR readers
///
/// Raw time-domain data (`acqus` + `fid` or `ser`) and processed spectra
/// (`procs` + `1r`/`1i` or `2rr`/`2ii`). Acquisition and processing
/// parameters come from the JCAMP-style `##$KEY= value` files stored next
/// to the binaries; the byte order of every binary is taken from
/// `BYTORDA`/`BYTORDP` before any sample is decoded.

use std::collections::HashMap;
use std::path::Path;

use ndarray::{ArrayD, IxDyn};
use nmrpipe_io::{float8_words, int4_words, Endian};
use num_complex::Complex64;

use super::complex::interleaved;
use super::spectrum::{AxisParams, SpectrumData};
use super::{declared_values, read_optional_text, read_required, read_required_text, LoadError};

/// ser rows are padded to this many bytes
const SER_ROW_ALIGN: usize = 1024;

// ────────────────────────────────────────────────────────────────
//  Parameter files
// ────────────────────────────────────────────────────────────────

/// Parse a Bruker `acqus`, `acqu2s`, `procs` or `proc2s` parameter file.
///
/// These files use a JCAMP-DX–like format with `##$PARAM= value` lines.
pub fn parse_acqus(content: &str) -> HashMap<String, String> {
    let mut params = HashMap::new();
    let mut current_key = String::new();
    let mut current_val = String::new();
    let mut in_multiline = false;

    for line in content.lines() {
        if line.starts_with("##$") {
            if !current_key.is_empty() {
                params.insert(current_key.clone(), current_val.trim().to_string());
            }
            if let Some(eq_pos) = line.find('=') {
                current_key = line[3..eq_pos].trim().to_string();
                current_val = line[eq_pos + 1..].trim().to_string();
                in_multiline = current_val.starts_with('(');
            } else {
                current_key.clear();
                current_val.clear();
                in_multiline = false;
            }
        } else if line.starts_with("##") {
            if !current_key.is_empty() {
                params.insert(current_key.clone(), current_val.trim().to_string());
                current_key.clear();
                current_val.clear();
                in_multiline = false;
            }
        } else if in_multiline || !current_key.is_empty() {
            current_val.push(' ');
            current_val.push_str(line.trim());
            if line.contains(')') {
                in_multiline = false;
            }
        }
    }
    if !current_key.is_empty() {
        params.insert(current_key, current_val.trim().to_string());
    }

    params
}

fn get_f64(params: &HashMap<String, String>, key: &str) -> Option<f64> {
    params.get(key).and_then(|v| v.parse::<f64>().ok())
}

fn get_i32(params: &HashMap<String, String>, key: &str) -> Option<i32> {
    params
        .get(key)
        .and_then(|v| v.parse::<f64>().ok())
        .map(|v| v as i32)
}

fn require_f64(params: &HashMap<String, String>, key: &str, file: &Path) -> Result<f64, LoadError> {
    get_f64(params, key).ok_or_else(|| {
        LoadError::MalformedContainer(format!("{} has no usable ##${} entry", file.display(), key))
    })
}

fn require_usize(params: &HashMap<String, String>, key: &str, file: &Path) -> Result<usize, LoadError> {
    match get_i32(params, key) {
        Some(v) if v >= 0 => Ok(v as usize),
        Some(v) => Err(LoadError::CorruptHeader(format!(
            "{}: negative {} ({})",
            file.display(),
            key,
            v
        ))),
        None => Err(LoadError::MalformedContainer(format!(
            "{} has no usable ##${} entry",
            file.display(),
            key
        ))),
    }
}

/// Raw sample word type (DTYPA / DTYPP)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleType {
    Int32,
    Float64,
}

impl SampleType {
    fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(2) => SampleType::Float64,
            _ => SampleType::Int32,
        }
    }

    fn width(self) -> usize {
        match self {
            SampleType::Int32 => 4,
            SampleType::Float64 => 8,
        }
    }
}

/// Acquisition parameters needed to decode fid/ser
#[derive(Debug, Clone, PartialEq)]
pub struct AcquisitionParams {
    /// Total data points per FID (real + imaginary)
    pub td: usize,
    /// Observe frequency in Hz (SFO1 is stored in MHz)
    pub sfo1: f64,
    /// Spectral width in Hz
    pub sw_h: f64,
    pub endian: Endian,
    pub sample_type: SampleType,
    /// Digital filter group delay (points)
    pub grpdly: f64,
}

impl AcquisitionParams {
    pub fn from_map(acq: &HashMap<String, String>, file: &Path) -> Result<Self, LoadError> {
        let endian = Endian::from_big_flag(get_i32(acq, "BYTORDA") == Some(1));
        let grpdly = digital_filter_delay(acq).unwrap_or(0.0);
        Ok(Self {
            td: require_usize(acq, "TD", file)?,
            sfo1: require_f64(acq, "SFO1", file)? * 1e6,
            sw_h: require_f64(acq, "SW_h", file)?,
            endian,
            sample_type: SampleType::from_code(get_i32(acq, "DTYPA")),
            grpdly,
        })
    }
}

/// Group delay in points per DECIM, for DSPFVS 10, 11 and 12 firmware.
const GROUP_DELAY: [&[(i32, f64)]; 3] = [
    &[
        (2, 44.75), (3, 33.5), (4, 66.625), (6, 59.0833), (8, 68.5625), (12, 60.375),
        (16, 69.5313), (24, 61.0208), (32, 70.0156), (48, 61.3438), (64, 70.2578),
        (96, 61.5052), (128, 70.3789), (192, 61.5859), (256, 70.4395), (384, 61.6263),
        (512, 70.4697), (768, 61.6465), (1024, 70.4849), (1536, 61.6566), (2048, 70.4924),
    ],
    &[
        (2, 46.0), (3, 36.5), (4, 48.0), (6, 50.1667), (8, 53.25), (12, 69.5),
        (16, 72.25), (24, 70.1667), (32, 72.75), (48, 70.5), (64, 73.0),
        (96, 70.6667), (128, 72.5), (192, 71.3333), (256, 72.25), (384, 71.6667),
        (512, 72.125), (768, 71.8333), (1024, 72.0625), (1536, 71.9167), (2048, 72.0313),
    ],
    &[
        (2, 46.311), (3, 36.530), (4, 47.870), (6, 50.229), (8, 53.289), (12, 69.551),
        (16, 71.600), (24, 70.184), (32, 72.138), (48, 70.528), (64, 72.348),
        (96, 70.700), (128, 72.524),
    ],
];

/// Digital filter group delay in points.
///
/// DSPFVS 10 to 12 firmware is looked up by DECIM; later firmware stores
/// the delay as GRPDLY. `None` when neither gives a value (GRPDLY is -1 on
/// hardware without a digital filter).
pub fn digital_filter_delay(acq: &HashMap<String, String>) -> Option<f64> {
    match get_i32(acq, "DSPFVS") {
        Some(version @ 10..=12) => {
            let decim = get_i32(acq, "DECIM")?;
            GROUP_DELAY[(version - 10) as usize]
                .iter()
                .find(|&&(d, _)| d == decim)
                .map(|&(_, delay)| delay)
        }
        _ => get_f64(acq, "GRPDLY").filter(|&delay| delay >= 0.0),
    }
}

/// Group delay from the `acqus` file of an experiment. `path` may be the
/// experiment directory or any file inside it.
pub fn read_filter_delay(path: &Path) -> Result<f64, LoadError> {
    let dir = if path.is_dir() {
        path
    } else {
        path.parent().unwrap_or_else(|| Path::new("."))
    };
    let acq = parse_acqus(&read_required_text(&dir.join("acqus"))?);
    digital_filter_delay(&acq).ok_or_else(|| {
        LoadError::Unsupported("DSPFVS value not recognized (Bruker hardware version not known)".into())
    })
}

fn decode(raw: &[u8], sample_type: SampleType, endian: Endian) -> Vec<f64> {
    match sample_type {
        SampleType::Int32 => int4_words(raw, endian).into_iter().map(f64::from).collect(),
        SampleType::Float64 => float8_words(raw, endian),
    }
}

// ────────────────────────────────────────────────────────────────
//  Raw time-domain data
// ────────────────────────────────────────────────────────────────

/// Read a Bruker experiment directory holding `acqus` and `fid` or `ser`.
pub fn read_bruker_fid(dir: &Path, warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let acqus_path = dir.join("acqus");
    let acq = parse_acqus(&read_required_text(&acqus_path)?);
    let params = AcquisitionParams::from_map(&acq, &acqus_path)?;

    let acqu2s_path = dir.join("acqu2s");
    let indirect = if acqu2s_path.exists() {
        let acq2 = parse_acqus(&read_required_text(&acqu2s_path)?);
        Some((
            require_usize(&acq2, "TD", &acqu2s_path)?,
            get_f64(&acq2, "SFO1").unwrap_or(0.0) * 1e6,
            get_f64(&acq2, "SW_h").unwrap_or(0.0),
        ))
    } else {
        None
    };

    let data_path = if dir.join("fid").exists() {
        dir.join("fid")
    } else {
        dir.join("ser")
    };
    let raw = read_required(&data_path)?;
    if indirect.is_none() && data_path.ends_with("ser") {
        let msg = "ser file without acqu2s, reading the first FID only".to_string();
        log::warn!("{}", msg);
        warnings.push(msg);
    }

    let rows = indirect.map(|(td1, _, _)| td1).unwrap_or(1);
    let width = params.sample_type.width();
    if params.td == 0 {
        return Err(LoadError::CorruptHeader(format!("{}: TD is 0", acqus_path.display())));
    }
    declared_values(&[params.td], width, raw.len())?;
    let total = declared_values(&[rows, params.td], width, raw.len())?;
    let row_bytes = params.td * width;
    let padded = row_bytes.div_ceil(SER_ROW_ALIGN) * SER_ROW_ALIGN;
    let stride = if rows > 1 && padded != row_bytes && raw.len() >= rows * padded {
        padded
    } else {
        row_bytes
    };
    log::debug!(
        "Bruker {}: TD={} rows={} stride={} endian={:?}",
        data_path.display(),
        params.td,
        rows,
        stride,
        params.endian
    );

    let mut values = Vec::with_capacity(total);
    for row in 0..rows {
        let start = (row * stride).min(raw.len());
        let end = (row * stride + row_bytes).min(raw.len());
        let decoded = decode(&raw[start..end], params.sample_type, params.endian);
        if decoded.len() < params.td {
            let msg = format!(
                "{} row {} holds {} of {} points, padded with zeros",
                data_path.display(),
                row,
                decoded.len(),
                params.td
            );
            log::warn!("{}", msg);
            warnings.push(msg);
        }
        values.extend_from_slice(&decoded);
        values.resize((row + 1) * params.td, 0.0);
    }

    if params.grpdly > 0.0 {
        let msg = format!(
            "digital filter group delay of {} points is present, apply the digital filter correction to remove it",
            params.grpdly
        );
        log::info!("{}", msg);
        warnings.push(msg);
    }

    let samples = interleaved(&values);
    match indirect {
        None => Ok(SpectrumData::from_vec(
            samples,
            AxisParams::new(params.sfo1, params.sw_h, false),
        )?),
        Some((td1, freq1, sw1)) => {
            let cols = params.td / 2;
            let data = ArrayD::from_shape_vec(IxDyn(&[td1, cols]), samples).map_err(|e| {
                LoadError::CorruptHeader(format!("TD {} × TD1 {}: {}", params.td, td1, e))
            })?;
            Ok(SpectrumData::new(
                data,
                vec![
                    AxisParams::new(freq1, sw1, false),
                    AxisParams::new(params.sfo1, params.sw_h, false),
                ],
            )?)
        }
    }
}

// ────────────────────────────────────────────────────────────────
//  Processed spectra
// ────────────────────────────────────────────────────────────────

/// Processing parameters of one axis (procs / proc2s)
#[derive(Debug, Clone, PartialEq)]
struct ProcAxis {
    si: usize,
    sw_p: f64,
    xdim: usize,
}

impl ProcAxis {
    fn from_map(params: &HashMap<String, String>, file: &Path) -> Result<Self, LoadError> {
        let si = require_usize(params, "SI", file)?;
        Ok(Self {
            si,
            sw_p: require_f64(params, "SW_p", file)?,
            xdim: get_i32(params, "XDIM")
                .filter(|&x| x > 0)
                .map(|x| x as usize)
                .unwrap_or(si),
        })
    }
}

/// Observe frequency (Hz) from an acquisition file two levels up.
fn observe_frequency(path: &Path, warnings: &mut Vec<String>) -> f64 {
    read_optional_text(path, warnings, "using 0 Hz as spectrometer frequency")
        .and_then(|text| get_f64(&parse_acqus(&text), "SFO1"))
        .map(|f| f * 1e6)
        .unwrap_or(0.0)
}

/// Reorder submatrix-tiled 2-D processed data into plain row-major order.
///
/// The file stores `(si1/xdim1) × (si2/xdim2)` tiles, each `xdim1 × xdim2`
/// points in row-major order.
pub fn untile(values: &[f64], si1: usize, si2: usize, xdim1: usize, xdim2: usize) -> Vec<f64> {
    if xdim1 == 0 || xdim2 == 0 || (xdim1 >= si1 && xdim2 >= si2) {
        return values.to_vec();
    }
    let tiles_per_row = si2 / xdim2;
    let tile_len = xdim1 * xdim2;
    let mut out = vec![0.0; si1 * si2];
    for (t, tile) in values.chunks(tile_len).enumerate() {
        let (bi, bj) = (t / tiles_per_row.max(1), t % tiles_per_row.max(1));
        for (k, &v) in tile.iter().enumerate() {
            let (r, c) = (bi * xdim1 + k / xdim2, bj * xdim2 + k % xdim2);
            if r < si1 && c < si2 {
                out[r * si2 + c] = v;
            }
        }
    }
    out
}

/// Read one processed part holding `dims` points in total.
fn read_part(
    path: &Path,
    dims: &[usize],
    sample_type: SampleType,
    endian: Endian,
    warnings: &mut Vec<String>,
) -> Result<Vec<f64>, LoadError> {
    let raw = read_required(path)?;
    let count = declared_values(dims, sample_type.width(), raw.len())?;
    let mut values = decode(&raw, sample_type, endian);
    if values.len() < count {
        let msg = format!(
            "{} holds {} of {} points, padded with zeros",
            path.display(),
            values.len(),
            count
        );
        log::warn!("{}", msg);
        warnings.push(msg);
    }
    values.resize(count, 0.0);
    Ok(values)
}

/// Read a Bruker processed-data directory (`pdata/<n>`).
pub fn read_bruker_spectrum(dir: &Path, warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let procs_path = dir.join("procs");
    let procs = parse_acqus(&read_required_text(&procs_path)?);
    let direct = ProcAxis::from_map(&procs, &procs_path)?;
    let endian = Endian::from_big_flag(get_i32(&procs, "BYTORDP") == Some(1));
    let sample_type = SampleType::from_code(get_i32(&procs, "DTYPP"));

    let experiment = dir.join("..").join("..");
    let freq2 = observe_frequency(&experiment.join("acqus"), warnings);

    let proc2s_path = dir.join("proc2s");
    let indirect = if proc2s_path.exists() && dir.join("2rr").exists() {
        let proc2s = parse_acqus(&read_required_text(&proc2s_path)?);
        Some(ProcAxis::from_map(&proc2s, &proc2s_path)?)
    } else {
        None
    };

    let (real_name, imag_names): (&str, &[&str]) = match indirect {
        Some(_) => ("2rr", &["2ii", "2ir"]),
        None => ("1r", &["1i"]),
    };
    let rows = indirect.as_ref().map(|a| a.si).unwrap_or(1);
    let dims = [rows, direct.si];

    let mut real = read_part(&dir.join(real_name), &dims, sample_type, endian, warnings)?;
    let count = real.len();
    let mut imag = match imag_names.iter().map(|n| dir.join(n)).find(|p| p.exists()) {
        Some(path) => read_part(&path, &dims, sample_type, endian, warnings)?,
        None => {
            let msg = format!("no imaginary part next to {}, using zeros", real_name);
            log::warn!("{}", msg);
            warnings.push(msg);
            vec![0.0; count]
        }
    };

    if let Some(axis1) = &indirect {
        real = untile(&real, axis1.si, direct.si, axis1.xdim, direct.xdim);
        imag = untile(&imag, axis1.si, direct.si, axis1.xdim, direct.xdim);
    }

    let samples: Vec<Complex64> = real
        .iter()
        .rev()
        .zip(imag.iter().rev())
        .map(|(&re, &im)| Complex64::new(re, -im))
        .collect();

    match indirect {
        None => Ok(SpectrumData::from_vec(samples, AxisParams::new(freq2, direct.sw_p, true))?),
        Some(axis1) => {
            let freq1 = observe_frequency(&experiment.join("acqu2s"), warnings);
            let data = ArrayD::from_shape_vec(IxDyn(&[axis1.si, direct.si]), samples)
                .map_err(|e| LoadError::CorruptHeader(e.to_string()))?;
            Ok(SpectrumData::new(
                data,
                vec![
                    AxisParams::new(freq1, axis1.sw_p, true),
                    AxisParams::new(freq2, direct.sw_p, true),
                ],
            )?)
        }
    }
}
