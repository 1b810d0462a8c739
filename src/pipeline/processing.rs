/// Dataset operations
///
/// Each operation validates its arguments, mutates the dataset in place and
/// appends exactly one history line. Undo state is captured by the caller
/// (`command::Command`) before `execute` runs.

use std::f64::consts::PI;

use ndarray::{ArrayD, Axis, IxDyn, Slice};
use num_complex::Complex64;
use rustfft::FftPlanner;
use thiserror::Error;

use crate::data::spectrum::{ShapeError, SpectrumData};
use crate::data::LoadError;

use super::command::{Factor, Operation, Reduction};
use super::conversion;

#[derive(Error, Debug)]
pub enum OperationError {
    #[error("axis {axis} out of range for {ndim}-dimensional data")]
    InvalidAxis { axis: i64, ndim: usize },
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("no source file to reload from")]
    NothingToReload,
    #[error("reload failed: {0}")]
    Reload(#[from] LoadError),
    #[error("inconsistent dataset: {0}")]
    Inconsistent(#[from] ShapeError),
}

/// Outcome of a successful operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Changed,
    /// Nothing changed; there is nothing to undo
    Unchanged,
}

use Applied::{Changed, Unchanged};

/// Resolve a possibly negative axis index.
pub fn resolve_axis(axis: i64, ndim: usize) -> Result<usize, OperationError> {
    let n = ndim as i64;
    let resolved = if axis < 0 { axis + n } else { axis };
    if resolved < 0 || resolved >= n {
        Err(OperationError::InvalidAxis { axis, ndim })
    } else {
        Ok(resolved as usize)
    }
}

/// Run one operation against the dataset.
pub fn execute(ds: &mut SpectrumData, op: &Operation) -> Result<Applied, OperationError> {
    let ndim = ds.ndim();
    let ax = |axis: i64| resolve_axis(axis, ndim);
    let applied = match op {
        Operation::Reload => reload(ds)?,
        Operation::Real => {
            ds.data.mapv_inplace(|z| Complex64::new(z.re, 0.0));
            ds.add_history("Real part taken");
            Changed
        }
        Operation::Imag => {
            ds.data.mapv_inplace(|z| Complex64::new(z.im, 0.0));
            ds.add_history("Imaginary part taken");
            Changed
        }
        Operation::Abs => {
            ds.data.mapv_inplace(|z| Complex64::new(z.norm(), 0.0));
            ds.add_history("Absolute value taken");
            Changed
        }
        Operation::Phase { phase0, phase1, axis } => phase(ds, *phase0, *phase1, ax(*axis)?)?,
        Operation::Fourier { axis } => fourier(ds, ax(*axis)?, false)?,
        Operation::RealFourier { axis } => fourier(ds, ax(*axis)?, true)?,
        Operation::FftShift { axis, inverse } => fftshift(ds, ax(*axis)?, *inverse),
        Operation::Diff { axis } => diff(ds, ax(*axis)?)?,
        Operation::Cumsum { axis } => cumsum(ds, ax(*axis)?),
        Operation::Hilbert { axis } => hilbert(ds, ax(*axis)?),
        Operation::Apodize { lor, gauss, axis } => apodize(ds, *lor, *gauss, ax(*axis)?)?,
        Operation::Freq { freq, sw, axis } => set_freq(ds, *freq, *sw, ax(*axis)?)?,
        Operation::Ref { reference, axis } => set_ref(ds, *reference, ax(*axis)?)?,
        Operation::Size { size, axis } => resize(ds, *size, ax(*axis)?)?,
        Operation::Spec { spec, axis } => set_spec(ds, *spec, ax(*axis)?),
        Operation::SwapEcho { index, axis } => swap_echo(ds, *index, ax(*axis)?)?,
        Operation::WholeEcho { whole_echo, axis } => set_whole_echo(ds, *whole_echo, ax(*axis)?),
        Operation::Shift { points, axis } => shift(ds, *points, ax(*axis)?),
        Operation::States { axis } => interleaved(ds, ax(*axis)?, Interleave::States)?,
        Operation::StatesTppi { axis } => interleaved(ds, ax(*axis)?, Interleave::StatesTppi)?,
        Operation::EchoAntiEcho { axis } => interleaved(ds, ax(*axis)?, Interleave::EchoAntiEcho)?,
        Operation::Reduce { kind, pos1, pos2, axis } => reduce(ds, *kind, *pos1, *pos2, ax(*axis)?)?,
        Operation::FlipLr { axis } => {
            let axis = ax(*axis)?;
            map_lanes(&mut ds.data, axis, |buf| buf.reverse());
            ds.add_history(format!("Flipped dimension {}", axis + 1));
            Changed
        }
        Operation::Delete { indices, axis } => delete(ds, indices, ax(*axis)?)?,
        Operation::Multiply { factor, axis } => multiply(ds, factor, ax(*axis)?)?,
        Operation::SubtractAvg { pos1, pos2, axis } => subtract_avg(ds, *pos1, *pos2, ax(*axis)?)?,
        Operation::Extract { pos1, pos2, axis } => extract(ds, *pos1, *pos2, ax(*axis)?)?,
        Operation::SetXax { values, axis } => set_xax(ds, values, ax(*axis)?)?,
        Operation::Concatenate { axis } => concatenate(ds, *axis)?,
        Operation::Split { sections, axis } => split(ds, *sections, ax(*axis)?)?,
    };
    if applied == Changed {
        ds.validate()?;
    }
    Ok(applied)
}

// =========================================================================
//  Lane helpers
// =========================================================================

/// Apply `f` to every 1-D lane along `axis`, keeping lane length.
fn map_lanes(data: &mut ArrayD<Complex64>, axis: usize, mut f: impl FnMut(&mut Vec<Complex64>)) {
    for mut lane in data.lanes_mut(Axis(axis)) {
        let mut buf = lane.to_vec();
        f(&mut buf);
        for (dst, v) in lane.iter_mut().zip(buf) {
            *dst = v;
        }
    }
}

/// Build a new array whose lanes along `axis` have length `len`.
fn rebuild_lanes(
    data: &ArrayD<Complex64>,
    axis: usize,
    len: usize,
    mut f: impl FnMut(&[Complex64]) -> Vec<Complex64>,
) -> ArrayD<Complex64> {
    let mut shape = data.shape().to_vec();
    shape[axis] = len;
    let mut out = ArrayD::zeros(IxDyn(&shape));
    for (mut dst, src) in out.lanes_mut(Axis(axis)).into_iter().zip(data.lanes(Axis(axis))) {
        let values = f(&src.to_vec());
        for (d, v) in dst.iter_mut().zip(values) {
            *d = v;
        }
    }
    out
}

/// Normalize a half-open `[pos1, pos2)` range; negatives count from the end.
fn span(pos1: i64, pos2: i64, n: usize) -> Result<(usize, usize), OperationError> {
    let norm = |p: i64| if p < 0 { p + n as i64 } else { p };
    let (a, b) = (norm(pos1), norm(pos2));
    let (lo, hi) = (a.min(b), a.max(b));
    if lo < 0 || hi > n as i64 || lo == hi {
        return Err(OperationError::InvalidArgument(format!(
            "range {}..{} is empty or outside 0..{}",
            pos1, pos2, n
        )));
    }
    Ok((lo as usize, hi as usize))
}

fn zero() -> Complex64 {
    Complex64::new(0.0, 0.0)
}

// =========================================================================
//  FFT
// =========================================================================

/// FFT with the centred-spectrum convention: a spectrum lane holds
/// `fftshift(fft(fid))`.
struct Transformer {
    planner: FftPlanner<f64>,
}

impl Transformer {
    fn new() -> Self {
        Self {
            planner: FftPlanner::new(),
        }
    }

    fn forward(&mut self, buf: &mut [Complex64]) {
        if buf.is_empty() {
            return;
        }
        self.planner.plan_fft_forward(buf.len()).process(buf);
    }

    /// Normalized by 1/n.
    fn inverse(&mut self, buf: &mut [Complex64]) {
        if buf.is_empty() {
            return;
        }
        self.planner.plan_fft_inverse(buf.len()).process(buf);
        let scale = 1.0 / buf.len() as f64;
        for z in buf.iter_mut() {
            *z *= scale;
        }
    }

    fn to_spectrum(&mut self, buf: &mut [Complex64]) {
        self.forward(buf);
        let half = buf.len() / 2;
        buf.rotate_right(half);
    }

    fn to_time(&mut self, buf: &mut [Complex64]) {
        let half = buf.len() / 2;
        buf.rotate_left(half);
        self.inverse(buf);
    }

    /// Run `f` on the time-domain form of the lane.
    fn in_time_domain(&mut self, buf: &mut Vec<Complex64>, spec: bool, f: impl FnOnce(&mut Vec<Complex64>)) {
        if spec {
            self.to_time(buf);
        }
        f(buf);
        if spec {
            self.to_spectrum(buf);
        }
    }
}

// =========================================================================
//  Domain and phase
// =========================================================================

fn phase(ds: &mut SpectrumData, phase0: f64, phase1: f64, axis: usize) -> Result<Applied, OperationError> {
    if !phase0.is_finite() || !phase1.is_finite() {
        return Err(OperationError::InvalidArgument("phase must be finite".into()));
    }
    let spec = ds.axes[axis].spec;
    let mut tr = Transformer::new();
    map_lanes(&mut ds.data, axis, |buf| {
        if !spec {
            tr.to_spectrum(buf);
        }
        let n = buf.len() as f64;
        let half = (buf.len() / 2) as f64;
        for (k, z) in buf.iter_mut().enumerate() {
            *z *= Complex64::from_polar(1.0, phase0 + phase1 * (k as f64 - half) / n);
        }
        if !spec {
            tr.to_time(buf);
        }
    });
    ds.add_history(format!(
        "Phasing: phase0 = {:.3} and phase1 = {:.3} for dimension {}",
        phase0.to_degrees(),
        phase1.to_degrees(),
        axis + 1
    ));
    Ok(Changed)
}

fn fourier(ds: &mut SpectrumData, axis: usize, real_only: bool) -> Result<Applied, OperationError> {
    let spec = ds.axes[axis].spec;
    let whole_echo = ds.axes[axis].whole_echo;
    if real_only && spec {
        return Err(OperationError::InvalidArgument(
            "real Fourier transform needs time-domain data".into(),
        ));
    }
    let mut tr = Transformer::new();
    map_lanes(&mut ds.data, axis, |buf| {
        if spec {
            tr.to_time(buf);
            if !whole_echo {
                if let Some(first) = buf.first_mut() {
                    *first *= 2.0;
                }
            }
        } else {
            if real_only {
                for z in buf.iter_mut() {
                    z.im = 0.0;
                }
            }
            if !whole_echo {
                if let Some(first) = buf.first_mut() {
                    *first *= 0.5;
                }
            }
            tr.to_spectrum(buf);
        }
    });
    ds.axes[axis].spec = !spec;
    ds.reset_xax(axis);
    ds.add_history(if real_only {
        format!("Real Fourier transform dimension {}", axis + 1)
    } else {
        format!("Fourier transform dimension {}", axis + 1)
    });
    Ok(Changed)
}

fn fftshift(ds: &mut SpectrumData, axis: usize, inverse: bool) -> Applied {
    map_lanes(&mut ds.data, axis, |buf| {
        let half = buf.len() / 2;
        if inverse {
            buf.rotate_left(half);
        } else {
            buf.rotate_right(half);
        }
    });
    ds.add_history(if inverse {
        format!("Inverse fftshift dimension {}", axis + 1)
    } else {
        format!("Fftshift dimension {}", axis + 1)
    });
    Changed
}

fn hilbert(ds: &mut SpectrumData, axis: usize) -> Applied {
    let mut tr = Transformer::new();
    map_lanes(&mut ds.data, axis, |buf| {
        let n = buf.len();
        for z in buf.iter_mut() {
            z.im = 0.0;
        }
        tr.forward(buf);
        for (k, z) in buf.iter_mut().enumerate() {
            let h = if k == 0 || (n % 2 == 0 && k == n / 2) {
                1.0
            } else if k < (n + 1) / 2 {
                2.0
            } else {
                0.0
            };
            *z *= h;
        }
        tr.inverse(buf);
    });
    ds.add_history(format!("Hilbert transform on dimension {}", axis + 1));
    Changed
}

fn apodize(ds: &mut SpectrumData, lor: f64, gauss: f64, axis: usize) -> Result<Applied, OperationError> {
    if !lor.is_finite() || !gauss.is_finite() {
        return Err(OperationError::InvalidArgument("line broadening must be finite".into()));
    }
    if lor == 0.0 && gauss == 0.0 {
        return Ok(Unchanged);
    }
    let params = &ds.axes[axis];
    let (sw, spec, whole_echo) = (params.sw, params.spec, params.whole_echo);
    let n = ds.shape()[axis];
    let window: Vec<f64> = (0..n)
        .map(|k| {
            // whole echoes decay from both ends
            let steps = if whole_echo { k.min(n - k) } else { k };
            let t = steps as f64 / sw;
            (-PI * lor * t).exp() * (-(PI * gauss * t).powi(2) / (4.0 * 2f64.ln())).exp()
        })
        .collect();
    let mut tr = Transformer::new();
    map_lanes(&mut ds.data, axis, |buf| {
        tr.in_time_domain(buf, spec, |buf| {
            for (z, w) in buf.iter_mut().zip(&window) {
                *z *= *w;
            }
        });
    });
    ds.add_history(format!(
        "Apodization: lorentzian = {} Hz, gaussian = {} Hz for dimension {}",
        lor,
        gauss,
        axis + 1
    ));
    Ok(Changed)
}

// =========================================================================
//  Axis metadata
// =========================================================================

fn set_freq(ds: &mut SpectrumData, freq: f64, sw: f64, axis: usize) -> Result<Applied, OperationError> {
    if !freq.is_finite() || !(sw > 0.0 && sw.is_finite()) {
        return Err(OperationError::InvalidArgument(format!(
            "frequency {} / sweep width {} not usable",
            freq, sw
        )));
    }
    ds.axes[axis].freq = freq;
    ds.axes[axis].sw = sw;
    ds.reset_xax(axis);
    ds.add_history(format!(
        "Frequency set to {} MHz and sw set to {} kHz for dimension {}",
        freq * 1e-6,
        sw * 1e-3,
        axis + 1
    ));
    Ok(Changed)
}

fn set_ref(ds: &mut SpectrumData, reference: Option<f64>, axis: usize) -> Result<Applied, OperationError> {
    if reference.map_or(false, |r| !r.is_finite()) {
        return Err(OperationError::InvalidArgument("reference must be finite".into()));
    }
    ds.axes[axis].reference = reference;
    ds.reset_xax(axis);
    ds.add_history(match reference {
        Some(r) => format!("Reference frequency set to {} MHz for dimension {}", r * 1e-6, axis + 1),
        None => format!("Reference cleared for dimension {}", axis + 1),
    });
    Ok(Changed)
}

fn set_spec(ds: &mut SpectrumData, spec: bool, axis: usize) -> Applied {
    if ds.axes[axis].spec == spec {
        return Unchanged;
    }
    ds.axes[axis].spec = spec;
    ds.reset_xax(axis);
    ds.add_history(format!(
        "Dimension {} set to {} domain",
        axis + 1,
        if spec { "frequency" } else { "time" }
    ));
    Changed
}

fn set_whole_echo(ds: &mut SpectrumData, whole_echo: bool, axis: usize) -> Applied {
    if ds.axes[axis].whole_echo == whole_echo {
        return Unchanged;
    }
    ds.axes[axis].whole_echo = whole_echo;
    ds.add_history(format!("Whole echo set to {} for dimension {}", whole_echo, axis + 1));
    Changed
}

fn set_xax(ds: &mut SpectrumData, values: &[f64], axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    if values.len() != n {
        return Err(OperationError::Shape(format!(
            "{} axis values for {} points",
            values.len(),
            n
        )));
    }
    ds.axes[axis].xax = values.to_vec();
    ds.add_history(format!("X-axis of dimension {} set to user defined values", axis + 1));
    Ok(Changed)
}

// =========================================================================
//  Point-wise and length-changing operations
// =========================================================================

fn diff(ds: &mut SpectrumData, axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    if n < 2 {
        return Err(OperationError::Shape("differences need at least two points".into()));
    }
    ds.data = rebuild_lanes(&ds.data, axis, n - 1, |src| src.windows(2).map(|w| w[1] - w[0]).collect());
    ds.reset_xax(axis);
    ds.add_history(format!("Differences over dimension {}", axis + 1));
    Ok(Changed)
}

fn cumsum(ds: &mut SpectrumData, axis: usize) -> Applied {
    map_lanes(&mut ds.data, axis, |buf| {
        let mut total = zero();
        for z in buf.iter_mut() {
            total += *z;
            *z = total;
        }
    });
    ds.add_history(format!("Cumulative sum over dimension {}", axis + 1));
    Changed
}

fn resize_lane(buf: &[Complex64], size: usize, whole_echo: bool) -> Vec<Complex64> {
    let n = buf.len();
    let keep = n.min(size);
    let mut out = vec![zero(); size];
    if whole_echo {
        let head = (keep + 1) / 2;
        let tail = keep / 2;
        out[..head].copy_from_slice(&buf[..head]);
        out[size - tail..].copy_from_slice(&buf[n - tail..]);
    } else {
        out[..keep].copy_from_slice(&buf[..keep]);
    }
    out
}

fn resize(ds: &mut SpectrumData, size: usize, axis: usize) -> Result<Applied, OperationError> {
    if size == 0 {
        return Err(OperationError::InvalidArgument("size must be at least 1".into()));
    }
    if ds.shape()[axis] == size {
        return Ok(Unchanged);
    }
    let spec = ds.axes[axis].spec;
    let whole_echo = ds.axes[axis].whole_echo;
    let mut tr = Transformer::new();
    ds.data = rebuild_lanes(&ds.data, axis, size, |src| {
        let mut buf = src.to_vec();
        if spec {
            tr.to_time(&mut buf);
        }
        let mut out = resize_lane(&buf, size, whole_echo);
        if spec {
            tr.to_spectrum(&mut out);
        }
        out
    });
    ds.reset_xax(axis);
    ds.add_history(format!("Resized dimension {} to {} points", axis + 1, size));
    Ok(Changed)
}

fn swap_echo(ds: &mut SpectrumData, index: i64, axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    if n == 0 {
        return Err(OperationError::Shape("cannot swap an empty dimension".into()));
    }
    let pos = index.rem_euclid(n as i64) as usize;
    map_lanes(&mut ds.data, axis, |buf| buf.rotate_left(pos));
    ds.axes[axis].whole_echo = !ds.axes[axis].whole_echo;
    ds.add_history(format!("Swap echo at position {} for dimension {}", index, axis + 1));
    Ok(Changed)
}

fn shift(ds: &mut SpectrumData, points: i64, axis: usize) -> Applied {
    if points == 0 {
        return Unchanged;
    }
    let spec = ds.axes[axis].spec;
    let mut tr = Transformer::new();
    map_lanes(&mut ds.data, axis, |buf| {
        tr.in_time_domain(buf, spec, |buf| {
            let n = buf.len();
            let p = (points.unsigned_abs() as usize).min(n);
            if points > 0 {
                buf.rotate_right(p);
                buf[..p].fill(zero());
            } else {
                buf.rotate_left(p);
                buf[n - p..].fill(zero());
            }
        });
    });
    ds.add_history(format!("Shifted {} points in dimension {}", points, axis + 1));
    Changed
}

#[derive(Clone, Copy)]
enum Interleave {
    States,
    StatesTppi,
    EchoAntiEcho,
}

/// Pairwise conversions of interleaved indirect-dimension acquisitions.
fn interleaved(ds: &mut SpectrumData, axis: usize, kind: Interleave) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    if n < 2 || n % 2 != 0 {
        return Err(OperationError::Shape(format!(
            "dimension {} has {} points, need an even number",
            axis + 1,
            n
        )));
    }
    ds.data = rebuild_lanes(&ds.data, axis, n / 2, |src| {
        src.chunks_exact(2)
            .enumerate()
            .map(|(k, pair)| {
                let (a, b) = (pair[0], pair[1]);
                match kind {
                    Interleave::States => Complex64::new(a.re, b.re),
                    Interleave::StatesTppi => {
                        let sign = if k % 2 == 0 { 1.0 } else { -1.0 };
                        Complex64::new(a.re, b.re) * sign
                    }
                    Interleave::EchoAntiEcho => Complex64::new((a + b).re, (a - b).im),
                }
            })
            .collect()
    });
    ds.reset_xax(axis);
    let label = match kind {
        Interleave::States => "States",
        Interleave::StatesTppi => "States-TPPI",
        Interleave::EchoAntiEcho => "Echo/antiecho",
    };
    ds.add_history(format!("{} conversion on dimension {}", label, axis + 1));
    Ok(Changed)
}

fn delete(ds: &mut SpectrumData, indices: &[i64], axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    let mut remove = indices
        .iter()
        .map(|&i| {
            let k = if i < 0 { i + n as i64 } else { i };
            if (0..n as i64).contains(&k) {
                Ok(k as usize)
            } else {
                Err(OperationError::InvalidArgument(format!("index {} outside 0..{}", i, n)))
            }
        })
        .collect::<Result<Vec<usize>, _>>()?;
    remove.sort_unstable();
    remove.dedup();
    if remove.is_empty() {
        return Ok(Unchanged);
    }
    if remove.len() >= n {
        return Err(OperationError::InvalidArgument("cannot delete every point".into()));
    }
    ds.data = rebuild_lanes(&ds.data, axis, n - remove.len(), |src| {
        src.iter()
            .enumerate()
            .filter(|(k, _)| remove.binary_search(k).is_err())
            .map(|(_, z)| *z)
            .collect()
    });
    ds.reset_xax(axis);
    ds.add_history(format!("Removed {} points from dimension {}", remove.len(), axis + 1));
    Ok(Changed)
}

fn multiply(ds: &mut SpectrumData, factor: &Factor, axis: usize) -> Result<Applied, OperationError> {
    match factor {
        Factor::Scalar(f) => {
            ds.data.mapv_inplace(|z| z * *f);
            ds.add_history(format!("Multiplied dimension {} by {}", axis + 1, f));
        }
        Factor::PerPoint(values) => {
            let n = ds.shape()[axis];
            if values.len() != n {
                return Err(OperationError::Shape(format!(
                    "{} factors for {} points",
                    values.len(),
                    n
                )));
            }
            map_lanes(&mut ds.data, axis, |buf| {
                for (z, f) in buf.iter_mut().zip(values) {
                    *z *= *f;
                }
            });
            ds.add_history(format!("Multiplied dimension {} point by point", axis + 1));
        }
    }
    Ok(Changed)
}

fn subtract_avg(ds: &mut SpectrumData, pos1: i64, pos2: i64, axis: usize) -> Result<Applied, OperationError> {
    let (lo, hi) = span(pos1, pos2, ds.shape()[axis])?;
    map_lanes(&mut ds.data, axis, |buf| {
        let avg = buf[lo..hi].iter().sum::<Complex64>() / (hi - lo) as f64;
        for z in buf.iter_mut() {
            *z -= avg;
        }
    });
    ds.add_history(format!(
        "Subtracted average between {} and {} of dimension {}",
        lo,
        hi,
        axis + 1
    ));
    Ok(Changed)
}

fn extract(ds: &mut SpectrumData, pos1: i64, pos2: i64, axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    let (lo, hi) = span(pos1, pos2, n)?;
    if lo == 0 && hi == n {
        return Ok(Unchanged);
    }
    let m = hi - lo;
    ds.data = rebuild_lanes(&ds.data, axis, m, |src| src[lo..hi].to_vec());
    let params = &mut ds.axes[axis];
    if params.spec {
        // keep the extracted points at their old coordinates
        let step = params.sw / n as f64;
        if params.reference.is_none() {
            params.reference = Some(params.freq);
        }
        params.freq += (lo as f64 + (m / 2) as f64 - (n / 2) as f64) * step;
        params.sw = step * m as f64;
    }
    ds.reset_xax(axis);
    ds.add_history(format!(
        "Extracted part between {} and {} of dimension {}",
        lo,
        hi,
        axis + 1
    ));
    Ok(Changed)
}

// =========================================================================
//  Reductions
// =========================================================================

fn reduce(
    ds: &mut SpectrumData,
    kind: Reduction,
    pos1: i64,
    pos2: i64,
    axis: usize,
) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    let (lo, hi) = span(pos1, pos2, n)?;
    let params = &ds.axes[axis];
    let step = if params.spec { params.sw / n as f64 } else { 1.0 / params.sw };
    let xax = &params.xax;
    let by_real = |a: &(usize, Complex64), b: &(usize, Complex64)| a.1.re.total_cmp(&b.1.re);

    let values: Vec<Complex64> = ds
        .data
        .lanes(Axis(axis))
        .into_iter()
        .map(|lane| {
            let part = lane.iter().copied().enumerate().skip(lo).take(hi - lo);
            match kind {
                Reduction::Sum => part.map(|(_, z)| z).sum::<Complex64>(),
                Reduction::Integrate => part.map(|(_, z)| z).sum::<Complex64>() * step,
                Reduction::Average => part.map(|(_, z)| z).sum::<Complex64>() / (hi - lo) as f64,
                Reduction::Max => part.max_by(by_real).map(|(_, z)| z).unwrap_or_default(),
                Reduction::Min => part.min_by(by_real).map(|(_, z)| z).unwrap_or_default(),
                Reduction::Argmax => part
                    .max_by(by_real)
                    .map(|(k, _)| Complex64::new(xax[k], 0.0))
                    .unwrap_or_default(),
                Reduction::Argmin => part
                    .min_by(by_real)
                    .map(|(k, _)| Complex64::new(xax[k], 0.0))
                    .unwrap_or_default(),
            }
        })
        .collect();

    let shape: Vec<usize> = if ds.ndim() > 1 {
        let mut shape = ds.shape().to_vec();
        shape.remove(axis);
        shape
    } else {
        vec![1]
    };
    ds.data = ArrayD::from_shape_vec(IxDyn(&shape), values).map_err(|e| OperationError::Shape(e.to_string()))?;
    if ds.axes.len() > 1 {
        ds.axes.remove(axis);
    } else {
        ds.reset_xax(axis);
    }

    let label = match kind {
        Reduction::Integrate => "Integrated",
        Reduction::Sum => "Sum",
        Reduction::Max => "Maximum",
        Reduction::Min => "Minimum",
        Reduction::Argmax => "Maximum position",
        Reduction::Argmin => "Minimum position",
        Reduction::Average => "Average",
    };
    ds.add_history(format!("{} between {} and {} of dimension {}", label, lo, hi, axis + 1));
    Ok(Changed)
}

// =========================================================================
//  Dimension restructuring
// =========================================================================

/// Join the slices of the first dimension along `axis` of the remaining
/// array.
fn concatenate(ds: &mut SpectrumData, axis: i64) -> Result<Applied, OperationError> {
    if ds.ndim() < 2 {
        return Err(OperationError::Shape("concatenation needs at least two dimensions".into()));
    }
    let target = resolve_axis(axis, ds.ndim() - 1)?;
    let views: Vec<_> = ds.data.axis_iter(Axis(0)).collect();
    let joined = ndarray::concatenate(Axis(target), &views).map_err(|e| OperationError::Shape(e.to_string()))?;
    ds.data = joined;
    ds.axes.remove(0);
    ds.reset_xax(target);
    ds.add_history(format!("Concatenated along dimension {}", target + 1));
    Ok(Changed)
}

/// Cut `axis` into equal sections stacked along a new first dimension.
fn split(ds: &mut SpectrumData, sections: usize, axis: usize) -> Result<Applied, OperationError> {
    let n = ds.shape()[axis];
    if sections == 0 || n % sections != 0 {
        return Err(OperationError::InvalidArgument(format!(
            "{} points cannot be split into {} sections",
            n, sections
        )));
    }
    let len = n / sections;
    let views: Vec<_> = (0..sections)
        .map(|s| ds.data.slice_axis(Axis(axis), Slice::from(s * len..(s + 1) * len)))
        .collect();
    let stacked = ndarray::stack(Axis(0), &views).map_err(|e| OperationError::Shape(e.to_string()))?;
    let mut params = ds.axes[axis].clone();
    params.xax.clear();
    ds.data = stacked;
    ds.axes.insert(0, params);
    ds.reset_xax(0);
    ds.reset_xax(axis + 1);
    ds.add_history(format!("Split dimension {} into {} sections", axis + 1, sections));
    Ok(Changed)
}

fn reload(ds: &mut SpectrumData) -> Result<Applied, OperationError> {
    let source = ds.reload_source.clone().ok_or(OperationError::NothingToReload)?;
    let loaded = conversion::reload(&source)?;
    ds.data = loaded.spectrum.data;
    ds.axes = loaded.spectrum.axes;
    ds.add_history(format!("Reloaded data from {}", source.path.display()));
    log::info!("reloaded {}", source.path.display());
    Ok(Changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::interchange;
    use crate::data::spectrum::AxisParams;

    fn c(re: f64, im: f64) -> Complex64 {
        Complex64::new(re, im)
    }

    fn fid(n: usize) -> SpectrumData {
        let values = (0..n)
            .map(|k| Complex64::from_polar((-(k as f64) / 8.0).exp(), 0.9 * k as f64))
            .collect();
        SpectrumData::from_vec(values, AxisParams::new(100e6, 1000.0, false)).unwrap()
    }

    fn grid(rows: usize, cols: usize) -> SpectrumData {
        let values = (0..rows * cols).map(|k| c(k as f64, -(k as f64))).collect();
        let data = ArrayD::from_shape_vec(IxDyn(&[rows, cols]), values).unwrap();
        SpectrumData::new(
            data,
            vec![AxisParams::new(50e6, 200.0, false), AxisParams::new(100e6, 1000.0, true)],
        )
        .unwrap()
    }

    fn assert_close(a: &ArrayD<Complex64>, b: &ArrayD<Complex64>) {
        assert_eq!(a.shape(), b.shape());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).norm() < 1e-9, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_negative_axes_count_from_end() {
        assert_eq!(resolve_axis(-1, 3).unwrap(), 2);
        assert_eq!(resolve_axis(0, 1).unwrap(), 0);
        assert!(matches!(resolve_axis(-4, 3), Err(OperationError::InvalidAxis { axis: -4, ndim: 3 })));
        assert!(resolve_axis(3, 3).is_err());
    }

    #[test]
    fn test_fourier_there_and_back() {
        let original = fid(16);
        let mut ds = original.clone();
        execute(&mut ds, &Operation::Fourier { axis: 0 }).unwrap();
        assert!(ds.axes()[0].spec);
        assert_eq!(ds.axes()[0].xax[8], 0.0);
        execute(&mut ds, &Operation::Fourier { axis: 0 }).unwrap();
        assert!(!ds.axes()[0].spec);
        assert_close(ds.data(), original.data());
        assert_eq!(ds.history().len(), 2);
    }

    #[test]
    fn test_fourier_of_constant_is_centred_peak() {
        let mut ds = SpectrumData::from_vec(vec![c(1.0, 0.0); 8], AxisParams::new(1e6, 800.0, false)).unwrap();
        execute(&mut ds, &Operation::Fourier { axis: -1 }).unwrap();
        // first point halved: 7.5 at the centre, 0.5 elsewhere
        assert!((ds.data()[[4]] - c(7.5, 0.0)).norm() < 1e-12);
        assert!((ds.data()[[0]] - c(-0.5, 0.0)).norm() < 1e-12);
    }

    #[test]
    fn test_real_fourier_rejects_spectrum() {
        let mut ds = grid(2, 4);
        let err = execute(&mut ds, &Operation::RealFourier { axis: 1 }).unwrap_err();
        assert!(matches!(err, OperationError::InvalidArgument(_)));
    }

    #[test]
    fn test_zero_phase_in_spectrum_is_identity() {
        let mut ds = grid(2, 4);
        let before = ds.data().clone();
        execute(&mut ds, &Operation::Phase { phase0: 0.0, phase1: 0.0, axis: 1 }).unwrap();
        assert_close(ds.data(), &before);
        execute(&mut ds, &Operation::Phase { phase0: PI / 2.0, phase1: 0.0, axis: 1 }).unwrap();
        assert!((ds.data()[[0, 1]] - c(1.0, 1.0)).norm() < 1e-12);
        assert!(ds.history()[1].contains("phase0 = 90.000"));
    }

    #[test]
    fn test_fftshift_pair_cancels() {
        let mut ds = fid(5);
        let before = ds.data().clone();
        execute(&mut ds, &Operation::FftShift { axis: 0, inverse: false }).unwrap();
        assert_eq!(ds.data()[[2]], before[[0]]);
        execute(&mut ds, &Operation::FftShift { axis: 0, inverse: true }).unwrap();
        assert_eq!(ds.data(), &before);
    }

    #[test]
    fn test_hilbert_of_cosine_is_complex_exponential() {
        let n = 32;
        let values = (0..n).map(|k| c((2.0 * PI * 4.0 * k as f64 / n as f64).cos(), 0.0)).collect();
        let mut ds = SpectrumData::from_vec(values, AxisParams::new(1e6, 1e3, false)).unwrap();
        execute(&mut ds, &Operation::Hilbert { axis: 0 }).unwrap();
        for (k, z) in ds.data().iter().enumerate() {
            let expected = Complex64::from_polar(1.0, 2.0 * PI * 4.0 * k as f64 / n as f64);
            assert!((z - expected).norm() < 1e-9);
        }
    }

    #[test]
    fn test_apodize_window_and_whole_echo_mirror() {
        let mut ds = SpectrumData::from_vec(vec![c(1.0, 0.0); 4], AxisParams::new(1e6, 1.0, false)).unwrap();
        execute(&mut ds, &Operation::Apodize { lor: 1.0 / PI, gauss: 0.0, axis: 0 }).unwrap();
        assert!((ds.data()[[2]].re - (-2.0f64).exp()).abs() < 1e-12);

        let mut echo = SpectrumData::from_vec(vec![c(1.0, 0.0); 4], AxisParams::new(1e6, 1.0, false)).unwrap();
        echo.axes[0].whole_echo = true;
        execute(&mut echo, &Operation::Apodize { lor: 1.0 / PI, gauss: 0.0, axis: 0 }).unwrap();
        assert_eq!(echo.data()[[1]], echo.data()[[3]]);

        let before = echo.clone();
        assert_eq!(
            execute(&mut echo, &Operation::Apodize { lor: 0.0, gauss: 0.0, axis: 0 }).unwrap(),
            Unchanged
        );
        assert_eq!(echo, before);
    }

    #[test]
    fn test_size_zero_fills_and_truncates() {
        let mut ds = fid(4);
        let first = ds.data()[[0]];
        execute(&mut ds, &Operation::Size { size: 6, axis: 0 }).unwrap();
        assert_eq!(ds.shape(), &[6]);
        assert_eq!(ds.data()[[0]], first);
        assert_eq!(ds.data()[[5]], zero());
        assert_eq!(ds.axes()[0].xax.len(), 6);
        execute(&mut ds, &Operation::Size { size: 2, axis: 0 }).unwrap();
        assert_eq!(ds.shape(), &[2]);
        assert!(execute(&mut ds, &Operation::Size { size: 0, axis: 0 }).is_err());
    }

    #[test]
    fn test_size_whole_echo_keeps_both_ends() {
        let values: Vec<_> = (1..=4).map(|k| c(k as f64, 0.0)).collect();
        let mut ds = SpectrumData::from_vec(values, AxisParams::new(1e6, 1.0, false)).unwrap();
        ds.axes[0].whole_echo = true;
        execute(&mut ds, &Operation::Size { size: 6, axis: 0 }).unwrap();
        let re: Vec<f64> = ds.data().iter().map(|z| z.re).collect();
        assert_eq!(re, vec![1.0, 2.0, 0.0, 0.0, 3.0, 4.0]);
    }

    #[test]
    fn test_swap_echo_rotates_and_toggles() {
        let values: Vec<_> = (0..5).map(|k| c(k as f64, 0.0)).collect();
        let mut ds = SpectrumData::from_vec(values, AxisParams::new(1e6, 1.0, false)).unwrap();
        execute(&mut ds, &Operation::SwapEcho { index: 2, axis: 0 }).unwrap();
        let re: Vec<f64> = ds.data().iter().map(|z| z.re).collect();
        assert_eq!(re, vec![2.0, 3.0, 4.0, 0.0, 1.0]);
        assert!(ds.axes()[0].whole_echo);
    }

    #[test]
    fn test_shift_fills_with_zeros() {
        let values: Vec<_> = (1..=4).map(|k| c(k as f64, 0.0)).collect();
        let mut ds = SpectrumData::from_vec(values, AxisParams::new(1e6, 1.0, false)).unwrap();
        execute(&mut ds, &Operation::Shift { points: 1, axis: 0 }).unwrap();
        let re: Vec<f64> = ds.data().iter().map(|z| z.re).collect();
        assert_eq!(re, vec![0.0, 1.0, 2.0, 3.0]);
        execute(&mut ds, &Operation::Shift { points: -2, axis: 0 }).unwrap();
        let re: Vec<f64> = ds.data().iter().map(|z| z.re).collect();
        assert_eq!(re, vec![2.0, 3.0, 0.0, 0.0]);
    }

    #[test]
    fn test_states_family() {
        let values = vec![c(1.0, 5.0), c(2.0, 6.0), c(3.0, 7.0), c(4.0, 8.0)];
        let one = |v: Vec<Complex64>| SpectrumData::from_vec(v, AxisParams::new(1e6, 1.0, false)).unwrap();

        let mut ds = one(values.clone());
        execute(&mut ds, &Operation::States { axis: 0 }).unwrap();
        assert_eq!(ds.data().iter().copied().collect::<Vec<_>>(), vec![c(1.0, 2.0), c(3.0, 4.0)]);

        let mut ds = one(values.clone());
        execute(&mut ds, &Operation::StatesTppi { axis: 0 }).unwrap();
        assert_eq!(ds.data().iter().copied().collect::<Vec<_>>(), vec![c(1.0, 2.0), c(-3.0, -4.0)]);

        let mut ds = one(values.clone());
        execute(&mut ds, &Operation::EchoAntiEcho { axis: 0 }).unwrap();
        assert_eq!(ds.data().iter().copied().collect::<Vec<_>>(), vec![c(3.0, -1.0), c(7.0, -1.0)]);

        let mut odd = one(values[..3].to_vec());
        assert!(matches!(
            execute(&mut odd, &Operation::States { axis: 0 }),
            Err(OperationError::Shape(_))
        ));
    }

    #[test]
    fn test_reductions_remove_axis() {
        let mut ds = grid(2, 3);
        execute(
            &mut ds,
            &Operation::Reduce { kind: Reduction::Sum, pos1: 0, pos2: 3, axis: 1 },
        )
        .unwrap();
        assert_eq!(ds.shape(), &[2]);
        assert_eq!(ds.axes().len(), 1);
        assert_eq!(ds.data()[[0]], c(3.0, -3.0));
        assert_eq!(ds.data()[[1]], c(12.0, -12.0));

        let mut ds = grid(2, 3);
        execute(
            &mut ds,
            &Operation::Reduce { kind: Reduction::Argmax, pos1: -3, pos2: -1, axis: 1 },
        )
        .unwrap();
        // spectral axis xax = (k - 1) * 1000 / 3
        assert!((ds.data()[[0]].re - 0.0).abs() < 1e-9);

        let mut one = fid(4);
        execute(
            &mut one,
            &Operation::Reduce { kind: Reduction::Integrate, pos1: 0, pos2: 1, axis: 0 },
        )
        .unwrap();
        assert_eq!(one.shape(), &[1]);
        assert!((one.data()[[0]] - c(1.0 / 1000.0, 0.0)).norm() < 1e-12);

        let mut ds = grid(2, 3);
        assert!(execute(
            &mut ds,
            &Operation::Reduce { kind: Reduction::Max, pos1: 2, pos2: 2, axis: 1 }
        )
        .is_err());
    }

    #[test]
    fn test_delete_points() {
        let mut ds = grid(2, 4);
        execute(&mut ds, &Operation::Delete { indices: vec![-1, 0, 0], axis: 1 }).unwrap();
        assert_eq!(ds.shape(), &[2, 2]);
        assert_eq!(ds.data()[[0, 0]], c(1.0, -1.0));
        assert!(ds.history()[0].contains("Removed 2 points"));
        assert_eq!(execute(&mut ds, &Operation::Delete { indices: vec![], axis: 1 }).unwrap(), Unchanged);
        assert!(execute(&mut ds, &Operation::Delete { indices: vec![0, 1], axis: 1 }).is_err());
        assert!(execute(&mut ds, &Operation::Delete { indices: vec![7], axis: 1 }).is_err());
    }

    #[test]
    fn test_multiply_per_point_needs_matching_length() {
        let mut ds = grid(2, 2);
        execute(&mut ds, &Operation::Multiply { factor: Factor::PerPoint(vec![2.0, 0.0]), axis: 0 }).unwrap();
        assert_eq!(ds.data()[[0, 1]], c(2.0, -2.0));
        assert_eq!(ds.data()[[1, 1]], zero());
        assert!(matches!(
            execute(&mut ds, &Operation::Multiply { factor: Factor::PerPoint(vec![1.0]), axis: 0 }),
            Err(OperationError::Shape(_))
        ));
    }

    #[test]
    fn test_subtract_average() {
        let mut ds = grid(1, 4);
        execute(&mut ds, &Operation::SubtractAvg { pos1: 0, pos2: 2, axis: -1 }).unwrap();
        assert_eq!(ds.data()[[0, 0]], c(-0.5, 0.5));
        assert_eq!(ds.data()[[0, 3]], c(2.5, -2.5));
    }

    #[test]
    fn test_extract_spectrum_keeps_coordinates() {
        let mut ds = grid(1, 8);
        let before = ds.axes()[1].xax.clone();
        execute(&mut ds, &Operation::Extract { pos1: 2, pos2: 6, axis: 1 }).unwrap();
        let after = &ds.axes()[1];
        assert_eq!(ds.shape(), &[1, 4]);
        assert_eq!(after.sw, 500.0);
        assert_eq!(after.reference, Some(100e6));
        for (a, b) in after.xax.iter().zip(&before[2..6]) {
            assert!((a - b).abs() < 1e-6);
        }
    }

    #[test]
    fn test_concatenate_and_split() {
        let mut ds = grid(2, 3);
        execute(&mut ds, &Operation::Concatenate { axis: 0 }).unwrap();
        assert_eq!(ds.shape(), &[6]);
        assert!(ds.axes()[0].spec);
        assert_eq!(ds.data()[[4]], c(4.0, -4.0));
        assert!(matches!(
            execute(&mut ds, &Operation::Concatenate { axis: 0 }),
            Err(OperationError::Shape(_))
        ));

        execute(&mut ds, &Operation::Split { sections: 3, axis: 0 }).unwrap();
        assert_eq!(ds.shape(), &[3, 2]);
        assert_eq!(ds.data()[[2, 0]], c(4.0, -4.0));
        assert_eq!(ds.axes()[0].sw, ds.axes()[1].sw);
        assert!(execute(&mut ds, &Operation::Split { sections: 4, axis: 1 }).is_err());
    }

    #[test]
    fn test_set_xax_and_metadata_no_ops() {
        let mut ds = grid(2, 2);
        execute(&mut ds, &Operation::SetXax { values: vec![5.0, 6.0], axis: 0 }).unwrap();
        assert_eq!(ds.axes()[0].xax, vec![5.0, 6.0]);
        assert_eq!(execute(&mut ds, &Operation::Spec { spec: true, axis: 1 }).unwrap(), Unchanged);
        assert_eq!(ds.history().len(), 1);
        execute(&mut ds, &Operation::Ref { reference: Some(100e6 + 100.0), axis: 1 }).unwrap();
        assert!((ds.axes()[1].xax[1] - (-100.0)).abs() < 1e-6);
        assert!(execute(&mut ds, &Operation::Freq { freq: 1.0, sw: 0.0, axis: 1 }).is_err());
    }

    #[test]
    fn test_reload_replaces_data_keeps_history() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.json");
        let source = fid(4);
        interchange::write_json(&source, &path).unwrap();

        let mut ds = conversion::load_spectrum(&path).unwrap().spectrum;
        execute(&mut ds, &Operation::Size { size: 8, axis: 0 }).unwrap();
        execute(&mut ds, &Operation::Reload).unwrap();
        assert_eq!(ds.shape(), &[4]);
        assert_eq!(ds.history().len(), 3);
        assert!(ds.history()[2].starts_with("Reloaded data from"));

        let mut fresh = fid(4);
        assert!(matches!(execute(&mut fresh, &Operation::Reload), Err(OperationError::NothingToReload)));
    }
}
