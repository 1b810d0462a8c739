use ndarray::{ArrayD, IxDyn};
use num_complex::Complex64;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

/// Supported vendor formats and containers; doubles as the parser identity
/// stored in a dataset's reload source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VendorFormat {
    Varian,
    Bruker,
    BrukerSpectrum,
    Chemagnetics,
    Magritek,
    Simpson,
    NMRPipe,
    Json,
    Matlab,
}

impl VendorFormat {
    /// Label used in the "... data loaded from <path>" history line.
    pub fn history_label(self) -> &'static str {
        match self {
            VendorFormat::Varian => "Varian",
            VendorFormat::Bruker => "Bruker",
            VendorFormat::BrukerSpectrum => "Bruker spectrum",
            VendorFormat::Chemagnetics => "Chemagnetics",
            VendorFormat::Magritek => "Magritek",
            VendorFormat::Simpson => "SIMPSON",
            VendorFormat::NMRPipe => "NMR pipe",
            VendorFormat::Json => "JSON",
            VendorFormat::Matlab => "Matlab",
        }
    }
}

impl std::fmt::Display for VendorFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VendorFormat::Varian => write!(f, "Varian/Agilent"),
            VendorFormat::Bruker => write!(f, "Bruker TopSpin (fid/ser)"),
            VendorFormat::BrukerSpectrum => write!(f, "Bruker TopSpin (processed)"),
            VendorFormat::Chemagnetics => write!(f, "Chemagnetics"),
            VendorFormat::Magritek => write!(f, "Magritek"),
            VendorFormat::Simpson => write!(f, "SIMPSON"),
            VendorFormat::NMRPipe => write!(f, "NMRPipe"),
            VendorFormat::Json => write!(f, "JSON interchange"),
            VendorFormat::Matlab => write!(f, "MATLAB"),
        }
    }
}

/// Where a dataset came from, so it can be re-read from disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadSource {
    pub path: PathBuf,
    pub format: VendorFormat,
}

/// Metadata inconsistencies between the sample array and its axes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ShapeError {
    #[error("data must have at least one dimension")]
    Scalar,
    #[error("metadata describes {axes} axes but data has {ndim}")]
    AxisCount { axes: usize, ndim: usize },
    #[error("axis {axis}: coordinate array has {len} entries for {points} points")]
    XaxLength {
        axis: usize,
        len: usize,
        points: usize,
    },
}

/// Acquisition metadata for one dimension
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AxisParams {
    /// Spectrometer frequency (Hz)
    pub freq: f64,
    /// Sweep width (Hz)
    pub sw: f64,
    /// true = frequency domain, false = time domain
    pub spec: bool,
    pub whole_echo: bool,
    /// Reference frequency (Hz); None when unset
    pub reference: Option<f64>,
    /// Explicit coordinates, one per point
    pub xax: Vec<f64>,
}

impl AxisParams {
    /// Axis with default echo/reference settings; coordinates are filled in
    /// when the dataset is assembled.
    pub fn new(freq: f64, sw: f64, spec: bool) -> Self {
        Self {
            freq,
            sw,
            spec,
            whole_echo: false,
            reference: None,
            xax: Vec::new(),
        }
    }

    /// Default coordinates for `n` points under the current settings.
    ///
    /// Time domain: `k / sw`. Frequency domain: `(k - floor(n/2)) * sw / n`,
    /// shifted by `freq - reference` when a reference is set.
    pub fn default_xax(&self, n: usize) -> Vec<f64> {
        if self.spec {
            let half = (n / 2) as f64;
            let offset = self.reference.map(|r| self.freq - r).unwrap_or(0.0);
            (0..n)
                .map(|k| (k as f64 - half) * self.sw / n as f64 + offset)
                .collect()
        } else {
            (0..n).map(|k| k as f64 / self.sw).collect()
        }
    }
}

/// Canonical spectral dataset: an N-d complex array with per-axis metadata
/// and a provenance log.
///
/// Mutation is restricted to the crate; outside code changes a dataset by
/// running commands through a workspace.
#[derive(Debug, Clone, PartialEq)]
pub struct SpectrumData {
    pub(crate) data: ArrayD<Complex64>,
    pub(crate) axes: Vec<AxisParams>,
    pub(crate) history: Vec<String>,
    pub(crate) reload_source: Option<ReloadSource>,
}

impl SpectrumData {
    /// Assemble a dataset. Axes with an empty coordinate array get default
    /// coordinates; non-empty ones must match the data shape.
    pub fn new(data: ArrayD<Complex64>, mut axes: Vec<AxisParams>) -> Result<Self, ShapeError> {
        if data.ndim() == 0 {
            return Err(ShapeError::Scalar);
        }
        if axes.len() != data.ndim() {
            return Err(ShapeError::AxisCount {
                axes: axes.len(),
                ndim: data.ndim(),
            });
        }
        for (i, axis) in axes.iter_mut().enumerate() {
            let n = data.shape()[i];
            if axis.xax.is_empty() {
                axis.xax = axis.default_xax(n);
            }
        }
        let spectrum = Self {
            data,
            axes,
            history: Vec::new(),
            reload_source: None,
        };
        spectrum.validate()?;
        Ok(spectrum)
    }

    /// 1-D convenience constructor.
    pub fn from_vec(values: Vec<Complex64>, axis: AxisParams) -> Result<Self, ShapeError> {
        let n = values.len();
        let data = ArrayD::from_shape_vec(IxDyn(&[n]), values)
            .map_err(|_| ShapeError::Scalar)?;
        Self::new(data, vec![axis])
    }

    /// Check the per-axis invariants.
    pub fn validate(&self) -> Result<(), ShapeError> {
        if self.axes.len() != self.data.ndim() {
            return Err(ShapeError::AxisCount {
                axes: self.axes.len(),
                ndim: self.data.ndim(),
            });
        }
        for (i, axis) in self.axes.iter().enumerate() {
            let points = self.data.shape()[i];
            if axis.xax.len() != points {
                return Err(ShapeError::XaxLength {
                    axis: i,
                    len: axis.xax.len(),
                    points,
                });
            }
        }
        Ok(())
    }

    pub fn data(&self) -> &ArrayD<Complex64> {
        &self.data
    }

    pub fn axes(&self) -> &[AxisParams] {
        &self.axes
    }

    pub fn axis(&self, i: usize) -> Option<&AxisParams> {
        self.axes.get(i)
    }

    pub fn history(&self) -> &[String] {
        &self.history
    }

    pub fn reload_source(&self) -> Option<&ReloadSource> {
        self.reload_source.as_ref()
    }

    pub fn ndim(&self) -> usize {
        self.data.ndim()
    }

    pub fn shape(&self) -> &[usize] {
        self.data.shape()
    }

    pub fn freq(&self) -> Vec<f64> {
        self.axes.iter().map(|a| a.freq).collect()
    }

    pub fn sw(&self) -> Vec<f64> {
        self.axes.iter().map(|a| a.sw).collect()
    }

    pub fn spec(&self) -> Vec<bool> {
        self.axes.iter().map(|a| a.spec).collect()
    }

    pub fn whole_echo(&self) -> Vec<bool> {
        self.axes.iter().map(|a| a.whole_echo).collect()
    }

    pub fn reference(&self) -> Vec<Option<f64>> {
        self.axes.iter().map(|a| a.reference).collect()
    }

    pub(crate) fn set_history(&mut self, history: Vec<String>) {
        self.history = history;
    }

    pub(crate) fn set_reload_source(&mut self, source: ReloadSource) {
        self.reload_source = Some(source);
    }

    pub(crate) fn add_history(&mut self, line: impl Into<String>) {
        self.history.push(line.into());
    }

    pub(crate) fn remove_history(&mut self) -> Option<String> {
        self.history.pop()
    }

    /// Recompute the default coordinates of one axis.
    pub(crate) fn reset_xax(&mut self, axis: usize) {
        let n = self.data.shape()[axis];
        self.axes[axis].xax = self.axes[axis].default_xax(n);
    }

    /// Recompute coordinates of every axis.
    pub(crate) fn reset_all_xax(&mut self) {
        for axis in 0..self.axes.len() {
            self.reset_xax(axis);
        }
    }
}
