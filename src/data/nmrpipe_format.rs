/// NMRPipe format reader
///
/// NMRPipe uses a 2048-byte (512 float32) header followed by spectral data.
/// Header decoding and byte-order detection live in the `nmrpipe-core` and
/// `nmrpipe-io` crates; this module maps the result onto a `SpectrumData`.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use ndarray::{ArrayD, Axis, IxDyn};
use nmrpipe_core::fdata::{Fdata, CUR_XDIM, CUR_YDIM};
use nmrpipe_io::{read_nmrpipe_file, ReadError};
use num_complex::Complex64;

use super::spectrum::{AxisParams, SpectrumData};
use super::LoadError;

impl From<ReadError> for LoadError {
    fn from(e: ReadError) -> Self {
        match e {
            ReadError::Io(io) => LoadError::Io(io),
            ReadError::InvalidHeader(msg) => LoadError::MalformedContainer(msg),
            ReadError::Truncated { expected, got } => LoadError::Truncated { expected, got },
        }
    }
}

/// Axis metadata of one header dimension.
fn axis_params(fdata: &Fdata, dim: usize) -> AxisParams {
    let n = fdata.size(dim).max(1) as f64;
    let freq = fdata.obs(dim) * 1e6;
    let sw = fdata.sw(dim);
    let mut axis = AxisParams::new(freq, sw, fdata.is_freq(dim));
    // ORIG is the frequency of the last point
    let side = -(n / 2.0).floor() / n * sw;
    axis.reference = Some(side + freq - fdata.orig(dim));
    axis
}

/// Read an NMRPipe `.fid` / `.ft*` file.
pub fn read_nmrpipe(path: &Path, _warnings: &mut Vec<String>) -> Result<SpectrumData, LoadError> {
    let file = File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            LoadError::MissingFile(path.to_path_buf())
        } else {
            LoadError::Io(e)
        }
    })?;
    let (fdata, values) = read_nmrpipe_file(&mut BufReader::new(file))?;

    let xsize = fdata.size(CUR_XDIM);
    let two_d = fdata.dim_count() >= 2;
    let ysize = if two_d { fdata.size(CUR_YDIM).max(1) } else { 1 };
    let complex = fdata.is_complex();
    log::debug!("NMRPipe {}: {:?}", path.display(), fdata);

    let per_vector = if complex { 2 * xsize } else { xsize };
    let mut samples = Vec::with_capacity(xsize * ysize);
    for vector in values.chunks_exact(per_vector.max(1)) {
        let (re, im) = vector.split_at(xsize);
        samples.extend((0..xsize).map(|k| {
            let imag = if complex { f64::from(im[k]) } else { 0.0 };
            Complex64::new(f64::from(re[k]), imag)
        }));
    }

    let mut axes = vec![axis_params(&fdata, CUR_XDIM)];
    let shape = if two_d {
        axes.insert(0, axis_params(&fdata, CUR_YDIM));
        vec![ysize, xsize]
    } else {
        vec![xsize]
    };
    let mut data = ArrayD::from_shape_vec(IxDyn(&shape), samples)
        .map_err(|e| LoadError::CorruptHeader(e.to_string()))?;
    if fdata.is_freq(CUR_XDIM) {
        let last = data.ndim() - 1;
        data.invert_axis(Axis(last));
        data = data.as_standard_layout().into_owned();
    }

    Ok(SpectrumData::new(data, axes)?)
}
