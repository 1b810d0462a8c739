//! NMRPipe FDATA header: 512-float array defining spectral data parameters.
//!
//! The header is 2048 bytes (512 × 4-byte floats). Only the slots needed to
//! recover sizes, domains and frequency metadata of the first two
//! dimensions are named here.

use crate::enums::*;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::fmt;
use thiserror::Error;

// ─── Constants ──────────────────────────────────────────────────────────────

/// Number of 4-byte float values in the FDATA header.
pub const FDATA_SIZE: usize = 512;
/// Header size in bytes.
pub const FDATA_BYTES: usize = FDATA_SIZE * 4; // 2048
/// IEEE floating-point format constant.
pub const FD_IEEE_CONS: u32 = 0xEEEEEEEE;
/// Byte-order test constant.
pub const FD_ORDER_CONS: f32 = 2.345;

// ─── General parameter locations ────────────────────────────────────────────

pub const FDMAGIC: usize = 0;
pub const FDFLTFORMAT: usize = 1;
pub const FDFLTORDER: usize = 2;

pub const FDSIZE: usize = 99;
pub const FDSPECNUM: usize = 219;
pub const FDQUADFLAG: usize = 106;
pub const FDTRANSPOSED: usize = 221;
pub const FDDIMCOUNT: usize = 9;
pub const FDDIMORDER1: usize = 24;
pub const FDDIMORDER2: usize = 25;

// ─── F2 (dimension 2, direct detect / X-axis) ───────────────────────────────

pub const FDF2SW: usize = 100;
pub const FDF2OBS: usize = 119;
pub const FDF2ORIG: usize = 101;
pub const FDF2QUADFLAG: usize = 56;
pub const FDF2FTFLAG: usize = 220;

// ─── F1 (dimension 1, first indirect / Y-axis) ─────────────────────────────

pub const FDF1SW: usize = 229;
pub const FDF1OBS: usize = 218;
pub const FDF1ORIG: usize = 249;
pub const FDF1QUADFLAG: usize = 55;
pub const FDF1FTFLAG: usize = 222;

/// Current-axis codes accepted by the per-dimension accessors.
pub const CUR_XDIM: usize = 1;
pub const CUR_YDIM: usize = 2;

/// Per-dimension parameter kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DimParm {
    Size,
    Sw,
    Obs,
    Orig,
    FtFlag,
    QuadFlag,
}

impl DimParm {
    /// Header slot holding this parameter for the given axis.
    fn slot(self, dim: usize) -> Option<usize> {
        let slot = match (self, dim) {
            (Self::Size, CUR_XDIM) => FDSIZE,
            (Self::Size, CUR_YDIM) => FDSPECNUM,
            (Self::Sw, CUR_XDIM) => FDF2SW,
            (Self::Sw, CUR_YDIM) => FDF1SW,
            (Self::Obs, CUR_XDIM) => FDF2OBS,
            (Self::Obs, CUR_YDIM) => FDF1OBS,
            (Self::Orig, CUR_XDIM) => FDF2ORIG,
            (Self::Orig, CUR_YDIM) => FDF1ORIG,
            (Self::FtFlag, CUR_XDIM) => FDF2FTFLAG,
            (Self::FtFlag, CUR_YDIM) => FDF1FTFLAG,
            (Self::QuadFlag, CUR_XDIM) => FDF2QUADFLAG,
            (Self::QuadFlag, CUR_YDIM) => FDF1QUADFLAG,
            _ => return None,
        };
        Some(slot)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum FdataError {
    #[error("buffer too small for FDATA header: {0} bytes")]
    TooSmall(usize),
    #[error("invalid FDATA header: byte order check failed")]
    BadOrder,
}

// ─── FDATA structure ────────────────────────────────────────────────────────

/// The NMRPipe 512-float header array.
#[derive(Clone)]
pub struct Fdata {
    pub data: [f32; FDATA_SIZE],
}

impl Default for Fdata {
    fn default() -> Self {
        Self::new()
    }
}

impl Fdata {
    /// Create a zeroed FDATA header.
    pub fn new() -> Self {
        Self {
            data: [0.0f32; FDATA_SIZE],
        }
    }

    /// Initialize with NMRPipe defaults (float format, byte order, dimension order 2 1).
    pub fn init_default(&mut self) {
        self.data.fill(0.0);
        self.data[FDFLTFORMAT] = FD_IEEE_CONS as f32;
        self.data[FDFLTORDER] = FD_ORDER_CONS;
        self.data[FDDIMORDER1] = 2.0;
        self.data[FDDIMORDER2] = 1.0;
        self.data[FDDIMCOUNT] = 1.0;
        self.data[FDSPECNUM] = 1.0;
    }

    /// Get a per-dimension parameter. Unknown combinations read as 0.
    pub fn get(&self, parm: DimParm, dim: usize) -> f32 {
        parm.slot(dim).map(|loc| self.data[loc]).unwrap_or(0.0)
    }

    /// Set a per-dimension parameter. Unknown combinations are ignored.
    pub fn set(&mut self, parm: DimParm, dim: usize, val: f32) {
        if let Some(loc) = parm.slot(dim) {
            self.data[loc] = val;
        }
    }

    /// Number of points along an axis.
    pub fn size(&self, dim: usize) -> usize {
        self.get(DimParm::Size, dim).max(0.0) as usize
    }

    /// Spectral width in Hz.
    pub fn sw(&self, dim: usize) -> f64 {
        self.get(DimParm::Sw, dim) as f64
    }

    /// Observe frequency in MHz.
    pub fn obs(&self, dim: usize) -> f64 {
        self.get(DimParm::Obs, dim) as f64
    }

    /// Spectral origin in Hz.
    pub fn orig(&self, dim: usize) -> f64 {
        self.get(DimParm::Orig, dim) as f64
    }

    /// Is this dimension in the frequency domain?
    pub fn is_freq(&self, dim: usize) -> bool {
        self.get(DimParm::FtFlag, dim) as i32 != 0
    }

    /// Is the sample data complex? Reads the global FDQUADFLAG.
    pub fn is_complex(&self) -> bool {
        QuadFlag::from_i32(self.data[FDQUADFLAG] as i32)
            .map(QuadFlag::is_complex)
            .unwrap_or(false)
    }

    /// Get dimension count.
    pub fn dim_count(&self) -> usize {
        self.data[FDDIMCOUNT].max(1.0) as usize
    }

    /// Set dimension count.
    pub fn set_dim_count(&mut self, n: usize) {
        self.data[FDDIMCOUNT] = n as f32;
    }

    // ─── Header I/O ─────────────────────────────────────────────────────

    /// Serialize to bytes in the requested byte order.
    pub fn to_bytes(&self, order: HdrOrder) -> Vec<u8> {
        let mut buf = vec![0u8; FDATA_BYTES];
        match order {
            HdrOrder::Little => LittleEndian::write_f32_into(&self.data, &mut buf),
            HdrOrder::Big => BigEndian::write_f32_into(&self.data, &mut buf),
        }
        buf
    }

    /// Deserialize from bytes, auto-detecting byte order.
    pub fn from_bytes(buf: &[u8]) -> Result<(Self, HdrOrder), FdataError> {
        if buf.len() < FDATA_BYTES {
            return Err(FdataError::TooSmall(buf.len()));
        }

        for order in [HdrOrder::Little, HdrOrder::Big] {
            let mut fdata = Self::new();
            match order {
                HdrOrder::Little => {
                    LittleEndian::read_f32_into(&buf[..FDATA_BYTES], &mut fdata.data)
                }
                HdrOrder::Big => BigEndian::read_f32_into(&buf[..FDATA_BYTES], &mut fdata.data),
            }
            if fdata.has_order_constant() {
                return Ok((fdata, order));
            }
        }

        Err(FdataError::BadOrder)
    }

    fn has_order_constant(&self) -> bool {
        (self.data[FDFLTORDER] - FD_ORDER_CONS).abs() < 0.001
    }
}

impl fmt::Debug for Fdata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fdata")
            .field("dim_count", &self.dim_count())
            .field("x_size", &self.size(CUR_XDIM))
            .field("y_size", &self.size(CUR_YDIM))
            .field("complex", &self.is_complex())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_header() {
        let mut fd = Fdata::new();
        fd.init_default();
        assert_eq!(fd.dim_count(), 1);
        assert_eq!(fd.data[FDDIMORDER1] as i32, 2);
        assert_eq!(fd.data[FDDIMORDER2] as i32, 1);
    }

    #[test]
    fn test_get_set_parm() {
        let mut fd = Fdata::new();
        fd.init_default();
        fd.set_dim_count(2);
        fd.set(DimParm::Size, CUR_XDIM, 1024.0);
        fd.set(DimParm::Size, CUR_YDIM, 256.0);
        assert_eq!(fd.size(CUR_XDIM), 1024);
        assert_eq!(fd.size(CUR_YDIM), 256);
        assert_eq!(fd.get(DimParm::Sw, 3), 0.0);
    }

    #[test]
    fn test_roundtrip_bytes_both_orders() {
        let mut fd = Fdata::new();
        fd.init_default();
        fd.set(DimParm::Sw, CUR_XDIM, 10000.0);
        for order in [HdrOrder::Little, HdrOrder::Big] {
            let bytes = fd.to_bytes(order);
            let (fd2, found) = Fdata::from_bytes(&bytes).unwrap();
            assert_eq!(found, order);
            assert!((fd2.sw(CUR_XDIM) - 10000.0).abs() < 0.01);
        }
    }

    #[test]
    fn test_rejects_bad_order_constant() {
        let buf = vec![0u8; FDATA_BYTES];
        assert_eq!(Fdata::from_bytes(&buf).unwrap_err(), FdataError::BadOrder);
        assert_eq!(
            Fdata::from_bytes(&buf[..10]).unwrap_err(),
            FdataError::TooSmall(10)
        );
    }
}
