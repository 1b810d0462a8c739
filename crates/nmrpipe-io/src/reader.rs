//! NMRPipe data reader: read header + spectral data from files or streams.

use crate::byteswap::{float4_words, Endian};
use nmrpipe_core::enums::HdrOrder;
use nmrpipe_core::fdata::*;
use std::io::{self, Read};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ReadError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Invalid header: {0}")]
    InvalidHeader(String),
    #[error("Data truncated: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
}

/// Read an NMRPipe FDATA header from a reader.
pub fn read_fdata_header<R: Read>(reader: &mut R) -> Result<(Fdata, HdrOrder), ReadError> {
    let mut buf = vec![0u8; FDATA_BYTES];
    reader.read_exact(&mut buf)?;
    Fdata::from_bytes(&buf).map_err(|e| ReadError::InvalidHeader(e.to_string()))
}

/// Read `count` f32 values written in the header's byte order.
pub fn read_float_data<R: Read>(
    reader: &mut R,
    count: usize,
    order: HdrOrder,
) -> Result<Vec<f32>, ReadError> {
    let expected = count
        .checked_mul(4)
        .ok_or_else(|| ReadError::InvalidHeader(format!("{} values overflow the byte count", count)))?;
    // grows with what the stream actually holds
    let mut buf = Vec::new();
    reader.take(expected as u64).read_to_end(&mut buf)?;
    if buf.len() < expected {
        return Err(ReadError::Truncated {
            expected,
            got: buf.len(),
        });
    }

    let endian = match order {
        HdrOrder::Little => Endian::Little,
        HdrOrder::Big => Endian::Big,
    };
    Ok(float4_words(&buf, endian))
}

/// Read a complete NMRPipe file: header + all spectral vectors.
///
/// Each of the FDSPECNUM vectors holds FDSIZE real values, followed by
/// FDSIZE imaginary values when the data are complex.
pub fn read_nmrpipe_file<R: Read>(reader: &mut R) -> Result<(Fdata, Vec<f32>), ReadError> {
    let (fdata, order) = read_fdata_header(reader)?;

    let xsize = fdata.size(CUR_XDIM);
    let ysize = if fdata.dim_count() >= 2 {
        fdata.size(CUR_YDIM).max(1)
    } else {
        1
    };
    let factor = if fdata.is_complex() { 2 } else { 1 };
    let count = [factor, xsize, ysize]
        .iter()
        .try_fold(1usize, |acc, &n| acc.checked_mul(n))
        .ok_or_else(|| {
            ReadError::InvalidHeader(format!("{} x {} points overflow", ysize, xsize))
        })?;

    let data = read_float_data(reader, count, order)?;
    Ok((fdata, data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nmrpipe_core::enums::QuadFlag;

    fn pipe_bytes(order: HdrOrder, complex: bool, values: &[f32]) -> Vec<u8> {
        let mut fd = Fdata::new();
        fd.init_default();
        let npts = if complex { values.len() / 2 } else { values.len() };
        let quad = if complex { QuadFlag::Complex } else { QuadFlag::Real };
        fd.data[FDSIZE] = npts as f32;
        fd.data[FDQUADFLAG] = quad as i32 as f32;
        let mut bytes = fd.to_bytes(order);
        for v in values {
            match order {
                HdrOrder::Little => bytes.extend_from_slice(&v.to_le_bytes()),
                HdrOrder::Big => bytes.extend_from_slice(&v.to_be_bytes()),
            }
        }
        bytes
    }

    #[test]
    fn test_read_big_endian_complex_vector() {
        let bytes = pipe_bytes(HdrOrder::Big, true, &[1.0, 2.0, -1.0, -2.0]);
        let (fd, data) = read_nmrpipe_file(&mut bytes.as_slice()).unwrap();
        assert_eq!(fd.size(CUR_XDIM), 2);
        assert_eq!(data, vec![1.0, 2.0, -1.0, -2.0]);
    }

    #[test]
    fn test_truncated_data() {
        let mut bytes = pipe_bytes(HdrOrder::Little, false, &[1.0, 2.0, 3.0]);
        bytes.truncate(bytes.len() - 4);
        match read_nmrpipe_file(&mut bytes.as_slice()) {
            Err(ReadError::Truncated { expected, got }) => {
                assert_eq!(expected, 12);
                assert_eq!(got, 8);
            }
            other => panic!("expected truncation, got {:?}", other.map(|(_, d)| d)),
        }
    }

    #[test]
    fn test_oversized_header_sizes() {
        let mut fd = Fdata::new();
        fd.init_default();
        fd.data[FDSIZE] = 1.0e30;
        fd.set_dim_count(2);
        fd.set(DimParm::Size, CUR_YDIM, 1.0e30);
        let mut bytes = fd.to_bytes(HdrOrder::Little);
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        assert!(matches!(
            read_nmrpipe_file(&mut bytes.as_slice()),
            Err(ReadError::InvalidHeader(_))
        ));

        fd.set(DimParm::Size, CUR_YDIM, 1.0);
        fd.data[FDSIZE] = 1.0e9;
        let mut bytes = fd.to_bytes(HdrOrder::Little);
        bytes.extend_from_slice(&1.0f32.to_le_bytes());
        match read_nmrpipe_file(&mut bytes.as_slice()) {
            Err(ReadError::Truncated { got, .. }) => assert_eq!(got, 4),
            other => panic!("expected truncation, got {:?}", other.map(|(_, d)| d.len())),
        }
    }
}
