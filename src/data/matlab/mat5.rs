//! MAT v5 tagged-element decoder and encoder.
//!
//! A 128-byte text header (endian indicator at bytes 126..128) is followed
//! by data elements: an 8-byte tag (type, byte count) or a 4-byte "small"
//! tag packing both into one word, then the payload padded to 8 bytes.
//! `miCOMPRESSED` elements hold one zlib-compressed element.

use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use chrono::Local;
use flate2::read::ZlibDecoder;
use nmrpipe_io::{float4_words, float8_words, int2_words, int4_words, Endian};

use super::{MatValue, NumericArray};
use crate::data::LoadError;

const HEADER_BYTES: usize = 128;

// data element types
const MI_INT8: u32 = 1;
const MI_UINT8: u32 = 2;
const MI_INT16: u32 = 3;
const MI_UINT16: u32 = 4;
const MI_INT32: u32 = 5;
const MI_UINT32: u32 = 6;
const MI_SINGLE: u32 = 7;
const MI_DOUBLE: u32 = 9;
const MI_INT64: u32 = 12;
const MI_UINT64: u32 = 13;
const MI_MATRIX: u32 = 14;
const MI_COMPRESSED: u32 = 15;
const MI_UTF8: u32 = 16;

// array classes
const MX_CELL: u32 = 1;
const MX_STRUCT: u32 = 2;
const MX_CHAR: u32 = 4;
const MX_DOUBLE: u32 = 6;
const MX_UINT64: u32 = 15;

const FLAG_COMPLEX: u32 = 0x0800;
const FIELD_NAME_LEN: usize = 32;

fn malformed(msg: impl Into<String>) -> LoadError {
    LoadError::MalformedContainer(msg.into())
}

fn pad8(n: usize) -> usize {
    n.div_ceil(8) * 8
}

/// One decoded element: type, payload, offset of the next element.
struct Element<'a> {
    kind: u32,
    data: &'a [u8],
    next: usize,
}

struct Reader {
    endian: Endian,
}

impl Reader {
    fn u32(&self, b: &[u8]) -> u32 {
        match self.endian {
            Endian::Little => LittleEndian::read_u32(b),
            Endian::Big => BigEndian::read_u32(b),
        }
    }

    fn element<'a>(&self, buf: &'a [u8], pos: usize) -> Result<Element<'a>, LoadError> {
        let tag = buf
            .get(pos..pos + 8)
            .ok_or_else(|| malformed(format!("element tag at {} runs past the end", pos)))?;
        let first = self.u32(&tag[..4]);
        if first >> 16 != 0 {
            let n = (first >> 16) as usize;
            if n > 4 {
                return Err(malformed(format!("small element at {} claims {} bytes", pos, n)));
            }
            return Ok(Element {
                kind: first & 0xffff,
                data: &buf[pos + 4..pos + 4 + n],
                next: pos + 8,
            });
        }
        let n = self.u32(&tag[4..]) as usize;
        let data = buf
            .get(pos + 8..pos + 8 + n)
            .ok_or_else(|| malformed(format!("element at {} needs {} bytes", pos, n)))?;
        let next = if first == MI_COMPRESSED {
            pos + 8 + n
        } else {
            pos + 8 + pad8(n)
        };
        Ok(Element {
            kind: first,
            data,
            next,
        })
    }

    fn numbers(&self, kind: u32, raw: &[u8]) -> Result<Vec<f64>, LoadError> {
        let big = self.endian == Endian::Big;
        let values = match kind {
            MI_INT8 => raw.iter().map(|&b| f64::from(b as i8)).collect(),
            MI_UINT8 => raw.iter().map(|&b| f64::from(b)).collect(),
            MI_INT16 => int2_words(raw, self.endian).into_iter().map(f64::from).collect(),
            MI_UINT16 => raw
                .chunks_exact(2)
                .map(|c| f64::from(if big { BigEndian::read_u16(c) } else { LittleEndian::read_u16(c) }))
                .collect(),
            MI_INT32 => int4_words(raw, self.endian).into_iter().map(f64::from).collect(),
            MI_UINT32 => raw.chunks_exact(4).map(|c| f64::from(self.u32(c))).collect(),
            MI_SINGLE => float4_words(raw, self.endian).into_iter().map(f64::from).collect(),
            MI_DOUBLE => float8_words(raw, self.endian),
            MI_INT64 => raw
                .chunks_exact(8)
                .map(|c| (if big { BigEndian::read_i64(c) } else { LittleEndian::read_i64(c) }) as f64)
                .collect(),
            MI_UINT64 => raw
                .chunks_exact(8)
                .map(|c| (if big { BigEndian::read_u64(c) } else { LittleEndian::read_u64(c) }) as f64)
                .collect(),
            other => return Err(LoadError::Unsupported(format!("MAT numeric element type {}", other))),
        };
        Ok(values)
    }

    fn text_units(&self, kind: u32, raw: &[u8]) -> Result<Vec<u16>, LoadError> {
        match kind {
            MI_UTF8 => Ok(String::from_utf8_lossy(raw).encode_utf16().collect()),
            MI_INT8 | MI_UINT8 => Ok(raw.iter().map(|&b| u16::from(b)).collect()),
            _ => Ok(self.numbers(kind, raw)?.into_iter().map(|v| v as u16).collect()),
        }
    }

    /// Parse the payload of an `miMATRIX` element.
    fn matrix(&self, buf: &[u8]) -> Result<(String, MatValue), LoadError> {
        if buf.is_empty() {
            return Ok((String::new(), MatValue::real(vec![0, 0], Vec::new())));
        }
        let flags_el = self.element(buf, 0)?;
        if flags_el.data.len() < 4 {
            return Err(malformed("array flags element too short"));
        }
        let flags = self.u32(&flags_el.data[..4]);
        let class = flags & 0xff;

        let dims_el = self.element(buf, flags_el.next)?;
        let dims: Vec<usize> = self
            .numbers(dims_el.kind, dims_el.data)?
            .into_iter()
            .map(|d| d.max(0.0) as usize)
            .collect();
        let name_el = self.element(buf, dims_el.next)?;
        let name = String::from_utf8_lossy(name_el.data).into_owned();
        let count = dims
            .iter()
            .try_fold(1usize, |acc, &d| acc.checked_mul(d))
            .ok_or_else(|| LoadError::CorruptHeader(format!("MAT dimensions {:?} overflow", dims)))?;
        let mut pos = name_el.next;

        let value = match class {
            MX_CELL => {
                // every item is an element of at least 8 bytes
                let mut items = Vec::with_capacity(count.min(buf.len() / 8));
                for _ in 0..count {
                    let el = self.element(buf, pos)?;
                    items.push(self.matrix(el.data)?.1);
                    pos = el.next;
                }
                MatValue::Cell { dims, items }
            }
            MX_STRUCT => {
                let len_el = self.element(buf, pos)?;
                let name_len = self
                    .numbers(len_el.kind, len_el.data)?
                    .first()
                    .copied()
                    .unwrap_or(0.0) as usize;
                let names_el = self.element(buf, len_el.next)?;
                pos = names_el.next;
                let names: Vec<String> = if name_len == 0 {
                    Vec::new()
                } else {
                    names_el
                        .data
                        .chunks(name_len)
                        .map(|c| {
                            let end = c.iter().position(|&b| b == 0).unwrap_or(c.len());
                            String::from_utf8_lossy(&c[..end]).into_owned()
                        })
                        .collect()
                };
                let mut fields = Vec::with_capacity(names.len());
                let elements = if names.is_empty() { 0 } else { count };
                for element in 0..elements {
                    for field in &names {
                        let el = self.element(buf, pos)?;
                        let value = self.matrix(el.data)?.1;
                        pos = el.next;
                        if element == 0 {
                            fields.push((field.clone(), value));
                        }
                    }
                }
                MatValue::Struct(fields)
            }
            MX_CHAR => {
                let el = self.element(buf, pos)?;
                MatValue::Char {
                    dims,
                    units: self.text_units(el.kind, el.data)?,
                }
            }
            MX_DOUBLE..=MX_UINT64 => {
                let re_el = self.element(buf, pos)?;
                let re = self.numbers(re_el.kind, re_el.data)?;
                let im = if flags & FLAG_COMPLEX != 0 {
                    let im_el = self.element(buf, re_el.next)?;
                    Some(self.numbers(im_el.kind, im_el.data)?)
                } else {
                    None
                };
                MatValue::Numeric(NumericArray { dims, re, im })
            }
            other => {
                return Err(LoadError::Unsupported(format!(
                    "MAT array class {} in '{}'",
                    other, name
                )))
            }
        };
        Ok((name, value))
    }
}

/// Decode every variable of a MAT v5 file, in file order.
pub fn parse(bytes: &[u8]) -> Result<Vec<(String, MatValue)>, LoadError> {
    if bytes.len() < HEADER_BYTES {
        return Err(malformed("file shorter than the MAT v5 header"));
    }
    let endian = match &bytes[126..128] {
        b"IM" => Endian::Little,
        b"MI" => Endian::Big,
        other => {
            return Err(malformed(format!(
                "bad MAT endian indicator {:?}",
                String::from_utf8_lossy(other)
            )))
        }
    };
    let reader = Reader { endian };

    let mut variables = Vec::new();
    let mut pos = HEADER_BYTES;
    while pos + 8 <= bytes.len() {
        let el = reader.element(bytes, pos)?;
        match el.kind {
            MI_MATRIX => variables.push(reader.matrix(el.data)?),
            MI_COMPRESSED => {
                let mut inflated = Vec::new();
                ZlibDecoder::new(el.data).read_to_end(&mut inflated)?;
                let inner = reader.element(&inflated, 0)?;
                if inner.kind == MI_MATRIX {
                    variables.push(reader.matrix(inner.data)?);
                }
            }
            other => log::debug!("skipping MAT element type {} at {}", other, pos),
        }
        pos = el.next;
    }
    Ok(variables)
}

// ────────────────────────────────────────────────────────────────
//  Encoder (little-endian, uncompressed)
// ────────────────────────────────────────────────────────────────

fn put_element(out: &mut Vec<u8>, kind: u32, data: &[u8]) {
    out.extend_from_slice(&kind.to_le_bytes());
    out.extend_from_slice(&(data.len() as u32).to_le_bytes());
    out.extend_from_slice(data);
    out.resize(out.len() + pad8(data.len()) - data.len(), 0);
}

fn f64_bytes(values: &[f64]) -> Vec<u8> {
    let mut buf = vec![0u8; values.len() * 8];
    LittleEndian::write_f64_into(values, &mut buf);
    buf
}

fn matrix_bytes(name: &str, value: &MatValue) -> Vec<u8> {
    let (class, dims): (u32, Vec<usize>) = match value {
        MatValue::Numeric(a) => (MX_DOUBLE, a.dims.clone()),
        MatValue::Char { dims, .. } => (MX_CHAR, dims.clone()),
        MatValue::Cell { dims, .. } => (MX_CELL, dims.clone()),
        MatValue::Struct(_) => (MX_STRUCT, vec![1, 1]),
    };
    let complex = matches!(value, MatValue::Numeric(NumericArray { im: Some(_), .. }));
    let flags = class | if complex { FLAG_COMPLEX } else { 0 };

    let mut body = Vec::new();
    let mut flag_words = Vec::with_capacity(8);
    flag_words.extend_from_slice(&flags.to_le_bytes());
    flag_words.extend_from_slice(&0u32.to_le_bytes());
    put_element(&mut body, MI_UINT32, &flag_words);
    let dim_bytes: Vec<u8> = dims.iter().flat_map(|&d| (d as i32).to_le_bytes()).collect();
    put_element(&mut body, MI_INT32, &dim_bytes);
    put_element(&mut body, MI_INT8, name.as_bytes());

    match value {
        MatValue::Numeric(a) => {
            put_element(&mut body, MI_DOUBLE, &f64_bytes(&a.re));
            if let Some(im) = &a.im {
                put_element(&mut body, MI_DOUBLE, &f64_bytes(im));
            }
        }
        MatValue::Char { units, .. } => {
            let bytes: Vec<u8> = units.iter().flat_map(|u| u.to_le_bytes()).collect();
            put_element(&mut body, MI_UINT16, &bytes);
        }
        MatValue::Cell { items, .. } => {
            for item in items {
                body.extend(matrix_bytes("", item));
            }
        }
        MatValue::Struct(fields) => {
            put_element(&mut body, MI_INT32, &(FIELD_NAME_LEN as i32).to_le_bytes());
            let mut names = Vec::with_capacity(fields.len() * FIELD_NAME_LEN);
            for (field, _) in fields {
                let mut slot = [0u8; FIELD_NAME_LEN];
                let n = field.len().min(FIELD_NAME_LEN - 1);
                slot[..n].copy_from_slice(&field.as_bytes()[..n]);
                names.extend_from_slice(&slot);
            }
            put_element(&mut body, MI_INT8, &names);
            for (_, v) in fields {
                body.extend(matrix_bytes("", v));
            }
        }
    }

    let mut out = Vec::with_capacity(body.len() + 8);
    put_element(&mut out, MI_MATRIX, &body);
    out
}

/// Complete MAT v5 file holding one variable.
pub fn encode_file(name: &str, value: &MatValue) -> Vec<u8> {
    let text = format!(
        "MATLAB 5.0 MAT-file, Platform: {}, Created on: {}",
        std::env::consts::OS,
        Local::now().format("%a %b %e %H:%M:%S %Y")
    );
    let mut out: Vec<u8> = text.bytes().take(116).collect();
    out.resize(116, b' ');
    out.extend_from_slice(&[0u8; 8]);
    out.extend_from_slice(&0x0100u16.to_le_bytes());
    out.extend_from_slice(b"IM");
    out.extend(matrix_bytes(name, value));
    out
}
