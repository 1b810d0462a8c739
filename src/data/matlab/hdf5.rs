//! Read-only HDF5 subset for MATLAB v7.3 files.
//!
//! Covers what MATLAB writes: superblocks v0-v3 (found after a user block),
//! object headers v1/v2 with continuation blocks, symbol-table and
//! compact-link groups, compact/contiguous/chunked layouts (v1 B-tree
//! chunk index) with deflate, shuffle and fletcher32 filters, and
//! fixed-point, floating, string, compound and object-reference types.
//!
//! HDF5 dimensions are the reverse of MATLAB's, so the row-major element
//! order on disk is MATLAB's column-major order; values are returned in
//! MATLAB order to match the MAT v5 decoder.

use std::cell::Cell;
use std::collections::HashSet;
use std::io::Read;

use byteorder::{BigEndian, ByteOrder, LittleEndian};
use flate2::read::ZlibDecoder;

use super::{MatValue, NumericArray};
use crate::data::LoadError;

const SIGNATURE: &[u8; 8] = b"\x89HDF\r\n\x1a\n";
const MAX_DEPTH: usize = 64;
/// Upper bound on the deflate expansion ratio.
const MAX_INFLATION: usize = 1032;
/// Continuation blocks followed per object header.
const MAX_BLOCKS: usize = 1024;

mod msg {
    pub const DATASPACE: u16 = 0x0001;
    pub const LINK_INFO: u16 = 0x0002;
    pub const DATATYPE: u16 = 0x0003;
    pub const LINK: u16 = 0x0006;
    pub const LAYOUT: u16 = 0x0008;
    pub const FILTERS: u16 = 0x000B;
    pub const ATTRIBUTE: u16 = 0x000C;
    pub const CONTINUATION: u16 = 0x0010;
    pub const SYMBOL_TABLE: u16 = 0x0011;
}

mod filter {
    pub const DEFLATE: u16 = 1;
    pub const SHUFFLE: u16 = 2;
    pub const FLETCHER32: u16 = 3;
}

fn malformed(msg: impl Into<String>) -> LoadError {
    LoadError::MalformedContainer(format!("HDF5: {}", msg.into()))
}

// ────────────────────────────────────────────────────────────────
//  Little-endian cursor
// ────────────────────────────────────────────────────────────────

struct Cur<'a> {
    buf: &'a [u8],
    pos: usize,
    offset_size: usize,
    length_size: usize,
}

impl<'a> Cur<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], LoadError> {
        let end = self.pos.checked_add(n);
        let out = end
            .and_then(|end| self.buf.get(self.pos..end))
            .ok_or_else(|| malformed(format!("read of {} bytes at {} past end", n, self.pos)))?;
        self.pos += n;
        Ok(out)
    }

    fn skip(&mut self, n: usize) -> Result<(), LoadError> {
        self.take(n).map(|_| ())
    }

    fn u8(&mut self) -> Result<u8, LoadError> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16, LoadError> {
        Ok(LittleEndian::read_u16(self.take(2)?))
    }

    fn u32(&mut self) -> Result<u32, LoadError> {
        Ok(LittleEndian::read_u32(self.take(4)?))
    }

    fn uint(&mut self, n: usize) -> Result<u64, LoadError> {
        let b = self.take(n)?;
        Ok(b.iter().rev().fold(0u64, |acc, &x| (acc << 8) | u64::from(x)))
    }

    /// File address; `None` for the undefined address (all bits set).
    fn address(&mut self) -> Result<Option<u64>, LoadError> {
        let n = self.offset_size;
        let v = self.uint(n)?;
        let undefined = if n >= 8 { u64::MAX } else { (1u64 << (8 * n)) - 1 };
        Ok(if v == undefined { None } else { Some(v) })
    }

    fn length(&mut self) -> Result<u64, LoadError> {
        let n = self.length_size;
        self.uint(n)
    }

    /// Null-terminated name; consumes the terminator.
    fn cstr(&mut self) -> Result<String, LoadError> {
        let rest = &self.buf[self.pos.min(self.buf.len())..];
        let end = rest
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| malformed("unterminated name"))?;
        let name = String::from_utf8_lossy(&rest[..end]).into_owned();
        self.pos += end + 1;
        Ok(name)
    }
}

// ────────────────────────────────────────────────────────────────
//  Message payloads
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Datatype {
    Fixed { size: usize, signed: bool, big: bool },
    Float { size: usize, big: bool },
    String { size: usize },
    Compound { size: usize, members: Vec<(String, usize, Datatype)> },
    Reference { size: usize },
    Other { class: u8, size: usize },
}

impl Datatype {
    fn size(&self) -> usize {
        match self {
            Datatype::Fixed { size, .. }
            | Datatype::Float { size, .. }
            | Datatype::String { size }
            | Datatype::Compound { size, .. }
            | Datatype::Reference { size }
            | Datatype::Other { size, .. } => *size,
        }
    }

    /// Decode a datatype message, leaving the cursor after it.
    fn parse(c: &mut Cur) -> Result<Self, LoadError> {
        Self::parse_nested(c, 0)
    }

    fn parse_nested(c: &mut Cur, depth: usize) -> Result<Self, LoadError> {
        if depth > MAX_DEPTH {
            return Err(malformed("compound datatype nesting too deep"));
        }
        let class_version = c.u8()?;
        let bits = c.take(3)?;
        let (bf0, bf1) = (bits[0], bits[1]);
        let size = c.u32()? as usize;
        let class = class_version & 0x0f;
        let version = class_version >> 4;
        Ok(match class {
            0 => {
                c.skip(4)?;
                Datatype::Fixed {
                    size,
                    signed: bf0 & 0x08 != 0,
                    big: bf0 & 0x01 != 0,
                }
            }
            1 => {
                c.skip(12)?;
                Datatype::Float {
                    size,
                    big: bf0 & 0x01 != 0,
                }
            }
            3 => Datatype::String { size },
            6 => {
                let count = usize::from(bf0) | (usize::from(bf1) << 8);
                let mut members = Vec::with_capacity(count);
                for _ in 0..count {
                    let start = c.pos;
                    let name = c.cstr()?;
                    let offset = if version >= 3 {
                        let width = match size {
                            0..=0xff => 1,
                            0x100..=0xffff => 2,
                            0x1_0000..=0xff_ffff => 3,
                            _ => 4,
                        };
                        c.uint(width)? as usize
                    } else {
                        let padded = (c.pos - start).div_ceil(8) * 8;
                        c.pos = start + padded;
                        let offset = c.u32()? as usize;
                        if version == 1 {
                            c.skip(28)?;
                        }
                        offset
                    };
                    let member = Datatype::parse_nested(c, depth + 1)?;
                    if let Datatype::Other { class, .. } = member {
                        return Err(LoadError::Unsupported(format!(
                            "HDF5 compound member of class {}",
                            class
                        )));
                    }
                    members.push((name, offset, member));
                }
                Datatype::Compound { size, members }
            }
            7 if (1..=8).contains(&size) => Datatype::Reference { size },
            7 => return Err(malformed(format!("object reference of {} bytes", size))),
            other => Datatype::Other { class: other, size },
        })
    }
}

/// Dataspace dimensions; a scalar space has no dimensions.
fn parse_dataspace(data: &[u8], length_size: usize) -> Result<Vec<u64>, LoadError> {
    let mut c = Cur {
        buf: data,
        pos: 0,
        offset_size: 8,
        length_size,
    };
    let version = c.u8()?;
    let rank = usize::from(c.u8()?);
    let _flags = c.u8()?;
    match version {
        1 => c.skip(5)?,
        2 => {
            if c.u8()? == 2 {
                // null dataspace
                return Ok(vec![0]);
            }
        }
        v => return Err(LoadError::Unsupported(format!("HDF5 dataspace version {}", v))),
    }
    (0..rank).map(|_| c.length()).collect()
}

#[derive(Debug, Clone, PartialEq)]
enum Layout {
    Compact(Vec<u8>),
    Contiguous(Option<u64>),
    Chunked { btree: Option<u64>, dims: Vec<u64> },
}

fn parse_layout(data: &[u8], offset_size: usize, length_size: usize) -> Result<Layout, LoadError> {
    let mut c = Cur {
        buf: data,
        pos: 0,
        offset_size,
        length_size,
    };
    let version = c.u8()?;
    match version {
        1 | 2 => {
            let rank = usize::from(c.u8()?);
            let class = c.u8()?;
            c.skip(5)?;
            let address = if class != 0 { c.address()? } else { None };
            let dims: Vec<u64> = (0..rank).map(|_| c.u32().map(u64::from)).collect::<Result<_, _>>()?;
            Ok(match class {
                0 => {
                    let n = c.u32()? as usize;
                    Layout::Compact(c.take(n)?.to_vec())
                }
                1 => Layout::Contiguous(address),
                _ => Layout::Chunked {
                    btree: address,
                    dims,
                },
            })
        }
        3 => match c.u8()? {
            0 => {
                let n = usize::from(c.u16()?);
                Ok(Layout::Compact(c.take(n)?.to_vec()))
            }
            1 => Ok(Layout::Contiguous(c.address()?)),
            2 => {
                let rank = usize::from(c.u8()?);
                let btree = c.address()?;
                let dims = (0..rank).map(|_| c.u32().map(u64::from)).collect::<Result<_, _>>()?;
                Ok(Layout::Chunked { btree, dims })
            }
            other => Err(LoadError::Unsupported(format!("HDF5 layout class {}", other))),
        },
        v => Err(LoadError::Unsupported(format!("HDF5 layout version {}", v))),
    }
}

fn parse_filters(data: &[u8]) -> Result<Vec<u16>, LoadError> {
    let mut c = Cur {
        buf: data,
        pos: 0,
        offset_size: 8,
        length_size: 8,
    };
    let version = c.u8()?;
    let count = c.u8()?;
    if version == 1 {
        c.skip(6)?;
    }
    let mut ids = Vec::with_capacity(usize::from(count));
    for _ in 0..count {
        let id = c.u16()?;
        let name_len = if version == 1 || id >= 256 { usize::from(c.u16()?) } else { 0 };
        let _flags = c.u16()?;
        let values = usize::from(c.u16()?);
        c.skip(name_len)?;
        c.skip(4 * values)?;
        if version == 1 && values % 2 == 1 {
            c.skip(4)?;
        }
        ids.push(id);
    }
    Ok(ids)
}

struct Attribute<'a> {
    name: String,
    dtype: Datatype,
    data: &'a [u8],
}

fn parse_attribute(data: &[u8]) -> Result<Attribute<'_>, LoadError> {
    let mut c = Cur {
        buf: data,
        pos: 0,
        offset_size: 8,
        length_size: 8,
    };
    let version = c.u8()?;
    let _flags = c.u8()?;
    let name_size = usize::from(c.u16()?);
    let type_size = usize::from(c.u16()?);
    let space_size = usize::from(c.u16()?);
    if version == 3 {
        c.skip(1)?;
    }
    let pad = |n: usize| if version == 1 { n.div_ceil(8) * 8 } else { n };
    let name_bytes = c.take(pad(name_size))?;
    let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
    let name = String::from_utf8_lossy(&name_bytes[..end]).into_owned();
    let type_bytes = c.take(pad(type_size))?;
    let dtype = Datatype::parse(&mut Cur {
        buf: type_bytes,
        pos: 0,
        offset_size: 8,
        length_size: 8,
    })?;
    c.skip(pad(space_size))?;
    Ok(Attribute {
        name,
        dtype,
        data: &data[c.pos..],
    })
}

// ────────────────────────────────────────────────────────────────
//  File structure
// ────────────────────────────────────────────────────────────────

struct Message<'a> {
    kind: u16,
    data: &'a [u8],
}

struct Hdf5<'a> {
    buf: &'a [u8],
    base: usize,
    offset_size: usize,
    length_size: usize,
    /// Objects left to decode; cell references may share targets.
    budget: Cell<usize>,
}

impl<'a> Hdf5<'a> {
    /// Locate the superblock (offset 0 or a power of two from 512) and
    /// return the file with the root object header address.
    fn open(buf: &'a [u8]) -> Result<(Self, u64), LoadError> {
        let mut at = 0usize;
        while at + SIGNATURE.len() <= buf.len() {
            if &buf[at..at + 8] == SIGNATURE {
                return Self::superblock(buf, at);
            }
            at = if at == 0 { 512 } else { at * 2 };
        }
        Err(malformed("no superblock signature"))
    }

    fn superblock(buf: &'a [u8], at: usize) -> Result<(Self, u64), LoadError> {
        let mut c = Cur {
            buf,
            pos: at + 8,
            offset_size: 8,
            length_size: 8,
        };
        let version = c.u8()?;
        let root = match version {
            0 | 1 => {
                c.skip(4)?;
                c.offset_size = usize::from(c.u8()?);
                c.length_size = usize::from(c.u8()?);
                c.skip(1 + 2 + 2 + 4)?;
                if version == 1 {
                    c.skip(4)?;
                }
                for _ in 0..4 {
                    c.address()?;
                }
                // root group symbol table entry
                c.address()?;
                c.address()?
            }
            2 | 3 => {
                c.offset_size = usize::from(c.u8()?);
                c.length_size = usize::from(c.u8()?);
                c.skip(1)?;
                for _ in 0..3 {
                    c.address()?;
                }
                c.address()?
            }
            v => return Err(LoadError::Unsupported(format!("HDF5 superblock version {}", v))),
        };
        if !matches!(c.offset_size, 2 | 4 | 8) || !matches!(c.length_size, 2 | 4 | 8) {
            return Err(malformed("unsupported offset/length sizes"));
        }
        let root = root.ok_or_else(|| malformed("undefined root group address"))?;
        log::debug!(
            "HDF5 superblock v{} at {}, offsets {} bytes",
            version,
            at,
            c.offset_size
        );
        Ok((
            Self {
                buf,
                base: at,
                offset_size: c.offset_size,
                length_size: c.length_size,
                budget: Cell::new(buf.len() / 16 + 16),
            },
            root,
        ))
    }

    fn cursor(&self, address: u64) -> Result<Cur<'a>, LoadError> {
        let pos = usize::try_from(address)
            .ok()
            .and_then(|a| a.checked_add(self.base))
            .filter(|&pos| pos <= self.buf.len())
            .ok_or_else(|| malformed(format!("address {} outside file", address)))?;
        Ok(Cur {
            buf: self.buf,
            pos,
            offset_size: self.offset_size,
            length_size: self.length_size,
        })
    }

    fn bytes(&self, address: u64, len: usize) -> Result<&'a [u8], LoadError> {
        self.cursor(address)?.take(len)
    }

    // ── object headers ────────────────────────────────────────────

    fn messages(&self, address: u64) -> Result<Vec<Message<'a>>, LoadError> {
        let mut c = self.cursor(address)?;
        let mut out = Vec::new();
        let mut blocks: Vec<(usize, usize)> = Vec::new();
        let v2 = c.buf.get(c.pos..c.pos.saturating_add(4)) == Some(b"OHDR".as_slice());

        let track_order;
        if v2 {
            c.skip(4)?;
            let _version = c.u8()?;
            let flags = c.u8()?;
            if flags & 0x20 != 0 {
                c.skip(16)?;
            }
            if flags & 0x10 != 0 {
                c.skip(4)?;
            }
            let size = c.uint(1 << (flags & 0x03))? as usize;
            track_order = flags & 0x04 != 0;
            blocks.push((c.pos, c.pos.saturating_add(size)));
        } else {
            let version = c.u8()?;
            if version != 1 {
                return Err(LoadError::Unsupported(format!("HDF5 object header version {}", version)));
            }
            c.skip(3)?;
            c.skip(4)?;
            let size = c.u32()? as usize;
            c.skip(4)?;
            track_order = false;
            blocks.push((c.pos, c.pos.saturating_add(size)));
        }

        let mut next = 0;
        while next < blocks.len() {
            let (start, end) = blocks[next];
            next += 1;
            let mut m = Cur { pos: start, ..self.cursor(0)? };
            let header_len = if v2 { 4 + usize::from(track_order) * 2 } else { 8 };
            while m.pos.saturating_add(header_len) <= end {
                let (kind, size) = if v2 {
                    let kind = u16::from(m.u8()?);
                    let size = usize::from(m.u16()?);
                    m.skip(1)?;
                    if track_order {
                        m.skip(2)?;
                    }
                    (kind, size)
                } else {
                    let kind = m.u16()?;
                    let size = usize::from(m.u16()?);
                    m.skip(4)?;
                    (kind, size)
                };
                let data = m.take(size)?;
                if kind == msg::CONTINUATION {
                    let mut k = Cur { buf: data, pos: 0, ..self.cursor(0)? };
                    let at = k.address()?.ok_or_else(|| malformed("undefined continuation"))?;
                    let len = usize::try_from(k.length()?).unwrap_or(usize::MAX);
                    let pos = self.cursor(at)?.pos;
                    let end = pos
                        .checked_add(len)
                        .filter(|&end| end <= self.buf.len())
                        .ok_or_else(|| malformed("continuation block past end of file"))?;
                    if blocks.len() >= MAX_BLOCKS {
                        return Err(malformed("too many continuation blocks"));
                    }
                    if v2 {
                        // "OCHK" signature and trailing checksum
                        if len < 8 {
                            return Err(malformed("continuation block too short"));
                        }
                        blocks.push((pos + 4, end - 4));
                    } else {
                        blocks.push((pos, end));
                    }
                } else if kind != 0 {
                    out.push(Message { kind, data });
                }
            }
        }
        Ok(out)
    }

    // ── groups ────────────────────────────────────────────────────

    fn heap_data(&self, heap: u64) -> Result<u64, LoadError> {
        let mut c = self.cursor(heap)?;
        if c.take(4)? != b"HEAP" {
            return Err(malformed("bad local heap signature"));
        }
        c.skip(4)?;
        c.length()?;
        c.length()?;
        c.address()?.ok_or_else(|| malformed("local heap without data segment"))
    }

    fn heap_name(&self, data: u64, offset: u64) -> Result<String, LoadError> {
        let at = data
            .checked_add(offset)
            .ok_or_else(|| malformed("heap name offset overflows"))?;
        self.cursor(at)?.cstr()
    }

    /// Leaf entries (key, child address) of a v1 B-tree.
    fn btree_leaves(&self, root: u64, key_len: usize) -> Result<Vec<(Vec<u8>, u64)>, LoadError> {
        let mut out = Vec::new();
        let mut seen = HashSet::new();
        self.btree_children(root, key_len, &mut out, &mut seen, 0)?;
        Ok(out)
    }

    fn btree_children(
        &self,
        node: u64,
        key_len: usize,
        out: &mut Vec<(Vec<u8>, u64)>,
        seen: &mut HashSet<u64>,
        depth: usize,
    ) -> Result<(), LoadError> {
        if depth > MAX_DEPTH {
            return Err(malformed("B-tree too deep"));
        }
        if !seen.insert(node) {
            return Err(malformed(format!("B-tree node {} visited twice", node)));
        }
        let mut c = self.cursor(node)?;
        if c.take(4)? != b"TREE" {
            return Err(malformed("bad B-tree signature"));
        }
        let _node_type = c.u8()?;
        let level = c.u8()?;
        let entries = usize::from(c.u16()?);
        c.address()?;
        c.address()?;
        for _ in 0..entries {
            let key = c.take(key_len)?.to_vec();
            let child = c.address()?.ok_or_else(|| malformed("undefined B-tree child"))?;
            if level > 0 {
                self.btree_children(child, key_len, out, seen, depth + 1)?;
            } else {
                out.push((key, child));
            }
        }
        Ok(())
    }

    /// Members of a group as (name, object header address), sorted by name.
    fn group_members(&self, messages: &[Message]) -> Result<Vec<(String, u64)>, LoadError> {
        let mut members = Vec::new();
        for m in messages {
            let mut c = Cur { buf: m.data, pos: 0, ..self.cursor(0)? };
            match m.kind {
                msg::SYMBOL_TABLE => {
                    let btree = c.address()?.ok_or_else(|| malformed("group without B-tree"))?;
                    let heap = c.address()?.ok_or_else(|| malformed("group without heap"))?;
                    let heap_data = self.heap_data(heap)?;
                    for (_, snod) in self.btree_leaves(btree, self.length_size)? {
                        let mut s = self.cursor(snod)?;
                        if s.take(4)? != b"SNOD" {
                            return Err(malformed("bad symbol node signature"));
                        }
                        s.skip(2)?;
                        let count = s.u16()?;
                        for _ in 0..count {
                            let name_off = s.length_or_address()?;
                            let header = s.address()?.ok_or_else(|| malformed("undefined symbol"))?;
                            s.skip(24)?;
                            members.push((self.heap_name(heap_data, name_off)?, header));
                        }
                    }
                }
                msg::LINK => {
                    let _version = c.u8()?;
                    let flags = c.u8()?;
                    let link_type = if flags & 0x08 != 0 { c.u8()? } else { 0 };
                    if flags & 0x04 != 0 {
                        c.skip(8)?;
                    }
                    if flags & 0x10 != 0 {
                        c.skip(1)?;
                    }
                    let name_len = c.uint(1 << (flags & 0x03))? as usize;
                    let name = String::from_utf8_lossy(c.take(name_len)?).into_owned();
                    if link_type == 0 {
                        if let Some(addr) = c.address()? {
                            members.push((name, addr));
                        }
                    }
                }
                msg::LINK_INFO => {
                    c.skip(2)?;
                    if m.data.get(1).is_some_and(|f| f & 0x01 != 0) {
                        c.skip(8)?;
                    }
                    if c.address()?.is_some() {
                        return Err(LoadError::Unsupported("HDF5 dense link storage".into()));
                    }
                }
                _ => {}
            }
        }
        members.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(members)
    }

    // ── datasets ──────────────────────────────────────────────────

    /// Raw row-major element bytes of a dataset.
    fn dataset_bytes(&self, messages: &[Message], dims: &[u64], dtype: &Datatype) -> Result<Vec<u8>, LoadError> {
        let elsize = dtype.size();
        if elsize == 0 {
            return Err(malformed("datatype of zero size"));
        }
        let total = dims
            .iter()
            .try_fold(elsize, |acc, &d| usize::try_from(d).ok().and_then(|d| acc.checked_mul(d)))
            .ok_or_else(|| LoadError::CorruptHeader(format!("HDF5 dataspace {:?} overflows", dims)))?;
        // fill-value and compressed data may exceed the file, within the deflate ratio
        let limit = self.buf.len().saturating_mul(MAX_INFLATION);
        if total > limit {
            return Err(LoadError::CorruptHeader(format!(
                "HDF5 dataset of {} bytes cannot come from a {} byte file",
                total,
                self.buf.len()
            )));
        }
        let layout = messages
            .iter()
            .find(|m| m.kind == msg::LAYOUT)
            .ok_or_else(|| malformed("dataset without layout"))
            .and_then(|m| parse_layout(m.data, self.offset_size, self.length_size))?;
        let filters = match messages.iter().find(|m| m.kind == msg::FILTERS) {
            Some(m) => parse_filters(m.data)?,
            None => Vec::new(),
        };

        match layout {
            Layout::Compact(bytes) => Ok(bytes),
            Layout::Contiguous(None) => Ok(vec![0; total]),
            Layout::Contiguous(Some(addr)) => Ok(self.bytes(addr, total)?.to_vec()),
            Layout::Chunked { btree: None, .. } => Ok(vec![0; total]),
            Layout::Chunked {
                btree: Some(btree),
                dims: chunk_dims,
            } => {
                let rank = chunk_dims.len().saturating_sub(1);
                if rank != dims.len() {
                    return Err(malformed("chunk rank does not match dataspace"));
                }
                let chunk = &chunk_dims[..rank];
                if chunk.contains(&0) {
                    return Err(malformed("chunk with a zero dimension"));
                }
                let chunk_bytes = chunk
                    .iter()
                    .try_fold(elsize, |acc, &d| usize::try_from(d).ok().and_then(|d| acc.checked_mul(d)))
                    .filter(|&n| n <= limit)
                    .ok_or_else(|| LoadError::CorruptHeader(format!("HDF5 chunk {:?} overflows", chunk)))?;
                let mut out = vec![0u8; total];
                for (key, addr) in self.btree_leaves(btree, 8 + 8 * chunk_dims.len())? {
                    let size = LittleEndian::read_u32(&key[..4]) as usize;
                    let mask = LittleEndian::read_u32(&key[4..8]);
                    let origin: Vec<u64> = (0..rank)
                        .map(|d| LittleEndian::read_u64(&key[8 + 8 * d..16 + 8 * d]))
                        .collect();
                    let raw = unfilter(self.bytes(addr, size)?, &filters, mask, elsize, chunk_bytes)?;
                    scatter_chunk(&raw, chunk, &origin, dims, elsize, &mut out);
                }
                Ok(out)
            }
        }
    }

    fn attributes(&self, messages: &[Message<'a>]) -> Vec<Attribute<'a>> {
        messages
            .iter()
            .filter(|m| m.kind == msg::ATTRIBUTE)
            .filter_map(|m| parse_attribute(m.data).ok())
            .collect()
    }

    /// Decode the object at `address` into a MATLAB value.
    fn value(&self, address: u64, depth: usize) -> Result<MatValue, LoadError> {
        if depth > MAX_DEPTH {
            return Err(malformed("object nesting too deep"));
        }
        let left = self.budget.get();
        if left == 0 {
            return Err(malformed("more objects referenced than the file can hold"));
        }
        self.budget.set(left - 1);
        let messages = self.messages(address)?;
        let attrs = self.attributes(&messages);
        let class = attrs
            .iter()
            .find(|a| a.name == "MATLAB_class")
            .map(|a| string_value(a.data, a.dtype.size()))
            .unwrap_or_else(|| "double".to_string());
        let empty = attrs
            .iter()
            .find(|a| a.name == "MATLAB_empty")
            .is_some_and(|a| a.data.iter().any(|&b| b != 0));

        if !messages.iter().any(|m| m.kind == msg::LAYOUT) {
            let mut fields = Vec::new();
            for (name, child) in self.group_members(&messages)? {
                fields.push((name, self.value(child, depth + 1)?));
            }
            return Ok(MatValue::Struct(fields));
        }

        let space = messages
            .iter()
            .find(|m| m.kind == msg::DATASPACE)
            .ok_or_else(|| malformed("dataset without dataspace"))?;
        let hdims = parse_dataspace(space.data, self.length_size)?;
        let dtype = messages
            .iter()
            .find(|m| m.kind == msg::DATATYPE)
            .ok_or_else(|| malformed("dataset without datatype"))
            .and_then(|m| {
                Datatype::parse(&mut Cur {
                    buf: m.data,
                    pos: 0,
                    offset_size: self.offset_size,
                    length_size: self.length_size,
                })
            })?;

        if empty {
            return Ok(match class.as_str() {
                "char" => MatValue::Char { dims: vec![0, 0], units: Vec::new() },
                "cell" => MatValue::Cell { dims: vec![0, 0], items: Vec::new() },
                _ => MatValue::real(vec![0, 0], Vec::new()),
            });
        }

        let mut dims: Vec<usize> = hdims.iter().rev().map(|&d| d as usize).collect();
        while dims.len() < 2 {
            dims.push(1);
        }
        let raw = self.dataset_bytes(&messages, &hdims, &dtype)?;

        match &dtype {
            Datatype::Reference { size } => {
                let mut items = Vec::new();
                for r in raw.chunks_exact(*size) {
                    let target = Cur {
                        buf: r,
                        pos: 0,
                        offset_size: *size,
                        length_size: *size,
                    }
                    .uint(*size)?;
                    items.push(self.value(target, depth + 1)?);
                }
                Ok(MatValue::Cell { dims, items })
            }
            Datatype::Compound { members, size } => {
                let field = |name: &str| -> Result<Option<Vec<f64>>, LoadError> {
                    match members.iter().find(|(n, _, _)| n == name) {
                        Some((_, offset, t)) => {
                            let values: Result<Vec<f64>, LoadError> = raw
                                .chunks_exact(*size)
                                .map(|el| number(t, el.get(*offset..*offset + t.size()).unwrap_or(&[])))
                                .collect();
                            values.map(Some)
                        }
                        None => Ok(None),
                    }
                };
                let re = field("real")?.ok_or_else(|| malformed("compound without 'real' member"))?;
                let im = field("imag")?;
                Ok(MatValue::Numeric(NumericArray { dims, re, im }))
            }
            Datatype::String { size } => {
                let units: Vec<u16> = raw.iter().map(|&b| u16::from(b)).collect();
                let mut dims = dims;
                if *size > 1 {
                    dims = vec![dims.iter().product(), *size];
                }
                Ok(MatValue::Char { dims, units })
            }
            Datatype::Fixed { .. } | Datatype::Float { .. } => {
                let values: Vec<f64> = raw
                    .chunks_exact(dtype.size())
                    .map(|el| number(&dtype, el))
                    .collect::<Result<_, _>>()?;
                if class == "char" {
                    Ok(MatValue::Char {
                        dims,
                        units: values.into_iter().map(|v| v as u16).collect(),
                    })
                } else {
                    Ok(MatValue::Numeric(NumericArray { dims, re: values, im: None }))
                }
            }
            Datatype::Other { class, .. } => Err(LoadError::Unsupported(format!(
                "HDF5 datatype class {}",
                class
            ))),
        }
    }
}

impl Cur<'_> {
    /// Heap offsets in symbol nodes are length-sized.
    fn length_or_address(&mut self) -> Result<u64, LoadError> {
        let n = self.offset_size;
        self.uint(n)
    }
}

fn string_value(data: &[u8], size: usize) -> String {
    let bytes = &data[..size.min(data.len())];
    String::from_utf8_lossy(bytes)
        .trim_end_matches(|c| c == '\0' || c == ' ')
        .to_string()
}

/// One numeric element.
fn number(dtype: &Datatype, el: &[u8]) -> Result<f64, LoadError> {
    let bad = || malformed("element shorter than its datatype");
    Ok(match *dtype {
        Datatype::Float { size: 8, big } if el.len() >= 8 => {
            if big { BigEndian::read_f64(el) } else { LittleEndian::read_f64(el) }
        }
        Datatype::Float { size: 4, big } if el.len() >= 4 => {
            f64::from(if big { BigEndian::read_f32(el) } else { LittleEndian::read_f32(el) })
        }
        Datatype::Fixed { size, signed, big } if el.len() >= size && (1..=8).contains(&size) => {
            let bytes = &el[..size];
            let raw = if big {
                bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
            } else {
                bytes.iter().rev().fold(0u64, |acc, &b| (acc << 8) | u64::from(b))
            };
            if signed {
                let shift = 64 - 8 * size as u32;
                (((raw << shift) as i64) >> shift) as f64
            } else {
                raw as f64
            }
        }
        Datatype::Float { .. } | Datatype::Fixed { .. } => return Err(bad()),
        _ => return Err(LoadError::Unsupported(format!("numeric decode of {:?}", dtype))),
    })
}

/// Undo the filter pipeline of one chunk (filters run in reverse order).
/// Inflated output stops at `limit` bytes.
fn unfilter(raw: &[u8], filters: &[u16], mask: u32, elsize: usize, limit: usize) -> Result<Vec<u8>, LoadError> {
    let mut data = raw.to_vec();
    for (i, &id) in filters.iter().enumerate().rev() {
        if mask & (1 << i) != 0 {
            continue;
        }
        data = match id {
            filter::DEFLATE => {
                let mut out = Vec::new();
                ZlibDecoder::new(data.as_slice())
                    .take(limit as u64)
                    .read_to_end(&mut out)?;
                out
            }
            filter::SHUFFLE => unshuffle(&data, elsize),
            filter::FLETCHER32 => {
                let n = data.len().saturating_sub(4);
                data.truncate(n);
                data
            }
            other => return Err(LoadError::Unsupported(format!("HDF5 filter {}", other))),
        };
    }
    Ok(data)
}

fn unshuffle(data: &[u8], elsize: usize) -> Vec<u8> {
    if elsize <= 1 {
        return data.to_vec();
    }
    let n = data.len() / elsize;
    let mut out = data.to_vec();
    for b in 0..elsize {
        for i in 0..n {
            out[i * elsize + b] = data[b * n + i];
        }
    }
    out
}

/// Copy a decoded chunk into the row-major dataset buffer, clipping at the
/// dataset edges.
fn scatter_chunk(raw: &[u8], chunk: &[u64], origin: &[u64], dims: &[u64], elsize: usize, out: &mut [u8]) {
    let rank = dims.len();
    if elsize == 0 || chunk.contains(&0) {
        return;
    }
    // elements past the decoded bytes have nothing to copy
    let count = chunk
        .iter()
        .try_fold(1u64, |acc, &d| acc.checked_mul(d))
        .map_or(usize::MAX, |n| usize::try_from(n).unwrap_or(usize::MAX))
        .min(raw.len() / elsize);
    let mut index = vec![0u64; rank];
    for k in 0..count {
        let mut rem = k as u64;
        for d in (0..rank).rev() {
            index[d] = rem % chunk[d];
            rem /= chunk[d];
        }
        let mut flat = 0u64;
        let mut inside = true;
        for d in 0..rank {
            let g = match origin[d].checked_add(index[d]) {
                Some(g) if g < dims[d] => g,
                _ => {
                    inside = false;
                    break;
                }
            };
            flat = flat * dims[d] + g;
        }
        if !inside {
            continue;
        }
        let src = k * elsize;
        let dst = flat as usize * elsize;
        if dst + elsize <= out.len() {
            out[dst..dst + elsize].copy_from_slice(&raw[src..src + elsize]);
        }
    }
}

/// Decode the top-level variables of a MATLAB v7.3 file, by name.
pub fn parse_mat73(bytes: &[u8]) -> Result<Vec<(String, MatValue)>, LoadError> {
    let (file, root) = Hdf5::open(bytes)?;
    let messages = file.messages(root)?;
    let mut variables = Vec::new();
    for (name, address) in file.group_members(&messages)? {
        if name.starts_with('#') {
            continue;
        }
        variables.push((name, file.value(address, 0)?));
    }
    Ok(variables)
}
