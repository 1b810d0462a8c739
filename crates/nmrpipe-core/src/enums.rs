//! Enumerations for NMRPipe header fields.

use std::fmt;

// ─── Data Type / Quad Flag (FDQUADFLAG, NDQUADFLAG) ─────────────────────────

/// Quadrature / data type codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum QuadFlag {
    /// Complex (quad detected).
    Complex = 0,
    /// Real (singlature).
    Real = 1,
    /// Pseudo-quad (treated as real on output).
    PseudoQuad = 2,
}

impl QuadFlag {
    pub fn from_i32(v: i32) -> Option<Self> {
        match v {
            0 => Some(Self::Complex),
            1 => Some(Self::Real),
            2 => Some(Self::PseudoQuad),
            _ => None,
        }
    }

    pub fn is_complex(self) -> bool {
        self == Self::Complex
    }
}

impl fmt::Display for QuadFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Complex => write!(f, "Complex"),
            Self::Real => write!(f, "Real"),
            Self::PseudoQuad => write!(f, "Pseudo-quad"),
        }
    }
}

// ─── Header byte order ──────────────────────────────────────────────────────

/// Byte order of a header as found on disk, relative to big-endian.
///
/// NMRPipe writes in the byte order of the machine that produced the file;
/// the FDFLTORDER slot holds a known constant that reveals which one it was.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HdrOrder {
    Little,
    Big,
}

impl fmt::Display for HdrOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Little => write!(f, "little-endian"),
            Self::Big => write!(f, "big-endian"),
        }
    }
}
