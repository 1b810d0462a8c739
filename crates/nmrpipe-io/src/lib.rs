//! NMR binary I/O utilities: byte-swapping, word decoding under an explicit
//! byte-order flag, and NMRPipe file reading.

pub mod byteswap;
pub mod reader;

pub use byteswap::*;
pub use reader::*;
