//! NMRPipe core types: the FDATA header and its enums.
//!
//! The header is the 512-float block at the start of every NMRPipe file.
//! This crate knows where parameters live inside it and which byte order
//! the block was written in; it does not touch the sample data.

pub mod enums;
pub mod fdata;

pub use enums::*;
pub use fdata::*;
