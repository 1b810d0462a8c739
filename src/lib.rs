//! Multi-vendor NMR data ingestion, a reversible command engine with
//! undo/redo, and macro recording and replay.

pub mod data;
pub mod log;
pub mod pipeline;
pub mod session;
