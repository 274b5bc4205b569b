//! Input/output helpers.
//!
//! - JSON run-file ingest + validation (`ingest`)
//! - per-line results export (`export`)
//! - resolution-curve JSON read/write (`curve`)

pub mod curve;
pub mod export;
pub mod ingest;

pub use curve::*;
pub use export::*;
pub use ingest::*;
