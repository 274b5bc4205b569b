//! Input-side helpers: synthetic histograms and quick peak statistics.

pub mod sample;
pub mod stats;

pub use sample::*;
