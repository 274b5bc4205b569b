//! `ecal-fit` library crate.
//!
//! Fits HPGe gamma-ray calibration peaks in binned spectra and the energy
//! resolution curve across lines. The binary (`ecal`) is a thin wrapper
//! around this library so that:
//!
//! - core logic is testable without spawning processes
//! - the fitters are reusable from other calibration tooling
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod report;
